//! [`BridgeCore`] – composition root of the bridge.
//!
//! Wires the capability registry, the bus gateway and the network controller
//! together and exposes the operations the shell (or any other front end)
//! drives.  It also runs the inbound dispatcher: commands arriving on the
//! bus command topics are parsed and forwarded to the controller.
//!
//! | Bus topic | Controller operation |
//! |---|---|
//! | `<base>/<ieee>/set` `{name: value, ...}` | `update_state` per entry |
//! | `<base>/bridge/command/permit_join` `{value: true, time?}` | `permit_join(time or 60)` |
//! | `<base>/bridge/command/permit_join` `{value: false}` | `close_permit_join` |
//! | `<base>/bridge/command/remove` `{ieee_address}` | `remove_device` |

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use meshbridge_hal::{RadioConfig, RadioStack};
use meshbridge_kernel::{CapabilityRegistry, DEFAULT_PERMIT_JOIN_SECS};
use meshbridge_middleware::topics::{DEFAULT_BASE_TOPIC, InboundCommand};
use meshbridge_middleware::{BusGateway, BusTransport, InboundMessage, Topics};
use meshbridge_types::{BridgeError, Device, DeviceId, StateMap};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network_controller::{ControllerHandle, DEFAULT_COMMAND_TIMEOUT, NetworkController};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Broker endpoint and credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Everything [`BridgeCore::spawn`] needs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker: BrokerSettings,
    pub radio: RadioConfig,
    /// Directory holding the capability definition files.
    pub definitions_dir: PathBuf,
    pub base_topic: String,
    /// Upper bound on how long a caller waits for the controller.
    pub command_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            radio: RadioConfig::default(),
            definitions_dir: PathBuf::from("definitions"),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BridgeCore
// ─────────────────────────────────────────────────────────────────────────────

/// The running bridge.
pub struct BridgeCore {
    broker: BrokerSettings,
    registry: Arc<CapabilityRegistry>,
    gateway: Arc<BusGateway>,
    controller: ControllerHandle,
    controller_task: JoinHandle<()>,
    dispatcher_task: Option<JoinHandle<()>>,
}

impl BridgeCore {
    /// Load definitions, build the gateway and controller and spawn their
    /// tasks.  Neither the radio nor the bus is started yet.
    pub fn spawn(
        config: BridgeConfig,
        radio: Box<dyn RadioStack>,
        transport: Arc<dyn BusTransport>,
    ) -> Self {
        let registry = Arc::new(CapabilityRegistry::load(&config.definitions_dir));
        let topics = Topics::new(&config.base_topic);
        let gateway = Arc::new(BusGateway::new(transport, topics.clone()));

        let (controller, controller_task) = NetworkController::new(
            radio,
            config.radio,
            Arc::clone(&registry),
            Arc::clone(&gateway),
        )
        .spawn(config.command_timeout);

        let dispatcher_task = gateway
            .take_inbound()
            .map(|inbound| tokio::spawn(dispatch_inbound(inbound, topics, controller.clone())));

        info!(
            definitions = registry.len(),
            base_topic = %gateway.topics().base(),
            "bridge core ready"
        );

        Self {
            broker: config.broker,
            registry,
            gateway,
            controller,
            controller_task,
            dispatcher_task,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the radio network, then connect the bus if it is not connected.
    /// A bus failure here is logged and does not fail the start.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.controller.start().await?;
        if !self.gateway.is_connected()
            && let Err(e) = self.connect_bus().await
        {
            warn!(error = %e, "bridge started without bus connection");
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.controller.stop().await
    }

    pub async fn connect_bus(&self) -> Result<(), BridgeError> {
        let b = &self.broker;
        self.gateway
            .connect(&b.host, b.port, b.username.as_deref(), b.password.as_deref())
            .await
    }

    pub async fn disconnect_bus(&self) {
        self.gateway.disconnect().await;
    }

    /// Stop the radio, drop the bus session and end every background task.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.controller.shutdown().await {
            warn!(error = %e, "controller shutdown failed");
        }
        self.gateway.disconnect().await;
        if let Some(task) = self.dispatcher_task.take() {
            task.abort();
        }
        if let Err(e) = (&mut self.controller_task).await {
            debug!(error = %e, "controller task ended abnormally");
        }
        info!("bridge shut down");
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub async fn permit_join(&self, secs: u16) -> Result<(), BridgeError> {
        self.controller.permit_join(secs).await
    }

    pub async fn close_permit_join(&self) -> Result<(), BridgeError> {
        self.controller.close_permit_join().await
    }

    pub async fn update_state(
        &self,
        device: DeviceId,
        state: &str,
        value: Value,
    ) -> Result<(), BridgeError> {
        self.controller.update_state(device, state, value).await
    }

    pub async fn remove_device(&self, device: DeviceId) -> Result<(), BridgeError> {
        self.controller.remove_device(device).await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn is_permit_join_active(&self) -> bool {
        self.controller.is_permit_join_active()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.controller.devices()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.controller.device(id)
    }

    pub fn device_state(&self, id: &DeviceId) -> StateMap {
        self.controller.device_state(id)
    }

    pub fn is_radio_started(&self) -> bool {
        self.controller.is_started()
    }

    pub fn is_bus_connected(&self) -> bool {
        self.gateway.is_connected()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound dispatcher
// ─────────────────────────────────────────────────────────────────────────────

async fn dispatch_inbound(
    mut inbound: mpsc::Receiver<InboundMessage>,
    topics: Topics,
    controller: ControllerHandle,
) {
    while let Some(InboundMessage { topic, payload }) = inbound.recv().await {
        match topics.parse_command(&topic, &payload) {
            Ok(Some(command)) => execute_inbound(&controller, &topic, command).await,
            Ok(None) => debug!(topic = %topic, "message on non-command topic ignored"),
            Err(e) => warn!(topic = %topic, error = %e, "malformed bus command ignored"),
        }
    }
    debug!("inbound dispatcher stopped");
}

async fn execute_inbound(controller: &ControllerHandle, topic: &str, command: InboundCommand) {
    match command {
        InboundCommand::SetState { id, values } => {
            for (state, value) in values {
                if let Err(e) = controller.update_state(id, state.as_str(), value).await {
                    warn!(topic, device = %id, state = %state, error = %e, "bus set rejected");
                }
            }
        }
        InboundCommand::PermitJoin { value: true, time } => {
            let secs = time.unwrap_or(DEFAULT_PERMIT_JOIN_SECS);
            if let Err(e) = controller.permit_join(secs).await {
                warn!(topic, secs, error = %e, "bus permit_join rejected");
            }
        }
        InboundCommand::PermitJoin { value: false, .. } => {
            if let Err(e) = controller.close_permit_join().await {
                warn!(topic, error = %e, "bus permit_join close rejected");
            }
        }
        InboundCommand::Remove { id } => {
            if let Err(e) = controller.remove_device(id).await {
                warn!(topic, device = %id, error = %e, "bus remove rejected");
            }
        }
    }
}
