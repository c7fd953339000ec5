//! Configuration Vault – reads/writes `~/.meshbridge/config.toml`.
//!
//! ```toml
//! definitions_dir = "definitions"
//! base_topic = "bridge"
//! command_timeout_secs = 10
//!
//! [mqtt]
//! broker = "localhost"
//! port = 8883
//! username = "bridge"
//! password = "..."
//!
//! [zigbee]
//! port = "/dev/ttyUSB0"
//! channel = 11
//! pan_id = "0x1a62"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroize;

use meshbridge_hal::{RadioConfig, parse_pan_id};
use meshbridge_runtime::{BridgeConfig, BrokerSettings};
use meshbridge_types::BridgeError;

/// Broker endpoint and credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_broker")]
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// Stored as plain text; the file itself is owner-only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl Drop for MqttSection {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            port: default_mqtt_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Coordinator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZigbeeSection {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_channel")]
    pub channel: u8,

    /// Hex, with or without `0x`.
    #[serde(default = "default_pan_id")]
    pub pan_id: String,
}

impl Default for ZigbeeSection {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            channel: default_channel(),
            pan_id: default_pan_id(),
        }
    }
}

/// Persisted user configuration stored in `~/.meshbridge/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: String,

    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// How long the shell waits for the network controller.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub mqtt: MqttSection,

    #[serde(default)]
    pub zigbee: ZigbeeSection,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("definitions_dir", &self.definitions_dir)
            .field("base_topic", &self.base_topic)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .field("broker", &self.mqtt.broker)
            .field("mqtt_port", &self.mqtt.port)
            .field("username", &self.mqtt.username)
            .field(
                "password",
                if self.mqtt.password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("zigbee", &self.zigbee)
            .finish()
    }
}

fn default_broker() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    8883
}
fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_channel() -> u8 {
    11
}
fn default_pan_id() -> String {
    "0x1a62".to_string()
}
fn default_definitions_dir() -> String {
    "definitions".to_string()
}
fn default_base_topic() -> String {
    "bridge".to_string()
}
fn default_command_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definitions_dir: default_definitions_dir(),
            base_topic: default_base_topic(),
            command_timeout_secs: default_command_timeout(),
            mqtt: MqttSection::default(),
            zigbee: ZigbeeSection::default(),
        }
    }
}

impl Config {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.mqtt.broker.trim().is_empty() {
            return Err(BridgeError::Configuration("mqtt broker must not be empty".into()));
        }
        if self.mqtt.port < 1024 {
            return Err(BridgeError::Configuration(format!(
                "mqtt port must be 1024-65535, got {}",
                self.mqtt.port
            )));
        }
        if !(1..=26).contains(&self.zigbee.channel) {
            return Err(BridgeError::Configuration(format!(
                "zigbee channel must be 1-26, got {}",
                self.zigbee.channel
            )));
        }
        parse_pan_id(&self.zigbee.pan_id)?;
        if self.base_topic.trim().is_empty() || self.base_topic.contains(['+', '#']) {
            return Err(BridgeError::Configuration(format!(
                "invalid base topic {:?}",
                self.base_topic
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(BridgeError::Configuration(
                "command timeout must be at least one second".into(),
            ));
        }
        Ok(())
    }

    /// Validate and convert into the runtime's configuration.
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, BridgeError> {
        self.validate()?;
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Ok(BridgeConfig {
            broker: BrokerSettings {
                host: self.mqtt.broker.trim().to_string(),
                port: self.mqtt.port,
                username: non_empty(&self.mqtt.username),
                password: non_empty(&self.mqtt.password),
            },
            radio: RadioConfig {
                serial_port: self.zigbee.port.clone(),
                channel: self.zigbee.channel,
                pan_id: parse_pan_id(&self.zigbee.pan_id)?,
                auto_form: true,
            },
            definitions_dir: PathBuf::from(&self.definitions_dir),
            base_topic: self.base_topic.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        })
    }
}

/// Return the path to `~/.meshbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".meshbridge").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `MESHBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MESHBRIDGE_BROKER` | `mqtt.broker` |
/// | `MESHBRIDGE_MQTT_PORT` | `mqtt.port` |
/// | `MESHBRIDGE_MQTT_USERNAME` | `mqtt.username` |
/// | `MESHBRIDGE_MQTT_PASSWORD` | `mqtt.password` |
/// | `MESHBRIDGE_SERIAL_PORT` | `zigbee.port` |
/// | `MESHBRIDGE_CHANNEL` | `zigbee.channel` |
/// | `MESHBRIDGE_DEFINITIONS_DIR` | `definitions_dir` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MESHBRIDGE_BROKER") {
        cfg.mqtt.broker = v;
    }
    if let Ok(v) = std::env::var("MESHBRIDGE_MQTT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.mqtt.port = port;
    }
    if let Ok(v) = std::env::var("MESHBRIDGE_MQTT_USERNAME") {
        cfg.mqtt.username = v;
    }
    if let Ok(v) = std::env::var("MESHBRIDGE_MQTT_PASSWORD") {
        cfg.mqtt.password.zeroize();
        cfg.mqtt.password = v;
    }
    if let Ok(v) = std::env::var("MESHBRIDGE_SERIAL_PORT") {
        cfg.zigbee.port = v;
    }
    if let Ok(v) = std::env::var("MESHBRIDGE_CHANNEL")
        && let Ok(channel) = v.parse::<u8>()
    {
        cfg.zigbee.channel = channel;
    }
    if let Ok(v) = std::env::var("MESHBRIDGE_DEFINITIONS_DIR") {
        cfg.definitions_dir = v;
    }
}

/// Save the config to disk, creating `~/.meshbridge/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
