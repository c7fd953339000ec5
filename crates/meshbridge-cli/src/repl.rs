//! REPL – Read-Eval-Print Loop for the meshbridge interactive shell.
//!
//! Supported slash-commands:
//!   /help                         – show this list
//!   /settings                     – interactively edit `~/.meshbridge/config.toml`
//!   /status                       – radio, bus and join-window status
//!   /start | /stop                – start or stop the radio network
//!   /connect | /disconnect        – open or drop the bus session
//!   /permit [secs]                – open the join window (default 60 s)
//!   /close                        – close the join window
//!   /devices                      – list known devices
//!   /state <ieee>                 – show a device's state
//!   /set <ieee> <state> <value>   – write a state value (JSON, or a bare string)
//!   /remove <ieee>                – force a device off the network
//!   /sim-join <ieee> [model] [vendor]
//!   /sim-report <ieee> <cluster> <attribute> <value>
//!   /sim-leave <ieee> | /sim-announce <ieee>
//!   /inject <topic> <json>        – publish on the broker as another client
//!   /published [n]                – last `n` messages the bridge published
//!   /quit | /exit                 – gracefully exit the shell

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use meshbridge_hal::SimRadioHandle;
use meshbridge_kernel::DEFAULT_PERMIT_JOIN_SECS;
use meshbridge_middleware::LoopbackBroker;
use meshbridge_runtime::BridgeCore;
use meshbridge_types::{BridgeError, DeviceId};
use serde_json::Value;
use tokio::runtime::Runtime;

use crate::config::{self, Config};

const DEFAULT_PUBLISHED_TAIL: usize = 10;

/// A parsed shell line.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Help,
    Settings,
    Status,
    Start,
    Stop,
    Connect,
    Disconnect,
    Permit(u16),
    Close,
    Devices,
    State(DeviceId),
    Set {
        device: DeviceId,
        state: String,
        value: Value,
    },
    Remove(DeviceId),
    SimJoin {
        device: DeviceId,
        model: Option<String>,
        manufacturer: Option<String>,
    },
    SimReport {
        device: DeviceId,
        cluster: u16,
        attribute: u16,
        value: Value,
    },
    SimLeave(DeviceId),
    SimAnnounce(DeviceId),
    Inject {
        topic: String,
        payload: String,
    },
    Published(usize),
    Quit,
}

/// Whether the loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Parse one input line.  The error is a usage message for the user.
pub fn parse(line: &str) -> Result<ShellCommand, String> {
    let (head, rest) = split_word(line.trim()).unwrap_or(("", ""));
    let mut args = rest.split_whitespace();

    let cmd = match head {
        "/help" => ShellCommand::Help,
        "/settings" => ShellCommand::Settings,
        "/status" => ShellCommand::Status,
        "/start" => ShellCommand::Start,
        "/stop" => ShellCommand::Stop,
        "/connect" => ShellCommand::Connect,
        "/disconnect" => ShellCommand::Disconnect,
        "/permit" => match args.next() {
            None => ShellCommand::Permit(DEFAULT_PERMIT_JOIN_SECS),
            Some(raw) => ShellCommand::Permit(
                raw.parse()
                    .map_err(|_| format!("'{raw}' is not a number of seconds"))?,
            ),
        },
        "/close" => ShellCommand::Close,
        "/devices" => ShellCommand::Devices,
        "/state" => ShellCommand::State(device_arg(args.next(), "/state <ieee>")?),
        "/set" => {
            let usage = "/set <ieee> <state> <value>";
            let (device, tail) = split_word(rest).ok_or(usage)?;
            let (state, value) = split_word(tail).ok_or(usage)?;
            if value.is_empty() {
                return Err(usage.to_string());
            }
            ShellCommand::Set {
                device: device_arg(Some(device), usage)?,
                state: state.to_string(),
                value: parse_value(value),
            }
        }
        "/remove" => ShellCommand::Remove(device_arg(args.next(), "/remove <ieee>")?),
        "/sim-join" => ShellCommand::SimJoin {
            device: device_arg(args.next(), "/sim-join <ieee> [model] [vendor]")?,
            model: args.next().map(str::to_string),
            manufacturer: args.next().map(str::to_string),
        },
        "/sim-report" => {
            let usage = "/sim-report <ieee> <cluster> <attribute> <value>";
            let device = device_arg(args.next(), usage)?;
            let cluster = number_arg(args.next(), usage)?;
            let attribute = number_arg(args.next(), usage)?;
            let value: Vec<&str> = args.collect();
            if value.is_empty() {
                return Err(usage.to_string());
            }
            ShellCommand::SimReport {
                device,
                cluster,
                attribute,
                value: parse_value(&value.join(" ")),
            }
        }
        "/sim-leave" => ShellCommand::SimLeave(device_arg(args.next(), "/sim-leave <ieee>")?),
        "/sim-announce" => {
            ShellCommand::SimAnnounce(device_arg(args.next(), "/sim-announce <ieee>")?)
        }
        "/inject" => {
            let usage = "/inject <topic> <json>";
            let (topic, payload) = split_word(rest).ok_or(usage)?;
            if payload.is_empty() {
                return Err(usage.to_string());
            }
            ShellCommand::Inject {
                topic: topic.to_string(),
                payload: payload.to_string(),
            }
        }
        "/published" => match args.next() {
            None => ShellCommand::Published(DEFAULT_PUBLISHED_TAIL),
            Some(raw) => ShellCommand::Published(
                raw.parse().map_err(|_| format!("'{raw}' is not a count"))?,
            ),
        },
        "/quit" | "/exit" => ShellCommand::Quit,
        other => return Err(format!("Unknown command: '{other}'")),
    };
    Ok(cmd)
}

/// JSON when it parses, otherwise the raw text as a string.
///
/// `true`, `42` and `{"a":1}` become JSON values; `ON` becomes `"ON"`.
pub fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// The objects a shell session drives.
pub struct Session<'a> {
    pub runtime: &'a Runtime,
    pub core: &'a BridgeCore,
    pub sim: &'a SimRadioHandle,
    pub broker: &'a LoopbackBroker,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(session: &Session<'_>, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "meshbridge>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        match parse(&line) {
            Ok(cmd) => {
                if session.execute(cmd) == Flow::Quit {
                    println!("{}", "Goodbye.".green());
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            }
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }
    }
}

impl Session<'_> {
    /// Run one command, printing its outcome.
    pub fn execute(&self, cmd: ShellCommand) -> Flow {
        let rt = self.runtime;
        let core = self.core;
        match cmd {
            ShellCommand::Help => cmd_help(),
            ShellCommand::Settings => cmd_settings(),
            ShellCommand::Status => self.cmd_status(),
            ShellCommand::Start => report("Radio network started", rt.block_on(core.start())),
            ShellCommand::Stop => report("Radio network stopped", rt.block_on(core.stop())),
            ShellCommand::Connect => report("Bus connected", rt.block_on(core.connect_bus())),
            ShellCommand::Disconnect => {
                rt.block_on(core.disconnect_bus());
                println!("{}", "✓ Bus disconnected".green());
            }
            ShellCommand::Permit(secs) => report(
                &format!("Join window open for {secs}s"),
                rt.block_on(core.permit_join(secs)),
            ),
            ShellCommand::Close => {
                report("Join window closed", rt.block_on(core.close_permit_join()))
            }
            ShellCommand::Devices => self.cmd_devices(),
            ShellCommand::State(device) => self.cmd_state(&device),
            ShellCommand::Set {
                device,
                state,
                value,
            } => report(
                &format!("{state} = {value}"),
                rt.block_on(core.update_state(device, &state, value)),
            ),
            ShellCommand::Remove(device) => report(
                &format!("{device} removed"),
                rt.block_on(core.remove_device(device)),
            ),
            ShellCommand::SimJoin {
                device,
                model,
                manufacturer,
            } => sim_report(rt.block_on(self.sim.join(
                device,
                model.as_deref(),
                manufacturer.as_deref(),
            ))),
            ShellCommand::SimReport {
                device,
                cluster,
                attribute,
                value,
            } => sim_report(rt.block_on(self.sim.report(device, cluster, attribute, value))),
            ShellCommand::SimLeave(device) => sim_report(rt.block_on(self.sim.leave(device))),
            ShellCommand::SimAnnounce(device) => {
                sim_report(rt.block_on(self.sim.announce(device)))
            }
            ShellCommand::Inject { topic, payload } => {
                if rt.block_on(self.broker.inject(&topic, payload.as_bytes())) {
                    println!("{} {}", "✓ Delivered on".green(), topic.bold());
                } else {
                    println!(
                        "{} {} (bus not connected or topic not subscribed)",
                        "✗ Not delivered:".yellow(),
                        topic
                    );
                }
            }
            ShellCommand::Published(n) => self.cmd_published(n),
            ShellCommand::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    fn cmd_status(&self) {
        let on_off = |on: bool| if on { "yes".green() } else { "no".red() };
        println!("{}", "Bridge Status".bold().underline());
        println!("  Radio started     : {}", on_off(self.core.is_radio_started()));
        println!("  Bus connected     : {}", on_off(self.core.is_bus_connected()));
        let window = self.core.controller().snapshot().permit_join.clone();
        let now = std::time::Instant::now();
        match window.remaining(now).filter(|_| window.is_open_at(now)) {
            Some(left) => println!(
                "  Join window open  : {} ({}s left)",
                on_off(true),
                left.as_secs()
            ),
            None => println!("  Join window open  : {}", on_off(false)),
        }
        println!("  Known devices     : {}", self.core.devices().len());
        println!("  Definitions       : {}", self.core.registry().len());
    }

    fn cmd_devices(&self) {
        let devices = self.core.devices();
        if devices.is_empty() {
            println!("  {}", "No devices known.".dimmed());
            return;
        }
        println!("{}", "Devices".bold().underline());
        for d in &devices {
            let definition = match &d.definition_model {
                Some(model) => model.green(),
                None => "unidentified".yellow(),
            };
            println!(
                "  {}  {:<12} {:<12} {:<8} {}  last seen {}",
                d.id.to_string().bold(),
                d.model_id,
                d.manufacturer,
                d.status,
                definition,
                d.last_seen
                    .with_timezone(&chrono::Local)
                    .format("%H:%M:%S")
                    .to_string()
                    .dimmed()
            );
        }
    }

    fn cmd_state(&self, device: &DeviceId) {
        if self.core.device(device).is_none() {
            println!("{} {}", "Unknown device:".red(), device);
            return;
        }
        let state = self.core.device_state(device);
        if state.is_empty() {
            println!("  {}", "No state tracked for this device.".dimmed());
            return;
        }
        for (name, value) in &state {
            println!("  {:<16} {}", name.bold(), value);
        }
    }

    fn cmd_published(&self, n: usize) {
        let published = self.broker.published();
        let start = published.len().saturating_sub(n);
        if published.is_empty() {
            println!("  {}", "Nothing published yet.".dimmed());
        }
        for msg in &published[start..] {
            let body = msg
                .json()
                .map(|v| v.to_string())
                .unwrap_or_else(|| String::from_utf8_lossy(&msg.payload).into_owned());
            println!("  {} {}", msg.topic.cyan(), body);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "meshbridge Commands".bold().underline());
    let rows = [
        ("/settings", "edit ~/.meshbridge/config.toml"),
        ("/status", "radio, bus and join-window status"),
        ("/start  /stop", "start or stop the radio network"),
        ("/connect  /disconnect", "open or drop the bus session"),
        ("/permit [secs]", "open the join window (default 60 s)"),
        ("/close", "close the join window"),
        ("/devices", "list known devices"),
        ("/state <ieee>", "show a device's state"),
        ("/set <ieee> <state> <value>", "write a state value"),
        ("/remove <ieee>", "force a device off the network"),
        ("/sim-join <ieee> [model] [vendor]", "simulate a device joining"),
        ("/sim-report <ieee> <cl> <attr> <v>", "simulate an attribute report"),
        ("/sim-leave  /sim-announce <ieee>", "simulate a leave or announce"),
        ("/inject <topic> <json>", "publish on the broker as another client"),
        ("/published [n]", "last messages the bridge published"),
        ("/quit  /exit", "exit the shell"),
    ];
    for (cmd, what) in rows {
        println!("  {:<36} – {}", cmd.bold().cyan(), what);
    }
    println!();
}

fn cmd_settings() {
    let mut cfg = match config::load() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            println!("{}: {}", "Error loading config".red(), e);
            return;
        }
    };

    println!("{}", "Settings Editor".bold().underline());
    println!("  (press Enter to keep the current value)");
    edit_settings(&mut cfg);

    if let Err(e) = cfg.validate() {
        println!("{}: {}", "Settings not saved".red(), e);
        return;
    }
    match config::save(&cfg) {
        Ok(()) => {
            println!(
                "{} {}",
                "✓ Settings saved to".green(),
                config::config_path().display().to_string().bold()
            );
            println!("  {}", "Restart meshbridge to apply them.".dimmed());
        }
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

/// Prompt for every persisted setting.  Shared with the first-run wizard.
pub fn edit_settings(cfg: &mut Config) {
    cfg.mqtt.broker = prompt_str(&format!("  MQTT broker    [{}]: ", cfg.mqtt.broker), &cfg.mqtt.broker);
    cfg.mqtt.port = prompt_u16(&format!("  MQTT port      [{}]: ", cfg.mqtt.port), cfg.mqtt.port);
    cfg.mqtt.username = prompt_str(
        &format!("  MQTT username  [{}]: ", cfg.mqtt.username),
        &cfg.mqtt.username,
    );
    let shown = if cfg.mqtt.password.is_empty() { "<not set>" } else { "<redacted>" };
    let password = prompt_str(&format!("  MQTT password  [{shown}]: "), "");
    if !password.is_empty() {
        cfg.mqtt.password = password;
    }
    cfg.zigbee.port = prompt_str(&format!("  Serial port    [{}]: ", cfg.zigbee.port), &cfg.zigbee.port);
    let channel = prompt_u16(
        &format!("  Channel        [{}]: ", cfg.zigbee.channel),
        cfg.zigbee.channel.into(),
    );
    cfg.zigbee.channel = u8::try_from(channel).unwrap_or(cfg.zigbee.channel);
    cfg.zigbee.pan_id = prompt_str(&format!("  PAN id         [{}]: ", cfg.zigbee.pan_id), &cfg.zigbee.pan_id);
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn report(done: &str, result: Result<(), BridgeError>) {
    match result {
        Ok(()) => println!("{} {}", "✓".green().bold(), done),
        Err(e) => println!("{} {}", "✗".red().bold(), e.to_string().red()),
    }
}

fn sim_report(delivered: bool) {
    if delivered {
        println!("{}", "  ✓ event sent to the radio".dimmed());
    } else {
        println!("{}", "  ✗ radio not started, event dropped".yellow());
    }
}

/// First word and the trimmed remainder.
fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    Some(match s.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (s, ""),
    })
}

fn device_arg(raw: Option<&str>, usage: &str) -> Result<DeviceId, String> {
    let raw = raw.ok_or_else(|| format!("usage: {usage}"))?;
    raw.parse().map_err(|e: BridgeError| e.to_string())
}

/// Decimal or `0x` hex.
fn number_arg(raw: Option<&str>, usage: &str) -> Result<u16, String> {
    let raw = raw.ok_or_else(|| format!("usage: {usage}"))?;
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| format!("'{raw}' is not a 16-bit number"))
}

/// Prompt for a u16 value.  Returns `default` when the user presses Enter.
fn prompt_u16(msg: &str, default: u16) -> u16 {
    let raw = prompt_str(msg, &default.to_string());
    match raw.parse::<u16>() {
        Ok(v) => v,
        Err(_) => {
            println!(
                "  {} '{}' is not a valid number, keeping {}",
                "Warning:".yellow(),
                raw,
                default
            );
            default
        }
    }
}

/// Prompt for a string value.  Returns `default` when the user presses Enter.
pub fn prompt_str(msg: &str, default: &str) -> String {
    print!("{}", msg);
    io::stdout().flush().ok();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() {
                default.to_string()
            } else {
                trimmed
            }
        }
        Err(_) => default.to_string(),
    }
}
