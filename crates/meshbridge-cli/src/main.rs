//! `meshbridge-cli` – meshbridge Command Line Interface
//!
//! This binary is the interactive front end of the bridge.  It:
//!
//! 1. Checks for `~/.meshbridge/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Builds a [`BridgeCore`] over the in-process radio ([`SimRadio`]) and
//!    broker ([`LoopbackBroker`]).
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/start`, `/permit`, `/devices`, `/set`, `/sim-join`, `/help`, ...).
//! 4. Intercepts **Ctrl-C** to stop the radio network before exiting.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use meshbridge_hal::SimRadio;
use meshbridge_middleware::LoopbackBroker;
use meshbridge_runtime::BridgeCore;

fn main() {
    // RUST_LOG filters, MESHBRIDGE_LOG_FORMAT=json switches to JSON lines.
    let _telemetry = meshbridge_runtime::init_tracing("meshbridge");

    print_banner();

    // ── First-Run Wizard ──────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let bridge_config = match cfg.to_bridge_config() {
        Ok(c) => c,
        Err(e) => {
            println!("{}: {}", "Invalid configuration".red(), e);
            println!("  Run the settings editor or fix {}.", config::config_path().display());
            error!(error = %e, "refusing to start with invalid configuration");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build the async runtime");
            std::process::exit(1);
        }
    };

    // ── Bridge ────────────────────────────────────────────────────────────
    let (radio, sim) = SimRadio::builder().build();
    let broker = Arc::new(LoopbackBroker::new());
    let core = {
        let _guard = runtime.enter();
        BridgeCore::spawn(bridge_config, Box::new(radio), broker.clone())
    };
    println!(
        "  {} capability definition(s) loaded from {}",
        core.registry().len().to_string().bold(),
        cfg.definitions_dir.dimmed()
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    // The REPL blocks on stdin, so the handler stops the network itself.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let controller = core.controller().clone();
    let handle = runtime.handle().clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);

        match handle.block_on(controller.shutdown()) {
            Ok(()) => println!("{}", "  ✓ Radio network stopped.".green()),
            Err(e) => println!("  {} {}", "✗ Controller shutdown failed:".red(), e),
        }
        println!("{}", "  ✓ Exiting meshbridge.".green());
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    let session = repl::Session {
        runtime: &runtime,
        core: &core,
        sim: &sim,
        broker: &broker,
    };
    repl::run(&session, shutdown);

    runtime.block_on(core.shutdown());
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║     meshbridge First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up meshbridge.");
    println!("  (press Enter to accept the value in brackets)\n");

    let mut cfg = config::Config::default();
    repl::edit_settings(&mut cfg);

    if let Err(e) = cfg.validate() {
        println!("{}: {}", "Invalid settings".red(), e);
        println!("  Falling back to defaults; nothing was saved.\n");
        return config::Config::default();
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"                  _     _          _     _            "#.bold().cyan());
    println!("{}", r#"  _ __ ___   ___ ___| |__ | |__  _ __(_) __| | __ _  ___ "#.bold().cyan());
    println!("{}", r#" | '_ ` _ \ / _ / __| '_ \| '_ \| '__| |/ _` |/ _` |/ _ \"#.bold().cyan());
    println!("{}", r#" | | | | | |  __\__ \ | | | |_) | |  | | (_| | (_| |  __/"#.bold().cyan());
    println!("{}", r#" |_| |_| |_|\___|___/_| |_|_.__/|_|  |_|\__,_|\__, |\___|"#.bold().cyan());
    println!("{}", r#"                                              |___/      "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "meshbridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Mesh radio to message bus bridge");
    println!();
}
