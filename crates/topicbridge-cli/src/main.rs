//! `topicbridge` – UDP ↔ software-bus topic gateway.
//!
//! 1. Initialises logging (and OTLP export when configured).
//! 2. Loads `~/.topicbridge/config.toml`, writing the defaults on first run.
//! 3. Builds the gateway and starts the receive and transmit pipelines.
//! 4. Runs an interactive control REPL until `quit`, EOF, or Ctrl-C.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use topicbridge_middleware::SoftwareBus;
use topicbridge_runtime::{init_tracing, Gateway};
use topicbridge_types::BridgeError;

fn main() {
    let _tracing = init_tracing("topicbridge");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let gateway_config = match cfg.to_gateway_config() {
        Ok(gc) => gc,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to build Tokio runtime");
            std::process::exit(1);
        }
    };
    // Commands issued from the REPL thread spawn onto this runtime.
    let _enter = runtime.enter();

    let started = runtime.block_on(async {
        let gateway = Gateway::new(gateway_config, SoftwareBus::default())?;
        gateway.start().await?;
        Ok::<_, BridgeError>(gateway)
    });
    let gateway = match started {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            error!(error = %e, "Gateway failed to start");
            std::process::exit(1);
        }
    };

    println!(
        "  Receiving on {}  →  sending to {}",
        gateway.config().rx_addr.to_string().bold(),
        gateway.config().tx_addr.to_string().bold()
    );
    println!("  Type {} for a list of commands.\n", "help".bold().cyan());

    // ── Ctrl-C / SIGTERM ──────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        let gateway = Arc::clone(&gateway);
        let handle = runtime.handle().clone();
        if let Err(e) = ctrlc::set_handler(move || {
            if shutdown.swap(true, Ordering::SeqCst) {
                return;
            }
            println!();
            println!("{}", "⚠  Signal received – stopping pipelines …".yellow().bold());
            handle.block_on(gateway.shutdown());
            println!("{}", "  ✓ Exiting topicbridge.".green());
            std::process::exit(0);
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; use `quit` to stop the gateway");
        }
    }

    repl::run(&gateway, &shutdown);

    if !shutdown.swap(true, Ordering::SeqCst) {
        runtime.block_on(gateway.shutdown());
    }
}

/// Write the default configuration and return it.
fn first_run() -> config::Config {
    let mut cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

fn print_banner() {
    println!();
    println!(
        "  {} {}",
        "topicbridge".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  UDP ↔ software bus topic gateway");
    println!();
}
