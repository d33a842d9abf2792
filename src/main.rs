//! hid-passthru
//!
//! Relays a USB HID device as a Bluetooth LE HID-over-GATT peripheral and/or
//! a USB gadget.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use hid_passthru::config::PassthruConfig;
use hid_passthru::daemon::{self, DaemonOptions};
use hid_passthru::discovery::validate_name;
use hid_passthru::shutdown::ShutdownContext;

// CLI definitions
mod cli;
use cli::Cli;

fn load_config(cli: &Cli) -> anyhow::Result<PassthruConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(PassthruConfig::default_path);
    let mut config = PassthruConfig::load(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    if let Some(battery) = &cli.battery {
        config.ble.battery = battery.clone();
    }
    if let Some(hci) = cli.hci {
        config.ble.hci = Some(hci);
    }
    if let Some(udc) = &cli.udc {
        config.gadget.udc = Some(udc.clone());
    }
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    validate_name(&cli.device).context("Invalid device")?;
    if let Some(name) = &cli.name {
        validate_name(name).context("Invalid name")?;
    }
    let config = load_config(&cli)?;

    let shutdown = ShutdownContext::new();
    shutdown
        .install_signal_handler()
        .context("Failed to install signal handler")?;

    let opts = DaemonOptions {
        device: cli.device,
        name: cli.name,
        outputs: cli.mode.outputs(),
        config,
    };
    daemon::run(opts, shutdown.clone())
        .await
        .context("Relay failed")?;

    if shutdown.has_failed() {
        anyhow::bail!("Bluetooth registration failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level())),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
