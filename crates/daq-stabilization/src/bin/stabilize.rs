//! Stabilize laser power once and report the result
//!
//! Loads the stabilization configuration, connects to the PID device, runs a
//! single stabilization scope for the requested target, prints the final
//! controller status as JSON and disconnects.
//!
//! ```text
//! stabilize --setpoint 0.5 --tolerance 0.01 --timeout 20s --label 800nm
//! RUST_LOG=debug stabilize --simulate --setpoint 0.3
//! ```

use anyhow::Context;
use clap::Parser;
use daq_driver_red_pitaya::{BackendSelection, SimulatedConfig};
use daq_stabilization::config::DEFAULT_CONFIG_PATH;
use daq_stabilization::{
    ConnectionRegistry, PowerStabilizationController, PowerTarget, StabilizationConfig,
};
use humantime_serde::re::humantime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stabilize")]
#[command(about = "Hold laser power at a setpoint using the FPGA PID loop", long_about = None)]
struct Cli {
    /// Configuration file (TOML); DAQ_STAB_* environment variables override it
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Target voltage on the monitored input
    #[arg(short, long)]
    setpoint: f64,

    /// Acceptable deviation of the mean from the setpoint
    #[arg(long, default_value_t = 0.01)]
    tolerance: f64,

    /// How long to wait for stability (e.g. "10s", "1m 30s")
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Label for logs and status, usually the wavelength
    #[arg(long, default_value = "cli")]
    label: String,

    /// Use the simulated device regardless of configuration
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = StabilizationConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if cli.simulate {
        config.backend = BackendSelection::Simulated(SimulatedConfig::default());
    }
    config.validate()?;

    let target = PowerTarget::new(cli.label, cli.setpoint, cli.tolerance, cli.timeout)?;
    tracing::info!(
        address = %config.address,
        backend = config.backend.kind(),
        channel = %config.channel,
        "Starting stabilization run"
    );

    let registry = Arc::new(ConnectionRegistry::new());
    let controller = PowerStabilizationController::new(config, registry.clone())?;

    let run = async {
        controller.connect().await?;
        let stable = controller
            .stabilization_scope(target, true, |stable| {
                let controller = controller.clone();
                async move {
                    let status = controller.get_status();
                    println!("{}", serde_json::to_string_pretty(&status)?);
                    Ok::<_, anyhow::Error>(stable)
                }
            })
            .await?;
        anyhow::Ok(stable)
    };
    let outcome = run.await;

    controller.disconnect().await?;
    registry.disconnect_all().await?;

    let stable = outcome?;
    if stable {
        println!("Power stable");
    } else {
        eprintln!("Power did not stabilize within {:?}", cli.timeout);
        std::process::exit(2);
    }
    Ok(())
}
