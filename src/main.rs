use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telemetry_node::config::Config;
use telemetry_node::cycle::CycleOutcome;
use telemetry_node::state::StateStore;

#[derive(Parser)]
#[command(name = "telemetry-node")]
#[command(about = "Duty-cycled cellular telemetry node with store-and-forward delivery")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Keep running: sleep in-process between cycles instead of exiting
    #[arg(long = "loop")]
    run_loop: bool,

    /// Treat this start as a true power-on (clears the retained region)
    #[arg(long)]
    power_on: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("telemetry-node v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Server {}:{}, state in {:?}, {} operator profile(s)",
        config.server.host,
        config.server.port,
        config.node.state_dir,
        config.operators.len()
    );

    let store = StateStore::open(&config.node.state_dir)?;
    let mut force_power_on = cli.power_on;

    loop {
        let outcome = run_cycle(&config, &store, force_power_on)?;
        force_power_on = false;

        match outcome {
            CycleOutcome::Sleep(duration) => {
                if !cli.run_loop {
                    info!("Deep sleep parked for {} s, exiting", duration.as_secs());
                    return Ok(());
                }
                std::thread::sleep(duration);
            }
            CycleOutcome::Restart => {
                if !cli.run_loop {
                    info!("Restart parked, exiting");
                    return Ok(());
                }
                info!("Restarting");
            }
            CycleOutcome::Halted => {
                error!("Node halted");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(feature = "serial")]
fn run_cycle(config: &Config, store: &StateStore, force_power_on: bool) -> anyhow::Result<CycleOutcome> {
    use telemetry_node::cycle::peripherals::Peripherals;
    use telemetry_node::cycle::CycleController;
    use telemetry_node::modem::serial::SerialModem;

    let modem = SerialModem::open(
        &config.modem.port,
        config.modem.baud,
        config.modem.supply_switch,
    )?;
    let (wake, retained) = store.boot(force_power_on)?;
    let peripherals = Peripherals::simulated(&config.simulation);
    let mut controller =
        CycleController::new(config.clone(), store.clone(), wake, retained, modem, peripherals);
    Ok(controller.run())
}

#[cfg(not(feature = "serial"))]
fn run_cycle(_config: &Config, _store: &StateStore, _force_power_on: bool) -> anyhow::Result<CycleOutcome> {
    anyhow::bail!("built without the `serial` feature; no modem backend available")
}
