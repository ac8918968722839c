use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mecanum_zenoh_runtime::config::{ChassisConfig, LOOP_HZ};

/// Mecanum chassis motor runtime
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Chassis config (JSON); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control loop rate
    #[arg(long, default_value_t = LOOP_HZ, value_parser = clap::value_parser!(u64).range(1..=10_000))]
    hz: u64,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match ChassisConfig::load(path) {
            Ok(config) => {
                info!("Loaded chassis config from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        },
        None => ChassisConfig::default(),
    };

    if let Err(e) = mecanum_zenoh_runtime::runtime::run(config, args.hz).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
