use clap::Parser;
use std::path::PathBuf;

/// Vigil aggregator - receives agent telemetry and sends spike alerts back
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Broker port (overrides mqtt.port from the config file)
    #[arg(value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to the YAML configuration file
    #[arg(short, long, value_name = "FILE", env = "VIGIL_AGGREGATOR_CONFIG")]
    pub config: Option<PathBuf>,
}
