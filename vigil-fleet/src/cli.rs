//! Command-line arguments of the fleet driver.

use clap::Parser;
use std::path::PathBuf;

/// Vigil fleet - simulated telemetry agents
///
/// Connects N agents to the broker, streams readings from all of them,
/// prints per-agent statistics and disconnects.
///
/// Examples:
///   vigil-fleet
///   vigil-fleet 20 50 250
///   vigil-fleet 5 10 1000 broker.local
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of agents
    #[arg(value_name = "AGENTS")]
    pub agents: Option<usize>,

    /// Messages published by each agent
    #[arg(value_name = "MESSAGES")]
    pub messages: Option<u64>,

    /// Interval between two messages, in milliseconds
    #[arg(value_name = "INTERVAL_MS")]
    pub interval_ms: Option<u64>,

    /// Broker host
    #[arg(value_name = "BROKER")]
    pub broker: Option<String>,

    /// Path to the configuration file
    ///
    /// Defaults to fleet.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "VIGIL_FLEET_CONFIG")]
    pub config: Option<PathBuf>,
}
