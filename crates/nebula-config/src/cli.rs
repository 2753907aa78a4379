//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-demo", about = "Nebula networking demo")]
pub struct CliArgs {
    /// Start hosting immediately.
    #[arg(long, conflicts_with = "join")]
    pub host: bool,

    /// Join the host at this address immediately.
    #[arg(long)]
    pub join: Option<String>,

    /// Host port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Peer id.
    #[arg(long)]
    pub id: Option<String>,

    /// Smallest simulated latency in milliseconds.
    #[arg(long)]
    pub sim_lag_min: Option<u64>,

    /// Largest simulated latency in milliseconds.
    #[arg(long)]
    pub sim_lag_max: Option<u64>,

    /// Simulated loss rate (0.0 - 1.0).
    #[arg(long)]
    pub sim_loss: Option<f32>,

    /// Session ticks per second.
    #[arg(long)]
    pub tick_rate: Option<f32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.join {
            self.network.join_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.host_port = port;
        }
        if let Some(ref id) = args.id {
            self.network.player_id = id.clone();
        }
        if let Some(min) = args.sim_lag_min {
            self.simulation.latency_min_ms = min;
            self.simulation.latency_max_ms = self.simulation.latency_max_ms.max(min);
        }
        if let Some(max) = args.sim_lag_max {
            self.simulation.latency_max_ms = max;
        }
        if let Some(loss) = args.sim_loss {
            self.simulation.loss_rate = loss;
        }
        if let Some(rate) = args.tick_rate {
            self.network.tick_rate_hz = rate;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
