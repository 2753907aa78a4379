//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Session and replication settings.
    pub network: NetworkConfig,
    /// Artificial network conditions.
    pub simulation: SimulationConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Peer id announced when hosting or joining.
    pub player_id: String,
    /// Port a host listens on (the next 7 ports are tried if it is taken).
    pub host_port: u16,
    /// Address `join` uses when none is given.
    pub join_address: String,
    /// Client bind port, 0 for an ephemeral port.
    pub client_port: u16,
    /// Connection slots a host hands out, its own included.
    pub max_clients: usize,
    /// Silence after which a connection is dropped.
    pub connection_timeout_ms: u64,
    /// How long a join may take.
    pub join_timeout_ms: u64,
    /// Interval between join request retries.
    pub join_resend_ms: u64,
    /// Session ticks per second.
    pub tick_rate_hz: f32,
    /// Packets per second per connection.
    pub send_rate_hz: f32,
    /// Idle interval after which a heartbeat is sent.
    pub heartbeat_interval_ms: u64,
    /// Replicated object snapshots per second.
    pub snapshot_rate_hz: f32,
    /// TCP port of the remote command service.
    pub rcs_port: u16,
}

/// Artificial latency and loss applied to incoming packets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Smallest injected delay.
    pub latency_min_ms: u64,
    /// Largest injected delay.
    pub latency_max_ms: u64,
    /// Fraction of packets dropped (0.0 - 1.0).
    pub loss_rate: f32,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for JSON log files; no file logging when unset.
    pub log_dir: Option<PathBuf>,
    /// Print a connection table every few seconds.
    pub show_net_status: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            player_id: "PLAYER".to_string(),
            host_port: 10084,
            join_address: "127.0.0.1:10084".to_string(),
            client_port: 0,
            max_clients: 8,
            connection_timeout_ms: 10_000,
            join_timeout_ms: 10_000,
            join_resend_ms: 100,
            tick_rate_hz: 20.0,
            send_rate_hz: 20.0,
            heartbeat_interval_ms: 500,
            snapshot_rate_hz: 10.0,
            rcs_port: 10090,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            show_net_status: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the demo, e.g. `~/.config/nebula-net`.
    ///
    /// Falls back to the working directory when the platform has none.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("nebula-net"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::InvalidValue {
                field,
                reason: reason.to_string(),
            })
        };
        let net = &self.network;
        let sim = &self.simulation;
        if !(1..=32).contains(&net.max_clients) {
            return invalid("network.max_clients", "must be between 1 and 32");
        }
        if !(net.tick_rate_hz > 0.0) {
            return invalid("network.tick_rate_hz", "must be positive");
        }
        if !(net.send_rate_hz > 0.0) {
            return invalid("network.send_rate_hz", "must be positive");
        }
        if !(0.0..=1.0).contains(&sim.loss_rate) {
            return invalid("simulation.loss_rate", "must be between 0.0 and 1.0");
        }
        if sim.latency_min_ms > sim.latency_max_ms {
            return invalid("simulation.latency_min_ms", "exceeds latency_max_ms");
        }
        Ok(())
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("host_port: 10084"));
        assert!(ron_str.contains("loss_rate: 0.0"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (player_id: \"HOST\"))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.player_id, "HOST");
        assert_eq!(config.network.host_port, 10084);
        assert_eq!(config.simulation, SimulationConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.player_id = "CLIENT1".to_string();
        config.simulation.latency_max_ms = 120;
        config.simulation.seed = Some(7);

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.simulation.loss_rate = 0.25;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().simulation.loss_rate, 0.25);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.simulation.loss_rate = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "simulation.loss_rate",
                ..
            })
        ));

        let mut config = Config::default();
        config.simulation.latency_min_ms = 200;
        config.simulation.latency_max_ms = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.max_clients = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "(network: (tick_rate_hz: 0.0))").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
