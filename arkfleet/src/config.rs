//! Fleet configuration.
//!
//! Polling intervals and command timeouts are configuration rather than
//! constants; everything has a default so an empty TOML file is a valid
//! config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Fixed name of the per-instance management script on the remote host.
pub const MANAGER_SCRIPT: &str = "POK-manager.sh";

/// Fleet-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Remote directory under which instance directories live.
    pub base_dir: String,
    /// Prefix the container runtime puts in front of instance names.
    pub container_prefix: String,
    /// Where to fetch the management script from when an instance directory
    /// is missing it.
    pub script_url: String,
    /// Monitoring tick period in milliseconds.
    pub tick_interval_ms: u64,
    /// Timeout for the repeated monitoring queries.
    pub monitor_timeout_secs: u64,
    /// Timeout for interactive lifecycle commands.
    pub command_timeout_secs: u64,
    /// TCP/SSH connect timeout.
    pub connect_timeout_secs: u64,
    /// Seconds to wait after issuing a start before verifying it.
    pub start_settle_secs: u64,
    /// Seconds to wait between the save-world and the stop command.
    pub stop_drain_secs: u64,
    /// Seconds to wait before and after the update command (skipped in
    /// immediate mode).
    pub update_wait_secs: u64,
    /// How many discovery probes may be scheduled concurrently. The channel
    /// still executes them one at a time on the wire.
    pub discovery_concurrency: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            base_dir: "~/asa-servers".to_string(),
            container_prefix: "asa_".to_string(),
            script_url:
                "https://raw.githubusercontent.com/Acekorneya/Ark-Survival-Ascended-Server/master/POK-manager.sh"
                    .to_string(),
            tick_interval_ms: 1_000,
            monitor_timeout_secs: 5,
            command_timeout_secs: 45,
            connect_timeout_secs: 15,
            start_settle_secs: 20,
            stop_drain_secs: 15,
            update_wait_secs: 30,
            discovery_concurrency: 8,
        }
    }
}

impl FleetConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(100))
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_secs(self.start_settle_secs)
    }

    pub fn update_wait(&self) -> Duration {
        Duration::from_secs(self.update_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = FleetConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.container_prefix, "asa_");
        assert!(config.command_timeout() > config.monitor_timeout());
    }

    #[test]
    fn empty_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "").unwrap();
        let config = FleetConfig::load(file.path()).unwrap();
        assert_eq!(config.base_dir, FleetConfig::default().base_dir);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "base_dir = \"/srv/ark\"\ntick_interval_ms = 2000\n"
        )
        .unwrap();
        let config = FleetConfig::load(file.path()).unwrap();
        assert_eq!(config.base_dir, "/srv/ark");
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.stop_drain_secs, 15);
    }

    #[test]
    fn tick_interval_is_clamped_to_a_floor() {
        let config = FleetConfig {
            tick_interval_ms: 1,
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "base_dir = [not toml").unwrap();
        assert!(matches!(
            FleetConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
