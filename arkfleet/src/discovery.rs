//! One-shot fleet discovery.
//!
//! Scans the remote base directory for instance directories (identified by
//! the management script), derives each instance's logical name from its
//! directory name, and pulls ports, map, and player cap out of the
//! per-instance environment file and compose descriptor. Directory probes
//! are fanned out with bounded concurrency; the channel still executes them
//! one at a time on the wire, so the bound only limits queued work.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::{RemoteChannel, shell_escape_path};
use crate::config::{FleetConfig, MANAGER_SCRIPT};
use crate::errors::ChannelError;
use crate::events::{EventBus, FleetEvent};
use crate::inifile::parse_env;
use crate::registry::InstanceRegistry;
use crate::types::{Instance, InstanceName};

const DESCRIPTOR_MARKER: &str = "===ARKFLEET-DESCRIPTOR===";

/// Builds the initial instance set for a connection.
pub struct FleetDiscovery {
    channel: RemoteChannel,
    registry: Arc<InstanceRegistry>,
    bus: EventBus,
    config: Arc<FleetConfig>,
}

impl FleetDiscovery {
    pub fn new(
        channel: RemoteChannel,
        registry: Arc<InstanceRegistry>,
        bus: EventBus,
        config: Arc<FleetConfig>,
    ) -> Self {
        Self {
            channel,
            registry,
            bus,
            config,
        }
    }

    /// Scan the remote host and register every instance directory found.
    /// Returns the names that were newly registered.
    pub async fn run(&self) -> Result<Vec<InstanceName>, ChannelError> {
        let list_cmd = format!(
            "find {} -maxdepth 2 -name {} -printf '%h\\n'",
            shell_escape_path(&self.config.base_dir),
            MANAGER_SCRIPT,
        );
        let output = self.channel.execute(&list_cmd).await?;
        if !output.success() {
            warn!(stderr = %output.stderr.trim(), "instance directory scan failed");
            return Ok(Vec::new());
        }

        let mut directories: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        directories.sort();
        directories.dedup();
        debug!(count = directories.len(), "instance directories found");

        let semaphore = Arc::new(Semaphore::new(self.config.discovery_concurrency.max(1)));
        let mut probes = JoinSet::new();
        for directory in directories {
            let Some(name) = instance_name_from_dir(&directory) else {
                warn!(directory, "cannot derive instance name, skipping");
                continue;
            };
            let channel = self.channel.clone();
            let semaphore = semaphore.clone();
            probes.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                probe_directory(&channel, directory, name).await
            });
        }

        let mut registered = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let Ok((instance, players_max)) = joined else {
                continue;
            };
            let name = instance.name.clone();
            let is_new = self.registry.register(instance);
            self.registry.update(&name, |entry| {
                entry.status.players_max = players_max;
            });
            if is_new {
                info!(instance = %name, "instance discovered");
                self.bus.emit(FleetEvent::InstanceDiscovered { name: name.clone() });
                registered.push(name);
            }
        }

        registered.sort();
        Ok(registered)
    }
}

/// Probe one instance directory for its environment and descriptor.
///
/// A missing or malformed file is not an error: ports default to 0 and the
/// map stays empty.
async fn probe_directory(
    channel: &RemoteChannel,
    directory: String,
    name: InstanceName,
) -> (Instance, u32) {
    let env_path = format!("{}/.env", directory);
    let descriptor_path = format!(
        "{}/Instance_{}/docker-compose-{}.yaml",
        directory, name, name
    );
    let probe_cmd = format!(
        "cat {} 2>/dev/null; printf '\\n{}\\n'; cat {} 2>/dev/null",
        shell_escape_path(&env_path),
        DESCRIPTOR_MARKER,
        shell_escape_path(&descriptor_path),
    );

    let (env_text, descriptor_text) = match channel.execute(&probe_cmd).await {
        Ok(output) => split_probe_output(&output.stdout),
        Err(err) => {
            warn!(instance = %name, %err, "directory probe failed, using defaults");
            (String::new(), String::new())
        }
    };

    let env = parse_env(&env_text);
    let game_port = env
        .get("PORT")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let rcon_port = env
        .get("RCON_PORT")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let map_name = env.get("MAP_NAME").cloned().unwrap_or_default();
    let players_max = find_max_players(&descriptor_text).unwrap_or(0);

    (
        Instance {
            name,
            directory,
            map_name,
            game_port,
            rcon_port,
        },
        players_max,
    )
}

fn split_probe_output(stdout: &str) -> (String, String) {
    match stdout.split_once(DESCRIPTOR_MARKER) {
        Some((env, descriptor)) => (env.to_string(), descriptor.to_string()),
        None => (stdout.to_string(), String::new()),
    }
}

fn instance_name_from_dir(directory: &str) -> Option<InstanceName> {
    directory
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(InstanceName::from)
}

/// Plain text search for `MAX_PLAYERS=<n>` in a compose descriptor.
fn find_max_players(text: &str) -> Option<u32> {
    let idx = text.find("MAX_PLAYERS=")?;
    let digits: String = text[idx + "MAX_PLAYERS=".len()..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::types::{AuthMethod, ConnectionCredential};
    use std::time::Duration;

    fn credential() -> ConnectionCredential {
        ConnectionCredential {
            host: "ark.example".to_string(),
            port: 22,
            username: "ark".to_string(),
            auth: AuthMethod::Password("pw".to_string()),
            sudo_password: None,
        }
    }

    async fn discovery(mock: MockTransport) -> (FleetDiscovery, Arc<InstanceRegistry>, EventBus) {
        let channel = RemoteChannel::spawn(mock, Duration::from_secs(5));
        channel.connect(credential()).await.unwrap();
        let registry = Arc::new(InstanceRegistry::new());
        let bus = EventBus::default();
        let config = Arc::new(FleetConfig {
            base_dir: "/srv/ark".to_string(),
            ..Default::default()
        });
        (
            FleetDiscovery::new(channel, registry.clone(), bus.clone(), config),
            registry,
            bus,
        )
    }

    #[tokio::test]
    async fn registers_exactly_the_directories_with_the_script() {
        // Remote has directories {alpha, beta, club} but the scan command
        // only reports the two that contain the management script.
        let mock = MockTransport::new()
            .on("find /srv/ark", "/srv/ark/alpha\n/srv/ark/club\n")
            .on(
                "alpha/.env",
                "PORT=7777\nRCON_PORT=27020\nMAP_NAME=TheCenter\n===ARKFLEET-DESCRIPTOR===\n- MAX_PLAYERS=70\n",
            );
        let (discovery, registry, _bus) = discovery(mock).await;

        let mut registered = discovery.run().await.unwrap();
        registered.sort();
        assert_eq!(
            registered,
            vec![InstanceName::new("alpha"), InstanceName::new("club")]
        );
        assert_eq!(registry.len(), 2);

        let alpha = registry.get(&"alpha".into()).unwrap();
        assert_eq!(alpha.instance.game_port, 7777);
        assert_eq!(alpha.instance.rcon_port, 27020);
        assert_eq!(alpha.instance.map_name, "TheCenter");
        assert_eq!(alpha.status.players_max, 70);

        // No env file: everything defaults, which is not an error.
        let club = registry.get(&"club".into()).unwrap();
        assert_eq!(club.instance.game_port, 0);
        assert_eq!(club.instance.rcon_port, 0);
        assert_eq!(club.status.players_max, 0);
    }

    #[tokio::test]
    async fn emits_one_discovered_event_per_new_instance() {
        let mock = MockTransport::new().on("find /srv/ark", "/srv/ark/center\n");
        let (discovery, _registry, bus) = discovery(mock).await;
        let mut rx = bus.subscribe();

        discovery.run().await.unwrap();

        match rx.recv().await.unwrap() {
            FleetEvent::InstanceDiscovered { name } => assert_eq!(name.as_str(), "center"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn rediscovery_is_idempotent() {
        let mock = MockTransport::new().on("find /srv/ark", "/srv/ark/center\n");
        let (discovery, registry, _bus) = discovery(mock).await;

        let first = discovery.run().await.unwrap();
        assert_eq!(first.len(), 1);

        // Accumulate some state, then re-run discovery.
        registry.update(&"center".into(), |entry| {
            entry.status.cpu_percent = 33.0;
        });
        let second = discovery.run().await.unwrap();
        assert!(second.is_empty());
        let entry = registry.get(&"center".into()).unwrap();
        assert_eq!(entry.status.cpu_percent, 33.0);
    }

    #[tokio::test]
    async fn malformed_ports_default_to_zero() {
        let mock = MockTransport::new()
            .on("find /srv/ark", "/srv/ark/center\n")
            .on("center/.env", "PORT=not-a-number\nRCON_PORT=\n");
        let (discovery, registry, _bus) = discovery(mock).await;

        discovery.run().await.unwrap();
        let entry = registry.get(&"center".into()).unwrap();
        assert_eq!(entry.instance.game_port, 0);
        assert_eq!(entry.instance.rcon_port, 0);
    }

    #[tokio::test]
    async fn failed_scan_yields_empty_fleet() {
        let mock = MockTransport::new().on_fail("find /srv/ark", "no such directory");
        let (discovery, registry, _bus) = discovery(mock).await;

        let registered = discovery.run().await.unwrap();
        assert!(registered.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn name_derivation_handles_trailing_slash() {
        assert_eq!(
            instance_name_from_dir("/srv/ark/center/"),
            Some(InstanceName::new("center"))
        );
        assert_eq!(instance_name_from_dir("///"), None);
    }

    #[test]
    fn max_players_text_search() {
        assert_eq!(find_max_players("    - MAX_PLAYERS=70\n"), Some(70));
        assert_eq!(find_max_players("MAX_PLAYERS=abc"), None);
        assert_eq!(find_max_players("nothing here"), None);
    }
}
