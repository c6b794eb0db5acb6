//! Common types used across the fleet core.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique logical identifier for an instance in the fleet.
///
/// This is the business key of the registry; it is derived from the
/// instance's directory name on the remote host and may differ from the name
/// the container runtime uses for the running workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceName(pub String);

impl InstanceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Observed state of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// No matching runtime identity was observed.
    #[default]
    Offline,
    /// A matching runtime identity is up.
    Online,
    /// A lifecycle operation holds the instance; monitoring must not
    /// overwrite this until the operation releases it.
    Busy,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Online => write!(f, "online"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

/// Logical identity of a managed server instance.
///
/// Created by discovery; the directory path and ports may later be adjusted
/// by lifecycle operations. The name is unique per registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique logical name (business key).
    pub name: InstanceName,
    /// Directory on the remote host containing the management script.
    pub directory: String,
    /// Map the server runs (from the instance environment file).
    pub map_name: String,
    /// Primary game port; 0 when the environment file does not declare one.
    pub game_port: u16,
    /// Admin-console (RCON) port; 0 when not declared.
    pub rcon_port: u16,
}

/// Mutable runtime metrics attached 1:1 to an [`Instance`].
///
/// Owned by the registry; written by the monitoring loop, except the `Busy`
/// transition which the lifecycle orchestrator holds for the duration of an
/// operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub status: ServerStatus,
    /// Container CPU usage in percent.
    pub cpu_percent: f64,
    /// Human-readable memory usage, e.g. `"1.5GiB / 31GiB"`.
    pub memory: String,
    /// Container memory usage in percent.
    pub memory_percent: f64,
    /// Host disk usage of the fleet base directory, percent.
    pub disk_percent: f64,
    /// Host network receive rate, KiB/s.
    pub net_rx_kibps: f64,
    /// Host network transmit rate, KiB/s.
    pub net_tx_kibps: f64,
    /// Players currently connected. Populated only when a consumer wires an
    /// RCON source; monitoring resets it to zero while the instance is down.
    pub players_online: u32,
    /// Player cap from the instance's compose descriptor.
    pub players_max: u32,
    /// Raw uptime as reported by the container runtime, e.g. `"Up 3 days"`.
    pub uptime: String,
    /// Whole days the instance has been up.
    pub up_days: u32,
    /// Set when a scheduled shutdown was issued and the resulting offline
    /// transition has not been observed yet.
    pub shutdown_pending: bool,
}

/// Host-wide metrics, shared by every instance on the host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub net_rx_kibps: f64,
    pub net_tx_kibps: f64,
}

/// How to authenticate the SSH session.
#[derive(Clone, Serialize, Deserialize)]
pub enum AuthMethod {
    Password(String),
    KeyFile(PathBuf),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => write!(f, "Password(***)"),
            Self::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
        }
    }
}

/// Connection parameters for the remote host. Immutable once a session is
/// open.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionCredential {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// Cached password for non-interactive `sudo -S` fallback, if the
    /// operator chose to store one.
    pub sudo_password: Option<String>,
}

impl fmt::Debug for ConnectionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCredential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("sudo_password", &self.sudo_password.as_ref().map(|_| "***"))
            .finish()
    }
}
