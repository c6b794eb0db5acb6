//! Error types shared across the fleet core.
//!
//! The channel layer distinguishes a command that merely failed from a
//! session that dropped: the latter is terminal until the next successful
//! `connect`. Lifecycle operations surface their own taxonomy so callers can
//! tell a missing dependency from a privilege problem or a start that did
//! not verify.

use thiserror::Error;

use crate::types::InstanceName;

/// Errors raised while establishing an SSH session.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },

    #[error("connection to {host}:{port} timed out")]
    Timeout { host: String, port: u16 },

    #[error("host {host}:{port} unreachable: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("ssh handshake failed: {0}")]
    Handshake(String),
}

/// Low-level transport failure, classified by the transport itself.
///
/// `SessionLost` means the underlying session is gone and the channel must
/// transition to its disconnected state; `Failed` covers everything that
/// leaves the session usable.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("command failed: {0}")]
    Failed(String),
}

/// Errors surfaced by [`RemoteChannel`](crate::channel::RemoteChannel)
/// operations.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// No session has been established yet (or `disconnect` was called).
    #[error("channel is not connected")]
    NotConnected,

    /// The session dropped mid-flight; every queued and subsequent operation
    /// fails with this until `connect` succeeds again.
    #[error("connection to remote host lost")]
    ConnectionLost,

    /// The command could not be executed (channel open failure, timeout).
    #[error("remote execution failed: {0}")]
    Exec(String),

    /// File content could not be transport-decoded.
    #[error("remote file transfer failed: {0}")]
    Transfer(String),

    /// The channel worker has shut down and cannot accept work.
    #[error("channel worker shut down")]
    Closed,
}

/// Unexpected shape in the output of a remote query.
#[derive(Debug, Clone, Error)]
#[error("malformed {what} output: {detail}")]
pub struct ParseError {
    pub what: &'static str,
    pub detail: String,
}

impl ParseError {
    pub fn new(what: &'static str, detail: impl Into<String>) -> Self {
        Self {
            what,
            detail: detail.into(),
        }
    }
}

/// Errors surfaced by lifecycle operations.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("instance {0} is not registered")]
    UnknownInstance(InstanceName),

    #[error("instance {0} already has an operation in progress")]
    Busy(InstanceName),

    #[error("required dependency missing: {0}")]
    DependencyMissing(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("verification failed for {name}: {diagnostic}")]
    VerificationFailed {
        name: InstanceName,
        diagnostic: String,
    },

    #[error("remote command failed ({command}): {detail}")]
    RemoteCommandFailed { command: String, detail: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors loading the fleet configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
