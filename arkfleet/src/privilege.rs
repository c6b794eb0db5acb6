//! Privilege-escalation negotiation for the container runtime.
//!
//! Before any privileged command, the resolver walks an explicitly ordered
//! strategy list: use the runtime directly, grant the remote user the
//! docker group and re-probe, fall back to non-interactive sudo, and
//! finally to sudo fed a cached password. The decision is cached for the
//! connection, but a cached non-direct result is re-probed on every
//! operation since a group grant may take effect mid-session.

use std::borrow::Cow;
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use tracing::{debug, info};

use crate::channel::RemoteChannel;
use crate::errors::OpError;

/// Probe command: succeeds iff the runtime is usable at that privilege.
const RUNTIME_PROBE: &str = "docker info --format '{{.ServerVersion}}'";

/// How to run privileged commands for the rest of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeMode {
    /// The runtime is usable without elevation.
    Direct,
    /// Prefix commands with non-interactive sudo.
    Sudo,
    /// Feed the cached password to sudo on stdin.
    SudoPassword,
}

/// The ordered fallback chain. New strategies are additions to this list,
/// not edits to control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Direct,
    GrantGroup,
    Sudo,
    SudoPassword,
}

const CHAIN: &[Strategy] = &[
    Strategy::Direct,
    Strategy::GrantGroup,
    Strategy::Sudo,
    Strategy::SudoPassword,
];

/// Negotiates and caches the privilege mode for one connection.
pub struct PrivilegeEscalationResolver {
    channel: RemoteChannel,
    username: String,
    sudo_password: Option<String>,
    cached: Mutex<Option<PrivilegeMode>>,
}

impl PrivilegeEscalationResolver {
    pub fn new(channel: RemoteChannel, username: String, sudo_password: Option<String>) -> Self {
        Self {
            channel,
            username,
            sudo_password,
            cached: Mutex::new(None),
        }
    }

    /// Resolve the privilege mode, probing the chain as needed.
    ///
    /// A cached `Direct` is trusted; anything else re-probes so a group
    /// grant that has since taken effect downgrades back to `Direct`.
    pub async fn resolve(&self) -> Result<PrivilegeMode, OpError> {
        if let Some(PrivilegeMode::Direct) = *self.cached.lock().expect("cache lock poisoned") {
            return Ok(PrivilegeMode::Direct);
        }

        let mode = self.walk_chain().await?;
        *self.cached.lock().expect("cache lock poisoned") = Some(mode);
        Ok(mode)
    }

    /// Last resolved mode without probing; `Direct` when undecided. The
    /// monitoring loop uses this so its per-second queries never pay for a
    /// probe round.
    pub fn cached_mode(&self) -> PrivilegeMode {
        self.cached
            .lock()
            .expect("cache lock poisoned")
            .unwrap_or(PrivilegeMode::Direct)
    }

    /// Forget the cached decision (call after a reconnect).
    pub fn invalidate(&self) {
        *self.cached.lock().expect("cache lock poisoned") = None;
    }

    /// Wrap `command` for execution at the given privilege.
    pub fn apply(&self, mode: PrivilegeMode, command: &str) -> String {
        match mode {
            PrivilegeMode::Direct => command.to_string(),
            PrivilegeMode::Sudo => format!("sudo -n {}", command),
            PrivilegeMode::SudoPassword => {
                // Always single-quoted so the logging mask can find and
                // strip it.
                let password = self.sudo_password.as_deref().unwrap_or_default();
                format!(
                    "printf %s '{}' | sudo -S -p '' {}",
                    password.replace('\'', r"'\''"),
                    command
                )
            }
        }
    }

    async fn walk_chain(&self) -> Result<PrivilegeMode, OpError> {
        for strategy in CHAIN {
            match strategy {
                Strategy::Direct => {
                    if self.probe(PrivilegeMode::Direct).await? {
                        return Ok(PrivilegeMode::Direct);
                    }
                }
                Strategy::GrantGroup => {
                    let grant = format!("sudo -n usermod -aG docker {}", self.username);
                    let granted = self.channel.execute(&grant).await?.success();
                    if granted {
                        info!(user = %self.username, "granted docker group membership");
                        if self.probe(PrivilegeMode::Direct).await? {
                            return Ok(PrivilegeMode::Direct);
                        }
                    }
                }
                Strategy::Sudo => {
                    if self.probe(PrivilegeMode::Sudo).await? {
                        return Ok(PrivilegeMode::Sudo);
                    }
                }
                Strategy::SudoPassword => {
                    if self.sudo_password.is_some()
                        && self.probe(PrivilegeMode::SudoPassword).await?
                    {
                        return Ok(PrivilegeMode::SudoPassword);
                    }
                }
            }
        }

        Err(OpError::PermissionDenied(
            "container runtime unusable under every elevation strategy".to_string(),
        ))
    }

    async fn probe(&self, mode: PrivilegeMode) -> Result<bool, OpError> {
        let command = self.apply(mode, RUNTIME_PROBE);
        let usable = self.channel.execute(&command).await?.success();
        debug!(?mode, usable, "runtime privilege probe");
        Ok(usable)
    }
}

/// Strip a piped sudo password out of a command line before logging it.
pub fn mask_sudo_password(command: &str) -> Cow<'_, str> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"printf %s '[^']*' \| sudo -S").expect("static regex must compile")
    });
    pattern.replace(command, "printf %s '***' | sudo -S")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RemoteChannel;
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

    async fn connected(mock: MockTransport) -> RemoteChannel {
        let channel = RemoteChannel::spawn(mock, Duration::from_secs(5));
        channel.connect(credential()).await.unwrap();
        channel
    }

    fn resolver(channel: RemoteChannel, password: Option<&str>) -> PrivilegeEscalationResolver {
        PrivilegeEscalationResolver::new(
            channel,
            "ark".to_string(),
            password.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn direct_when_runtime_is_usable() {
        let mock = MockTransport::new().on("docker info", "24.0.7\n");
        let channel = connected(mock).await;
        let resolver = resolver(channel, None);

        assert_eq!(resolver.resolve().await.unwrap(), PrivilegeMode::Direct);
    }

    #[tokio::test]
    async fn group_grant_recovers_direct_access() {
        // First probe fails, the grant succeeds, the re-probe passes.
        let mock = MockTransport::new()
            .on_fail("docker info --format", "permission denied")
            .on("docker info --format", "24.0.7\n")
            .on("usermod -aG docker", "");
        let channel = connected(mock).await;
        let resolver = resolver(channel, None);

        assert_eq!(resolver.resolve().await.unwrap(), PrivilegeMode::Direct);
    }

    #[tokio::test]
    async fn falls_back_to_sudo_prefix() {
        // The bare probe rule comes last so the sudo probe matches its own
        // rule first.
        let mock = MockTransport::new()
            .on_fail("sudo -n usermod", "a password is required")
            .on("sudo -n docker info", "24.0.7\n")
            .on_fail("docker info", "permission denied");
        let channel = connected(mock).await;
        let resolver = resolver(channel, None);

        assert_eq!(resolver.resolve().await.unwrap(), PrivilegeMode::Sudo);
    }

    #[tokio::test]
    async fn password_fallback_requires_cached_password() {
        let mock = MockTransport::new()
            .on_fail("sudo -S -p", "")
            .on_fail("sudo -n", "a password is required")
            .on_fail("docker info", "permission denied");
        let channel = connected(mock).await;

        let without_password = resolver(channel.clone(), None);
        assert!(matches!(
            without_password.resolve().await,
            Err(OpError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn password_fallback_used_when_it_works() {
        let mock = MockTransport::new()
            .on("sudo -S -p", "24.0.7\n")
            .on_fail("sudo -n", "a password is required")
            .on_fail("docker info", "permission denied");
        let channel = connected(mock).await;
        let resolver = resolver(channel, Some("hunter2"));

        assert_eq!(
            resolver.resolve().await.unwrap(),
            PrivilegeMode::SudoPassword
        );
    }

    #[tokio::test]
    async fn cached_direct_skips_reprobe() {
        let mock = MockTransport::new().on("docker info", "24.0.7\n");
        let handle = mock.handle();
        let channel = connected(mock).await;
        let resolver = resolver(channel, None);

        resolver.resolve().await.unwrap();
        resolver.resolve().await.unwrap();
        assert_eq!(handle.count("docker info"), 1);
    }

    #[tokio::test]
    async fn cached_sudo_reprobes_each_operation() {
        let mock = MockTransport::new()
            .on_fail("sudo -n usermod", "")
            .on("sudo -n docker info", "24.0.7\n")
            .on_fail("docker info", "permission denied");
        let handle = mock.handle();
        let channel = connected(mock).await;
        let resolver = resolver(channel, None);

        assert_eq!(resolver.resolve().await.unwrap(), PrivilegeMode::Sudo);
        let probes_after_first = handle.count("sudo -n docker info");
        assert_eq!(resolver.resolve().await.unwrap(), PrivilegeMode::Sudo);
        assert!(handle.count("sudo -n docker info") > probes_after_first);
    }

    #[tokio::test]
    async fn apply_wraps_commands_per_mode() {
        let mock = MockTransport::new();
        let channel = RemoteChannel::spawn(mock, Duration::from_secs(5));
        let resolver = resolver(channel, Some("hunter2"));

        assert_eq!(
            resolver.apply(PrivilegeMode::Direct, "docker ps"),
            "docker ps"
        );
        assert_eq!(
            resolver.apply(PrivilegeMode::Sudo, "docker ps"),
            "sudo -n docker ps"
        );
        let piped = resolver.apply(PrivilegeMode::SudoPassword, "docker ps");
        assert!(piped.contains("sudo -S -p ''"));
        assert!(piped.contains("hunter2"));
    }

    #[test]
    fn masking_hides_the_piped_password() {
        let command = "printf %s 'hunter2' | sudo -S -p '' docker ps";
        let masked = mask_sudo_password(command);
        assert!(!masked.contains("hunter2"));
        assert!(masked.contains("'***'"));
    }
}
