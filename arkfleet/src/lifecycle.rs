//! Per-instance lifecycle operations.
//!
//! One operation per instance at a time, guarded by the `Busy` status. The
//! guard is released on every exit path: success and verification failure
//! pick the verified status, every other error restores the status the
//! monitor last observed. Operations issue the fixed-name management script
//! with its literal flags (`-start`, `-stop`, `-saveworld`,
//! `-shutdown <minutes>`, `-update`, `-backup`), always passing the bare
//! instance name last.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::channel::{CommandOutput, RemoteChannel, shell_escape_path};
use crate::config::{FleetConfig, MANAGER_SCRIPT};
use crate::errors::OpError;
use crate::events::{EventBus, FleetEvent, Operation};
use crate::privilege::{PrivilegeEscalationResolver, PrivilegeMode};
use crate::reconcile;
use crate::registry::InstanceRegistry;
use crate::types::{Instance, InstanceName, ServerStatus};

/// Literal contract: container names for post-action verification.
const DOCKER_NAMES_CMD: &str = "docker ps --format '{{.Names}}'";

/// Executes multi-step operations against single instances.
pub struct LifecycleOrchestrator {
    channel: RemoteChannel,
    registry: Arc<InstanceRegistry>,
    bus: EventBus,
    privilege: Arc<PrivilegeEscalationResolver>,
    config: Arc<FleetConfig>,
}

/// Holds an instance `Busy` for the duration of one operation.
///
/// Dropping the guard without an explicit release restores the status the
/// monitor observed before the operation began, so no code path can leave
/// an instance stuck `Busy`.
struct BusyGuard {
    registry: Arc<InstanceRegistry>,
    name: InstanceName,
    prior: ServerStatus,
    released: bool,
}

impl BusyGuard {
    fn acquire(
        registry: &Arc<InstanceRegistry>,
        name: &InstanceName,
    ) -> Result<(Self, Instance), OpError> {
        let claimed = registry.update(name, |entry| {
            if entry.status.status == ServerStatus::Busy {
                return Err(OpError::Busy(name.clone()));
            }
            let prior = entry.status.status;
            entry.status.status = ServerStatus::Busy;
            Ok((prior, entry.instance.clone()))
        });
        match claimed {
            None => Err(OpError::UnknownInstance(name.clone())),
            Some(Err(err)) => Err(err),
            Some(Ok((prior, instance))) => Ok((
                Self {
                    registry: registry.clone(),
                    name: name.clone(),
                    prior,
                    released: false,
                },
                instance,
            )),
        }
    }

    /// Release to an explicitly verified status.
    fn release(mut self, status: ServerStatus) {
        self.registry.update(&self.name, |entry| {
            entry.status.status = status;
        });
        self.released = true;
    }

    /// Release back to the status observed before the operation.
    fn release_to_prior(self) {
        let prior = self.prior;
        self.release(prior);
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if !self.released {
            let prior = self.prior;
            self.registry.update(&self.name, |entry| {
                if entry.status.status == ServerStatus::Busy {
                    entry.status.status = prior;
                }
            });
        }
    }
}

impl LifecycleOrchestrator {
    pub fn new(
        channel: RemoteChannel,
        registry: Arc<InstanceRegistry>,
        bus: EventBus,
        privilege: Arc<PrivilegeEscalationResolver>,
        config: Arc<FleetConfig>,
    ) -> Self {
        Self {
            channel,
            registry,
            bus,
            privilege,
            config,
        }
    }

    /// Start an instance: ensure the management script is present, issue
    /// the start command, then verify the container actually came up.
    pub async fn start(&self, name: &InstanceName) -> Result<(), OpError> {
        let (guard, instance) = self.begin(name, Operation::Start)?;
        let result = async {
            let mode = self.privilege.resolve().await?;
            self.do_start(name, &instance, mode).await
        }
        .await;
        match &result {
            Ok(()) => guard.release(ServerStatus::Online),
            Err(OpError::VerificationFailed { .. }) => guard.release(ServerStatus::Offline),
            Err(_) => drop(guard),
        }
        self.finish(name, Operation::Start, &result);
        result
    }

    /// Gracefully stop an instance: save the world, drain, stop.
    pub async fn stop(&self, name: &InstanceName) -> Result<(), OpError> {
        let (guard, instance) = self.begin(name, Operation::Stop)?;
        let result = async {
            let mode = self.privilege.resolve().await?;
            self.do_stop(name, &instance, mode).await
        }
        .await;
        match &result {
            Ok(()) => guard.release(ServerStatus::Offline),
            Err(_) => drop(guard),
        }
        self.finish(name, Operation::Stop, &result);
        result
    }

    /// Save the world and hand the host a delayed shutdown. Fire-and-forget
    /// with respect to the delay window: the instance is released
    /// immediately while the remote delayed action continues, and the
    /// shutdown-pending flag tells the monitor how to classify the eventual
    /// offline transition.
    pub async fn scheduled_shutdown(
        &self,
        name: &InstanceName,
        delay_minutes: u32,
    ) -> Result<(), OpError> {
        let (guard, instance) = self.begin(name, Operation::ScheduledShutdown)?;
        let result = async {
            let mode = self.privilege.resolve().await?;
            self.save_world(name, &instance, mode).await;
            let command = self.script_command(
                &instance,
                mode,
                "-shutdown",
                &[delay_minutes.to_string()],
                name,
            );
            let output = self
                .channel
                .execute_with_timeout(&command, self.config.command_timeout())
                .await?;
            if !output.success() {
                return Err(remote_failure("-shutdown", name, &output));
            }
            Ok(())
        }
        .await;
        if result.is_ok() {
            self.registry.update(name, |entry| {
                entry.status.shutdown_pending = true;
            });
            info!(instance = %name, delay_minutes, "scheduled shutdown issued");
        }
        guard.release_to_prior();
        self.finish(name, Operation::ScheduledShutdown, &result);
        result
    }

    /// Update an instance: stop, wait, run the update with live output,
    /// wait, start again. `immediate` skips both waits.
    pub async fn update(&self, name: &InstanceName, immediate: bool) -> Result<(), OpError> {
        let (guard, instance) = self.begin(name, Operation::Update)?;
        let result = async {
            let mode = self.privilege.resolve().await?;
            self.do_stop(name, &instance, mode).await?;
            if !immediate {
                tokio::time::sleep(self.config.update_wait()).await;
            }
            self.stream_script(name, &instance, mode, "-update").await?;
            if !immediate {
                tokio::time::sleep(self.config.update_wait()).await;
            }
            self.do_start(name, &instance, mode).await
        }
        .await;
        match &result {
            Ok(()) => guard.release(ServerStatus::Online),
            Err(OpError::VerificationFailed { .. }) => guard.release(ServerStatus::Offline),
            Err(_) => drop(guard),
        }
        self.finish(name, Operation::Update, &result);
        result
    }

    /// Run a backup with live output. No pre/post steps.
    pub async fn backup(&self, name: &InstanceName) -> Result<(), OpError> {
        let (guard, instance) = self.begin(name, Operation::Backup)?;
        let result = async {
            let mode = self.privilege.resolve().await?;
            self.stream_script(name, &instance, mode, "-backup").await
        }
        .await;
        guard.release_to_prior();
        self.finish(name, Operation::Backup, &result);
        result
    }

    /// Emit the start event and claim the instance. A rejected claim still
    /// produces a finished event so audit consumers see the attempt.
    fn begin(
        &self,
        name: &InstanceName,
        operation: Operation,
    ) -> Result<(BusyGuard, Instance), OpError> {
        self.bus.emit(FleetEvent::OperationStarted {
            name: name.clone(),
            operation,
        });
        match BusyGuard::acquire(&self.registry, name) {
            Ok(claimed) => Ok(claimed),
            Err(err) => {
                self.bus.emit(FleetEvent::OperationFinished {
                    name: name.clone(),
                    operation,
                    success: false,
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    fn finish(&self, name: &InstanceName, operation: Operation, result: &Result<(), OpError>) {
        self.bus.emit(FleetEvent::OperationFinished {
            name: name.clone(),
            operation,
            success: result.is_ok(),
            error: result.as_ref().err().map(|err| err.to_string()),
        });
    }

    async fn do_start(
        &self,
        name: &InstanceName,
        instance: &Instance,
        mode: PrivilegeMode,
    ) -> Result<(), OpError> {
        self.ensure_manager_script(instance).await?;

        let command = self.script_command(instance, mode, "-start", &[], name);
        let output = self
            .channel
            .execute_with_timeout(&command, self.config.command_timeout())
            .await?;
        if !output.success() {
            return Err(remote_failure("-start", name, &output));
        }

        tokio::time::sleep(self.config.start_settle()).await;

        let verify_cmd = self.privilege.apply(self.privilege.cached_mode(), DOCKER_NAMES_CMD);
        let names_output = self
            .channel
            .execute_with_timeout(&verify_cmd, self.config.monitor_timeout())
            .await?;
        let candidates: Vec<String> = names_output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        match reconcile::best_match(name.as_str(), &self.config.container_prefix, &candidates) {
            Some(runtime_name) => {
                info!(instance = %name, runtime = runtime_name, "start verified");
                Ok(())
            }
            None => Err(OpError::VerificationFailed {
                name: name.clone(),
                diagnostic: extract_error_lines(&output),
            }),
        }
    }

    async fn do_stop(
        &self,
        name: &InstanceName,
        instance: &Instance,
        mode: PrivilegeMode,
    ) -> Result<(), OpError> {
        self.save_world(name, instance, mode).await;
        self.drain(name).await;

        let command = self.script_command(instance, mode, "-stop", &[], name);
        let output = self
            .channel
            .execute_with_timeout(&command, self.config.command_timeout())
            .await?;
        if !output.success() {
            return Err(remote_failure("-stop", name, &output));
        }
        Ok(())
    }

    /// Best effort: a failed save is logged, never fatal to the stop.
    async fn save_world(&self, name: &InstanceName, instance: &Instance, mode: PrivilegeMode) {
        let command = self.script_command(instance, mode, "-saveworld", &[], name);
        match self
            .channel
            .execute_with_timeout(&command, self.config.command_timeout())
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => {
                warn!(instance = %name, stderr = %output.stderr.trim(), "world save failed")
            }
            Err(err) => warn!(instance = %name, %err, "world save failed"),
        }
    }

    /// Wait out the drain interval, reporting progress once per second.
    async fn drain(&self, name: &InstanceName) {
        for remaining in (1..=self.config.stop_drain_secs).rev() {
            self.bus.emit(FleetEvent::DrainProgress {
                name: name.clone(),
                remaining_secs: remaining,
            });
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    /// Run a script flag with live, line-by-line output forwarding.
    async fn stream_script(
        &self,
        name: &InstanceName,
        instance: &Instance,
        mode: PrivilegeMode,
        flag: &str,
    ) -> Result<(), OpError> {
        let command = self.script_command(instance, mode, flag, &[], name);
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();

        let bus = self.bus.clone();
        let event_name = name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = lines_rx.recv().await {
                bus.emit(FleetEvent::OperationOutput {
                    name: event_name.clone(),
                    line,
                });
            }
        });

        let result = self.channel.execute_streamed(&command, lines_tx).await;
        let _ = forwarder.await;

        let output = result?;
        if !output.success() {
            return Err(remote_failure(flag, name, &output));
        }
        Ok(())
    }

    /// Ensure the management script exists, downloading and installing it
    /// when missing.
    async fn ensure_manager_script(&self, instance: &Instance) -> Result<(), OpError> {
        let script_path = format!("{}/{}", instance.directory, MANAGER_SCRIPT);
        let check = self
            .channel
            .execute(&format!("test -x {}", shell_escape_path(&script_path)))
            .await?;
        if check.success() {
            return Ok(());
        }

        info!(directory = %instance.directory, "management script missing, installing");
        let install = format!(
            "cd {dir} && curl -fsSL -o {script} {url} && chmod +x {script}",
            dir = shell_escape_path(&instance.directory),
            script = MANAGER_SCRIPT,
            url = self.config.script_url,
        );
        let output = self
            .channel
            .execute_with_timeout(&install, self.config.command_timeout())
            .await?;
        if !output.success() {
            return Err(OpError::DependencyMissing(format!(
                "{}: {}",
                MANAGER_SCRIPT,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Build `cd <dir> && [elevation] ./POK-manager.sh <flag> [args] <name>`.
    fn script_command(
        &self,
        instance: &Instance,
        mode: PrivilegeMode,
        flag: &str,
        extra: &[String],
        name: &InstanceName,
    ) -> String {
        let mut invocation = format!("./{} {}", MANAGER_SCRIPT, flag);
        for arg in extra {
            invocation.push(' ');
            invocation.push_str(arg);
        }
        invocation.push(' ');
        invocation.push_str(&shell_escape::escape(name.as_str().into()));

        format!(
            "cd {} && {}",
            shell_escape_path(&instance.directory),
            self.privilege.apply(mode, &invocation)
        )
    }
}

fn remote_failure(flag: &str, name: &InstanceName, output: &CommandOutput) -> OpError {
    OpError::RemoteCommandFailed {
        command: format!("{} {} {}", MANAGER_SCRIPT, flag, name),
        detail: extract_error_lines(output),
    }
}

/// Pull the most diagnostic lines out of command output: anything that
/// looks like an error, else the last non-empty line.
fn extract_error_lines(output: &CommandOutput) -> String {
    const MARKERS: &[&str] = &["error", "failed", "fatal", "denied"];
    const MAX_LINES: usize = 5;

    let combined = format!("{}\n{}", output.stdout, output.stderr);
    let flagged: Vec<&str> = combined
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .take(MAX_LINES)
        .collect();

    if !flagged.is_empty() {
        return flagged.join("; ");
    }
    combined
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("no diagnostic output")
        .to_string()
}
