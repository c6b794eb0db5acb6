//! Recurring fleet monitoring.
//!
//! Each tick polls three independent sources of truth (container
//! identities, the per-container usage table, and host-wide figures), then
//! reconciles them against the registry and publishes change events. The
//! three query groups are scheduled concurrently but the channel serializes
//! them on the wire; the code only relies on their logical independence. A
//! tick never starts before the previous tick's channel work has finished.
//!
//! A single query's failure never aborts the tick for the other queries: it
//! is logged and the previous values are retained for that metric only.
//! The exception is reconciliation itself: an instance with no matching
//! runtime identity goes offline and its cpu/memory reset to zero rather
//! than keeping stale readings.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::channel::{RemoteChannel, shell_escape_path};
use crate::config::FleetConfig;
use crate::errors::ParseError;
use crate::events::{EventBus, FleetEvent, TransitionKind};
use crate::metrics::{CpuSample, MemorySample, NetSample, parse_disk_percent};
use crate::privilege::PrivilegeEscalationResolver;
use crate::reconcile;
use crate::registry::InstanceRegistry;
use crate::types::{HostMetrics, ServerStatus};

/// Literal query contracts for the managed runtime's tooling.
const DOCKER_PS_CMD: &str = "docker ps --format '{{.Names}};{{.Status}}'";
const DOCKER_STATS_CMD: &str =
    "docker stats --no-stream --format '{{.Name}};{{.CPUPerc}};{{.MemUsage}};{{.MemPerc}}'";

/// One observed container: runtime identity plus uptime.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerInfo {
    name: String,
    uptime: String,
    up_days: u32,
}

/// One row of the usage table.
#[derive(Debug, Clone, PartialEq)]
struct UsageRow {
    name: String,
    cpu_percent: f64,
    memory: String,
    memory_percent: f64,
}

#[derive(Default)]
struct TickState {
    prev_cpu: Option<CpuSample>,
    prev_net: Option<(NetSample, Instant)>,
    host: HostMetrics,
}

struct MonitorInner {
    channel: RemoteChannel,
    registry: Arc<InstanceRegistry>,
    bus: EventBus,
    privilege: Arc<PrivilegeEscalationResolver>,
    config: Arc<FleetConfig>,
    running: AtomicBool,
    stop: Notify,
    tick_state: tokio::sync::Mutex<TickState>,
}

/// The recurring monitoring scheduler: `Stopped -> Running -> Stopped`.
#[derive(Clone)]
pub struct MonitoringLoop {
    inner: Arc<MonitorInner>,
}

impl MonitoringLoop {
    pub fn new(
        channel: RemoteChannel,
        registry: Arc<InstanceRegistry>,
        bus: EventBus,
        privilege: Arc<PrivilegeEscalationResolver>,
        config: Arc<FleetConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                channel,
                registry,
                bus,
                privilege,
                config,
                running: AtomicBool::new(false),
                stop: Notify::new(),
                tick_state: tokio::sync::Mutex::new(TickState::default()),
            }),
        }
    }

    /// Start the loop. Calling while already running is a no-op.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("monitoring loop already running");
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!(interval = ?inner.config.tick_interval(), "monitoring loop started");
            let mut ticker = tokio::time::interval(inner.config.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut lost_rx = inner.channel.subscribe_lost();

            loop {
                tokio::select! {
                    _ = inner.stop.notified() => break,
                    result = lost_rx.recv() => {
                        if result.is_ok() {
                            inner.bus.emit(FleetEvent::ConnectionLost);
                        }
                    }
                    _ = ticker.tick() => {
                        if !inner.running.load(Ordering::SeqCst) {
                            break;
                        }
                        tokio::select! {
                            // Cancellation mid-tick discards the in-flight
                            // results; the channel finishes the wire command
                            // on its own thread.
                            _ = inner.stop.notified() => break,
                            _ = inner.run_tick() => {}
                        }
                    }
                }
            }
            info!("monitoring loop stopped");
        });
    }

    /// Stop the loop: the next scheduled tick is cancelled and in-flight
    /// query results are discarded.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.stop.notify_waiters();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run a single polling cycle immediately, outside the schedule. Used
    /// to prime the registry right after discovery.
    pub async fn tick_now(&self) {
        self.inner.run_tick().await;
    }
}

impl MonitorInner {
    async fn run_tick(&self) {
        let timeout = self.config.monitor_timeout();
        let mode = self.privilege.cached_mode();
        let ps_cmd = self.privilege.apply(mode, DOCKER_PS_CMD);
        let stats_cmd = self.privilege.apply(mode, DOCKER_STATS_CMD);

        let (identities, usage, host) = tokio::join!(
            self.query_identities(&ps_cmd, timeout),
            self.query_usage(&stats_cmd, timeout),
            self.query_host(timeout),
        );

        let candidate_names: Option<Vec<String>> = identities
            .as_ref()
            .map(|list| list.iter().map(|c| c.name.clone()).collect());
        let usage_names: Option<Vec<String>> = usage
            .as_ref()
            .map(|rows| rows.iter().map(|r| r.name.clone()).collect());

        let mut events = Vec::new();
        for name in self.registry.names() {
            let outcome = self.registry.update(&name, |entry| {
                // An operation holds this instance; leave every field alone.
                if entry.status.status == ServerStatus::Busy {
                    return None;
                }
                let before = entry.status.clone();

                if let (Some(identities), Some(candidates)) = (&identities, &candidate_names) {
                    match reconcile::best_match(
                        name.as_str(),
                        &self.config.container_prefix,
                        candidates,
                    ) {
                        Some(matched) => {
                            let info = identities
                                .iter()
                                .find(|c| c.name == matched)
                                .expect("matched candidate comes from this list");
                            entry.status.status = ServerStatus::Online;
                            entry.status.uptime = info.uptime.clone();
                            entry.status.up_days = info.up_days;
                        }
                        None => {
                            entry.status.status = ServerStatus::Offline;
                            entry.status.uptime.clear();
                            entry.status.up_days = 0;
                            entry.status.cpu_percent = 0.0;
                            entry.status.memory.clear();
                            entry.status.memory_percent = 0.0;
                            entry.status.players_online = 0;
                        }
                    }
                }

                if let (Some(usage), Some(names)) = (&usage, &usage_names) {
                    match reconcile::best_match(
                        name.as_str(),
                        &self.config.container_prefix,
                        names,
                    ) {
                        Some(matched) => {
                            let row = usage
                                .iter()
                                .find(|r| r.name == matched)
                                .expect("matched candidate comes from this list");
                            entry.status.cpu_percent = row.cpu_percent;
                            entry.status.memory = row.memory.clone();
                            entry.status.memory_percent = row.memory_percent;
                        }
                        None => {
                            entry.status.cpu_percent = 0.0;
                            entry.status.memory.clear();
                            entry.status.memory_percent = 0.0;
                        }
                    }
                }

                // Host figures apply uniformly: one shared host.
                entry.status.disk_percent = host.disk_percent;
                entry.status.net_rx_kibps = host.net_rx_kibps;
                entry.status.net_tx_kibps = host.net_tx_kibps;

                let transition = match (before.status, entry.status.status) {
                    (ServerStatus::Offline, ServerStatus::Online) => Some(TransitionKind::Started),
                    (ServerStatus::Online, ServerStatus::Offline) => {
                        if entry.status.shutdown_pending {
                            entry.status.shutdown_pending = false;
                            Some(TransitionKind::ShutdownCompleted)
                        } else {
                            Some(TransitionKind::UnexpectedStop)
                        }
                    }
                    _ => None,
                };

                Some((before, entry.status.clone(), transition))
            });

            let Some(Some((before, after, transition))) = outcome else {
                continue;
            };
            if let Some(kind) = transition {
                events.push(FleetEvent::StatusChanged {
                    name: name.clone(),
                    from: before.status,
                    to: after.status,
                    kind,
                });
            }
            if after != before {
                events.push(FleetEvent::InstanceUpdated {
                    name: name.clone(),
                    status: after,
                });
            }
        }

        for event in events {
            self.bus.emit(event);
        }
    }

    async fn query_identities(&self, command: &str, timeout: std::time::Duration) -> Option<Vec<ContainerInfo>> {
        let output = match self.channel.execute_with_timeout(command, timeout).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(stderr = %output.stderr.trim(), "container listing failed");
                return None;
            }
            Err(err) => {
                warn!(%err, "container listing failed");
                return None;
            }
        };
        match parse_identities(&output.stdout) {
            Ok(list) => Some(list),
            Err(err) => {
                warn!(%err, "container listing unparseable");
                None
            }
        }
    }

    async fn query_usage(&self, command: &str, timeout: std::time::Duration) -> Option<Vec<UsageRow>> {
        let output = match self.channel.execute_with_timeout(command, timeout).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(stderr = %output.stderr.trim(), "usage table query failed");
                return None;
            }
            Err(err) => {
                warn!(%err, "usage table query failed");
                return None;
            }
        };
        match parse_usage(&output.stdout) {
            Ok(rows) => Some(rows),
            Err(err) => {
                warn!(%err, "usage table unparseable");
                None
            }
        }
    }

    /// Refresh host-wide figures, retaining the previous value for any
    /// probe that fails.
    async fn query_host(&self, timeout: std::time::Duration) -> HostMetrics {
        let df_cmd = format!("df -P {}", shell_escape_path(&self.config.base_dir));
        let mut state = self.tick_state.lock().await;
        let previous_host = state.host.clone();

        if let Some(stdout) = self.probe("cat /proc/stat", timeout).await {
            match CpuSample::parse(&stdout) {
                Ok(sample) => {
                    if let Some(previous) = state.prev_cpu {
                        state.host.cpu_percent = sample.percent_since(&previous);
                    }
                    state.prev_cpu = Some(sample);
                }
                Err(err) => warn!(%err, "cpu probe unparseable"),
            }
        }

        if let Some(stdout) = self.probe("cat /proc/meminfo", timeout).await {
            match MemorySample::parse(&stdout) {
                Ok(sample) => {
                    state.host.memory_used_mb = sample.used_mb();
                    state.host.memory_total_mb = sample.total_mb();
                    state.host.memory_percent = sample.percent();
                }
                Err(err) => warn!(%err, "memory probe unparseable"),
            }
        }

        if let Some(stdout) = self.probe(&df_cmd, timeout).await {
            match parse_disk_percent(&stdout) {
                Ok(percent) => state.host.disk_percent = percent,
                Err(err) => warn!(%err, "disk probe unparseable"),
            }
        }

        if let Some(stdout) = self.probe("cat /proc/net/dev", timeout).await {
            match NetSample::parse(&stdout) {
                Ok(sample) => {
                    let now = Instant::now();
                    if let Some((previous, at)) = state.prev_net {
                        let elapsed = now.duration_since(at).as_secs_f64();
                        let (rx, tx) = sample.rates_since(&previous, elapsed);
                        state.host.net_rx_kibps = rx;
                        state.host.net_tx_kibps = tx;
                    }
                    state.prev_net = Some((sample, now));
                }
                Err(err) => warn!(%err, "network probe unparseable"),
            }
        }

        let host = state.host.clone();
        drop(state);
        if host != previous_host {
            self.bus
                .emit(FleetEvent::HostMetricsUpdated { metrics: host.clone() });
        }
        host
    }

    async fn probe(&self, command: &str, timeout: std::time::Duration) -> Option<String> {
        match self.channel.execute_with_timeout(command, timeout).await {
            Ok(output) if output.success() => Some(output.stdout),
            Ok(output) => {
                warn!(command, stderr = %output.stderr.trim(), "host probe failed");
                None
            }
            Err(err) => {
                warn!(command, %err, "host probe failed");
                None
            }
        }
    }
}

fn parse_identities(stdout: &str) -> Result<Vec<ContainerInfo>, ParseError> {
    let mut list = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, status) = line
            .split_once(';')
            .ok_or_else(|| ParseError::new("docker ps", line.to_string()))?;
        list.push(ContainerInfo {
            name: name.trim().to_string(),
            uptime: status.trim().to_string(),
            up_days: parse_up_days(status),
        });
    }
    Ok(list)
}

/// Extract the whole-day count from a `docker ps` status like `"Up 3 days"`.
fn parse_up_days(status: &str) -> u32 {
    let mut tokens = status.split_whitespace();
    if tokens.next() != Some("Up") {
        return 0;
    }
    let Some(count) = tokens.next() else { return 0 };
    match tokens.next() {
        Some(unit) if unit.starts_with("day") => count.parse().unwrap_or(0),
        _ => 0,
    }
}

fn parse_usage(stdout: &str) -> Result<Vec<UsageRow>, ParseError> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() != 4 {
            return Err(ParseError::new("docker stats", line.to_string()));
        }
        rows.push(UsageRow {
            name: fields[0].trim().to_string(),
            cpu_percent: parse_percent(fields[1])
                .ok_or_else(|| ParseError::new("docker stats", line.to_string()))?,
            memory: fields[2].trim().to_string(),
            memory_percent: parse_percent(fields[3])
                .ok_or_else(|| ParseError::new("docker stats", line.to_string()))?,
        });
    }
    Ok(rows)
}

fn parse_percent(field: &str) -> Option<f64> {
    field.trim().trim_end_matches('%').parse().ok()
}
