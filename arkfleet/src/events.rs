//! Typed event broadcast for fleet state changes.
//!
//! The monitoring loop and the lifecycle orchestrator publish immutable
//! events here; consumers (UI, notification service, audit log) subscribe
//! without the core depending on any particular presentation model.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{HostMetrics, InstanceName, RuntimeStatus, ServerStatus};

const DEFAULT_BUFFER: usize = 256;

/// Lifecycle operation kinds, for event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Start,
    Stop,
    ScheduledShutdown,
    Update,
    Backup,
}

/// Why a status transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// `Offline -> Online`.
    Started,
    /// `Online -> Offline` with no scheduled shutdown pending.
    UnexpectedStop,
    /// `Online -> Offline` completing a previously scheduled shutdown.
    ShutdownCompleted,
}

/// Events published by the fleet core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    /// Discovery registered a new instance.
    InstanceDiscovered { name: InstanceName },
    /// An instance's observable fields changed during a monitoring tick.
    InstanceUpdated {
        name: InstanceName,
        status: RuntimeStatus,
    },
    /// An `Online <-> Offline` transition was observed.
    StatusChanged {
        name: InstanceName,
        from: ServerStatus,
        to: ServerStatus,
        kind: TransitionKind,
    },
    /// Fresh host-wide metrics.
    HostMetricsUpdated { metrics: HostMetrics },
    /// The remote session dropped; an explicit reconnect is required.
    ConnectionLost,
    /// A lifecycle operation began.
    OperationStarted {
        name: InstanceName,
        operation: Operation,
    },
    /// One line of live output from a streaming operation (update, backup).
    OperationOutput { name: InstanceName, line: String },
    /// Per-second progress while draining before a stop.
    DrainProgress {
        name: InstanceName,
        remaining_secs: u64,
    },
    /// A lifecycle operation finished.
    OperationFinished {
        name: InstanceName,
        operation: Operation,
        success: bool,
        error: Option<String>,
    },
}

/// Broadcast channel for [`FleetEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    /// Create a new event bus with the provided buffer size.
    ///
    /// The effective buffer is clamped to at least `DEFAULT_BUFFER` to avoid
    /// lag/drop behavior for bursty event streams.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1).max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: FleetEvent) {
        trace!(?event, "emitting fleet event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}
