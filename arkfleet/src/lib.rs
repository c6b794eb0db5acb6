//! Core library for managing a fleet of ASA game-server containers on a
//! remote Linux host.
//!
//! Everything talks to the host through one [`RemoteChannel`], which
//! serializes remote commands over a single SSH session. [`FleetDiscovery`]
//! builds the initial [`InstanceRegistry`] from the host's directory layout,
//! the [`MonitoringLoop`] keeps the registry fresh by polling the container
//! runtime, and the [`LifecycleOrchestrator`] runs start/stop/update/backup
//! operations against individual instances. Consumers (a UI, a notification
//! service, an audit log) subscribe to the [`EventBus`] and never touch the
//! wire directly.

#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod inifile;
pub mod lifecycle;
pub mod metrics;
pub mod monitor;
pub mod privilege;
pub mod reconcile;
pub mod registry;
pub mod testing;
pub mod types;

pub use channel::{CommandOutput, RemoteChannel, Transport};
pub use config::FleetConfig;
pub use discovery::FleetDiscovery;
pub use errors::{ChannelError, ConfigError, ConnectError, OpError, ParseError};
pub use events::{EventBus, FleetEvent, Operation, TransitionKind};
pub use lifecycle::LifecycleOrchestrator;
pub use monitor::MonitoringLoop;
pub use privilege::{PrivilegeEscalationResolver, PrivilegeMode};
pub use registry::{InstanceEntry, InstanceRegistry};
pub use types::{
    AuthMethod, ConnectionCredential, HostMetrics, Instance, InstanceName, RuntimeStatus,
    ServerStatus,
};
