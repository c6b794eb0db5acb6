//! arkfleet daemon and control CLI.
//!
//! Wires the core library together: connects the remote channel, runs
//! discovery, keeps the monitoring loop ticking, and emits fleet events as
//! JSON lines on stdout for any consumer to ingest. Lifecycle operations
//! are exposed as subcommands.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use arkfleet::channel::SshTransport;
use arkfleet::{
    ConnectionCredential, EventBus, FleetConfig, FleetDiscovery, FleetEvent, InstanceName,
    InstanceRegistry, LifecycleOrchestrator, MonitoringLoop, PrivilegeEscalationResolver,
    RemoteChannel,
};

#[derive(Parser)]
#[command(name = "arkfleetd")]
#[command(author, version, about = "arkfleet daemon - remote game-server fleet control")]
struct Cli {
    /// Path to the fleet configuration (TOML); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the connection credential file (TOML)
    #[arg(long, default_value = "connection.toml")]
    connection: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitoring daemon, emitting events as JSON lines (default)
    Run,
    /// Print a one-shot fleet snapshot and exit
    Status,
    /// Start an instance
    Start { name: String },
    /// Gracefully stop an instance
    Stop { name: String },
    /// Schedule a delayed shutdown
    Shutdown {
        name: String,
        /// Delay in minutes before the remote host stops the instance
        #[arg(default_value_t = 5)]
        minutes: u32,
    },
    /// Update an instance (stop, update, start)
    Update {
        name: String,
        /// Skip the pre/post waits
        #[arg(long)]
        immediate: bool,
    },
    /// Run a backup with live output
    Backup { name: String },
}

/// Everything a subcommand needs, wired once per process.
struct Fleet {
    channel: RemoteChannel,
    credential: ConnectionCredential,
    registry: Arc<InstanceRegistry>,
    bus: EventBus,
    privilege: Arc<PrivilegeEscalationResolver>,
    monitor: MonitoringLoop,
    lifecycle: LifecycleOrchestrator,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => FleetConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FleetConfig::default(),
    };
    let credential = load_credential(&cli.connection)?;

    let fleet = connect(config, credential).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(&fleet).await?,
        Command::Status => {
            fleet.monitor.tick_now().await;
            let snapshot = fleet.registry.snapshot_all();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Start { name } => {
            let name = InstanceName::new(name);
            run_operation(&fleet, fleet.lifecycle.start(&name)).await?
        }
        Command::Stop { name } => {
            let name = InstanceName::new(name);
            run_operation(&fleet, fleet.lifecycle.stop(&name)).await?
        }
        Command::Shutdown { name, minutes } => {
            let name = InstanceName::new(name);
            run_operation(&fleet, fleet.lifecycle.scheduled_shutdown(&name, minutes)).await?
        }
        Command::Update { name, immediate } => {
            let name = InstanceName::new(name);
            run_operation(&fleet, fleet.lifecycle.update(&name, immediate)).await?
        }
        Command::Backup { name } => {
            let name = InstanceName::new(name);
            run_operation(&fleet, fleet.lifecycle.backup(&name)).await?
        }
    }

    fleet.monitor.stop();
    fleet.channel.disconnect().await;
    Ok(())
}

fn load_credential(path: &PathBuf) -> Result<ConnectionCredential> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading connection file {}", path.display()))?;
    toml::from_str(&content).context("parsing connection file")
}

async fn connect(config: FleetConfig, credential: ConnectionCredential) -> Result<Fleet> {
    let config = Arc::new(config);
    let transport = SshTransport::new(config.connect_timeout());
    let channel = RemoteChannel::spawn(transport, config.command_timeout());
    channel
        .connect(credential.clone())
        .await
        .context("connecting to remote host")?;

    let registry = Arc::new(InstanceRegistry::new());
    let bus = EventBus::default();
    let privilege = Arc::new(PrivilegeEscalationResolver::new(
        channel.clone(),
        credential.username.clone(),
        credential.sudo_password.clone(),
    ));

    let discovery = FleetDiscovery::new(
        channel.clone(),
        registry.clone(),
        bus.clone(),
        config.clone(),
    );
    let discovered = discovery.run().await.context("discovering fleet")?;
    info!("discovered {} new instances", discovered.len());

    let monitor = MonitoringLoop::new(
        channel.clone(),
        registry.clone(),
        bus.clone(),
        privilege.clone(),
        config.clone(),
    );
    // Prime the registry so consumers see real statuses immediately.
    monitor.tick_now().await;

    let lifecycle = LifecycleOrchestrator::new(
        channel.clone(),
        registry.clone(),
        bus.clone(),
        privilege.clone(),
        config,
    );

    Ok(Fleet {
        channel,
        credential,
        registry,
        bus,
        privilege,
        monitor,
        lifecycle,
    })
}

/// Run the monitoring daemon until ctrl-c, printing every fleet event as a
/// JSON line and reconnecting when the session drops.
async fn run_daemon(fleet: &Fleet) -> Result<()> {
    fleet.monitor.start();
    let mut events = fleet.bus.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(FleetEvent::ConnectionLost) => {
                    println!("{}", timestamped(&FleetEvent::ConnectionLost)?);
                    reconnect(fleet).await;
                }
                Ok(event) => println!("{}", timestamped(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

/// Render an event as one JSON line with an RFC3339 timestamp.
fn timestamped(event: &FleetEvent) -> Result<String> {
    let mut value = serde_json::to_value(event)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "timestamp".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
    Ok(value.to_string())
}

/// Re-establish the session after a drop, then re-resolve privileges.
async fn reconnect(fleet: &Fleet) {
    loop {
        warn!("connection lost, attempting reconnect");
        match fleet.channel.connect(fleet.credential.clone()).await {
            Ok(()) => {
                info!("reconnected");
                fleet.privilege.invalidate();
                return;
            }
            Err(err) => {
                warn!(%err, "reconnect failed, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Run one lifecycle operation, mirroring its progress events to stdout.
async fn run_operation<Fut>(fleet: &Fleet, operation: Fut) -> Result<()>
where
    Fut: Future<Output = Result<(), arkfleet::OpError>>,
{
    let mut events = fleet.bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                FleetEvent::OperationOutput { line, .. } => println!("{line}"),
                FleetEvent::DrainProgress { remaining_secs, .. } => {
                    info!(remaining_secs, "draining")
                }
                FleetEvent::OperationFinished { .. } => {
                    if let Ok(json) = timestamped(&event) {
                        println!("{json}");
                    }
                    break;
                }
                _ => {}
            }
        }
    });

    let result = operation.await;
    let _ = printer.await;
    result.map_err(Into::into)
}
