//! Serialized remote command channel.
//!
//! One live SSH session per channel, owned by a dedicated worker thread.
//! Every operation is a job on a FIFO queue, so at most one remote exchange
//! is in flight at any time regardless of how many tasks hold the handle;
//! the underlying transport cannot safely multiplex concurrent commands.
//! Callers that go away simply drop their reply receiver: the in-flight
//! command finishes and its result is discarded (cancellation is
//! cooperative, between commands, never mid-command).
//!
//! A transport failure that indicates the session itself dropped (as
//! opposed to a command returning non-zero) raises a `ConnectionLost`
//! notification exactly once, flips the channel into a disconnected state,
//! and fails every queued and subsequent job fast until `connect` succeeds
//! again.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::{ChannelError, ConnectError, TransportError};
use crate::types::ConnectionCredential;

mod ssh;
pub use ssh::SshTransport;

const LOST_BUFFER: usize = 16;

/// Output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Blocking transport owned by the channel worker thread.
///
/// Implementations classify failures: [`TransportError::SessionLost`] for a
/// dropped session, [`TransportError::Failed`] for anything that leaves the
/// session usable.
pub trait Transport: Send + 'static {
    fn connect(&mut self, credential: &ConnectionCredential) -> Result<(), ConnectError>;

    fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError>;

    /// Execute while forwarding each output line (stderr merged) as it is
    /// produced.
    fn exec_streamed(
        &mut self,
        command: &str,
        timeout: Duration,
        lines: &mpsc::UnboundedSender<String>,
    ) -> Result<CommandOutput, TransportError>;

    fn disconnect(&mut self);
}

enum Job {
    Connect {
        credential: Box<ConnectionCredential>,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Exec {
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<CommandOutput, ChannelError>>,
    },
    ExecStreamed {
        command: String,
        timeout: Duration,
        lines: mpsc::UnboundedSender<String>,
        reply: oneshot::Sender<Result<CommandOutput, ChannelError>>,
    },
    ReadFile {
        path: String,
        reply: oneshot::Sender<Result<Vec<u8>, ChannelError>>,
    },
    WriteFile {
        path: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

struct Shared {
    connected: AtomicBool,
    lost: AtomicBool,
}

/// Cloneable async handle to the channel worker.
#[derive(Clone)]
pub struct RemoteChannel {
    jobs: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
    lost_tx: broadcast::Sender<()>,
    default_timeout: Duration,
}

impl RemoteChannel {
    /// Spawn the worker thread around a transport. The channel starts
    /// disconnected; call [`connect`](Self::connect) before issuing work.
    pub fn spawn<T: Transport>(transport: T, default_timeout: Duration) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });
        let (lost_tx, _) = broadcast::channel(LOST_BUFFER);

        let worker_shared = shared.clone();
        let worker_lost = lost_tx.clone();
        std::thread::Builder::new()
            .name("remote-channel".to_string())
            .spawn(move || run_worker(Box::new(transport), jobs_rx, worker_shared, worker_lost))
            .expect("failed to spawn channel worker thread");

        Self {
            jobs: jobs_tx,
            shared,
            lost_tx,
            default_timeout,
        }
    }

    /// Establish (or re-establish) the session.
    pub async fn connect(&self, credential: ConnectionCredential) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Connect {
                credential: Box::new(credential),
                reply,
            })
            .map_err(|_| ConnectError::Handshake("channel worker shut down".to_string()))?;
        rx.await
            .map_err(|_| ConnectError::Handshake("channel worker shut down".to_string()))?
    }

    /// Execute a command with the channel's default timeout.
    pub async fn execute(&self, command: &str) -> Result<CommandOutput, ChannelError> {
        self.execute_with_timeout(command, self.default_timeout)
            .await
    }

    /// Execute a command with an explicit timeout.
    pub async fn execute_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ChannelError> {
        self.fail_fast()?;
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::Exec {
                command: command.to_string(),
                timeout,
                reply,
            },
            rx,
        )
        .await
    }

    /// Execute a command, forwarding output lines as they arrive.
    pub async fn execute_streamed(
        &self,
        command: &str,
        lines: mpsc::UnboundedSender<String>,
    ) -> Result<CommandOutput, ChannelError> {
        self.fail_fast()?;
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::ExecStreamed {
                command: command.to_string(),
                timeout: self.default_timeout,
                lines,
                reply,
            },
            rx,
        )
        .await
    }

    /// Read a remote file's bytes. Content is transport-encoded, so
    /// arbitrary bytes survive the shell boundary.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, ChannelError> {
        self.fail_fast()?;
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::ReadFile {
                path: path.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Write a remote file atomically: the content lands at a temporary
    /// sibling path and is renamed into place, so a reader never observes a
    /// partial file.
    pub async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), ChannelError> {
        self.fail_fast()?;
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::WriteFile {
                path: path.to_string(),
                bytes: bytes.to_vec(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Tear down the session. Queued jobs ahead of this one still run.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.jobs.send(Job::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Subscribe to connection-lost notifications (one per drop).
    pub fn subscribe_lost(&self) -> broadcast::Receiver<()> {
        self.lost_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn fail_fast(&self) -> Result<(), ChannelError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else if self.shared.lost.load(Ordering::SeqCst) {
            Err(ChannelError::ConnectionLost)
        } else {
            Err(ChannelError::NotConnected)
        }
    }

    async fn submit<R>(
        &self,
        job: Job,
        rx: oneshot::Receiver<Result<R, ChannelError>>,
    ) -> Result<R, ChannelError> {
        self.jobs.send(job).map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }
}

fn run_worker(
    mut transport: Box<dyn Transport>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
    lost_tx: broadcast::Sender<()>,
) {
    // Set once per drop, reset by the next successful connect.
    let mut lost_signaled = false;

    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Connect { credential, reply } => {
                transport.disconnect();
                let result = transport.connect(&credential);
                match &result {
                    Ok(()) => {
                        info!(host = %credential.host, "remote channel connected");
                        shared.connected.store(true, Ordering::SeqCst);
                        shared.lost.store(false, Ordering::SeqCst);
                        lost_signaled = false;
                    }
                    Err(err) => {
                        warn!(host = %credential.host, %err, "remote connect failed");
                        shared.connected.store(false, Ordering::SeqCst);
                    }
                }
                let _ = reply.send(result);
            }
            Job::Disconnect { reply } => {
                transport.disconnect();
                shared.connected.store(false, Ordering::SeqCst);
                shared.lost.store(false, Ordering::SeqCst);
                let _ = reply.send(());
            }
            Job::Exec {
                command,
                timeout,
                reply,
            } => {
                let result = guarded_exec(
                    &mut transport,
                    &command,
                    timeout,
                    None,
                    &shared,
                    &lost_tx,
                    &mut lost_signaled,
                );
                let _ = reply.send(result);
            }
            Job::ExecStreamed {
                command,
                timeout,
                lines,
                reply,
            } => {
                let result = guarded_exec(
                    &mut transport,
                    &command,
                    timeout,
                    Some(&lines),
                    &shared,
                    &lost_tx,
                    &mut lost_signaled,
                );
                let _ = reply.send(result);
            }
            Job::ReadFile { path, reply } => {
                let result = read_file(
                    &mut transport,
                    &path,
                    &shared,
                    &lost_tx,
                    &mut lost_signaled,
                );
                let _ = reply.send(result);
            }
            Job::WriteFile { path, bytes, reply } => {
                let result = write_file(
                    &mut transport,
                    &path,
                    &bytes,
                    &shared,
                    &lost_tx,
                    &mut lost_signaled,
                );
                let _ = reply.send(result);
            }
        }
    }

    transport.disconnect();
    debug!("remote channel worker stopped");
}

/// Run one command, translating transport failures and driving the
/// lost-session state machine.
fn guarded_exec(
    transport: &mut Box<dyn Transport>,
    command: &str,
    timeout: Duration,
    lines: Option<&mpsc::UnboundedSender<String>>,
    shared: &Shared,
    lost_tx: &broadcast::Sender<()>,
    lost_signaled: &mut bool,
) -> Result<CommandOutput, ChannelError> {
    // Jobs queued behind a drop fail fast without touching the transport.
    if !shared.connected.load(Ordering::SeqCst) {
        return Err(if shared.lost.load(Ordering::SeqCst) {
            ChannelError::ConnectionLost
        } else {
            ChannelError::NotConnected
        });
    }

    debug!(command = %crate::privilege::mask_sudo_password(command), "executing remote command");
    let result = match lines {
        Some(lines) => transport.exec_streamed(command, timeout, lines),
        None => transport.exec(command, timeout),
    };

    match result {
        Ok(output) => Ok(output),
        Err(TransportError::Failed(detail)) => Err(ChannelError::Exec(detail)),
        Err(TransportError::SessionLost(detail)) => {
            shared.connected.store(false, Ordering::SeqCst);
            shared.lost.store(true, Ordering::SeqCst);
            if !*lost_signaled {
                warn!(detail, "remote session lost");
                *lost_signaled = true;
                let _ = lost_tx.send(());
            }
            Err(ChannelError::ConnectionLost)
        }
    }
}

fn read_file(
    transport: &mut Box<dyn Transport>,
    path: &str,
    shared: &Shared,
    lost_tx: &broadcast::Sender<()>,
    lost_signaled: &mut bool,
) -> Result<Vec<u8>, ChannelError> {
    let command = format!("base64 {}", shell_escape_path(path));
    let output = guarded_exec(
        transport,
        &command,
        FILE_TIMEOUT,
        None,
        shared,
        lost_tx,
        lost_signaled,
    )?;
    if !output.success() {
        return Err(ChannelError::Transfer(format!(
            "read {}: {}",
            path,
            output.stderr.trim()
        )));
    }
    let compact: String = output
        .stdout
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    BASE64
        .decode(compact)
        .map_err(|err| ChannelError::Transfer(format!("decode {}: {}", path, err)))
}

fn write_file(
    transport: &mut Box<dyn Transport>,
    path: &str,
    bytes: &[u8],
    shared: &Shared,
    lost_tx: &broadcast::Sender<()>,
    lost_signaled: &mut bool,
) -> Result<(), ChannelError> {
    let encoded = BASE64.encode(bytes);
    let tmp = format!("{}.arkfleet-tmp", path);
    let command = format!(
        "printf %s '{}' | base64 -d > {tmp_q} && mv -f {tmp_q} {path_q}",
        encoded,
        tmp_q = shell_escape_path(&tmp),
        path_q = shell_escape_path(path),
    );
    let output = guarded_exec(
        transport,
        &command,
        FILE_TIMEOUT,
        None,
        shared,
        lost_tx,
        lost_signaled,
    )?;
    if !output.success() {
        return Err(ChannelError::Transfer(format!(
            "write {}: {}",
            path,
            output.stderr.trim()
        )));
    }
    Ok(())
}

const FILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Quote a remote path for the shell, leaving a leading `~/` unquoted so
/// the remote shell still expands the home directory.
pub fn shell_escape_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        format!("~/{}", shell_escape::escape(Cow::Borrowed(rest)))
    } else {
        shell_escape::escape(Cow::Borrowed(path)).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::types::AuthMethod;

    fn credential() -> ConnectionCredential {
        ConnectionCredential {
            host: "ark.example".to_string(),
            port: 22,
            username: "ark".to_string(),
            auth: AuthMethod::Password("pw".to_string()),
            sudo_password: None,
        }
    }

    fn timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn shell_escape_path_quotes_but_keeps_home_prefix() {
        assert_eq!(shell_escape_path("~/asa servers"), "~/'asa servers'");
        assert_eq!(shell_escape_path("/srv/plain"), "/srv/plain");
        assert_eq!(shell_escape_path("/srv/with space"), "'/srv/with space'");
    }

    #[tokio::test]
    async fn execute_before_connect_fails_fast() {
        let channel = RemoteChannel::spawn(MockTransport::new(), timeout());
        assert!(matches!(
            channel.execute("echo hi").await,
            Err(ChannelError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn execute_after_connect_returns_output() {
        let mock = MockTransport::new().on("echo hi", "hi\n");
        let channel = RemoteChannel::spawn(mock, timeout());
        channel.connect(credential()).await.unwrap();

        let output = channel.execute("echo hi").await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hi\n");
    }

    #[tokio::test]
    async fn commands_run_in_submission_order() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let channel = RemoteChannel::spawn(mock, timeout());
        channel.connect(credential()).await.unwrap();

        let mut futures = Vec::new();
        for idx in 0..10 {
            let channel = channel.clone();
            futures.push(async move { channel.execute(&format!("cmd-{idx}")).await });
        }
        for future in futures {
            future.await.unwrap();
        }

        let executed = handle.executed();
        let expected: Vec<String> = (0..10).map(|idx| format!("cmd-{idx}")).collect();
        assert_eq!(executed, expected);
    }

    #[tokio::test]
    async fn file_roundtrip_is_byte_identical() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let channel = RemoteChannel::spawn(mock, timeout());
        channel.connect(credential()).await.unwrap();

        let payload = "line \"one\"\nsecond 'line'\nnon-ascii: äöü 🦖\n".as_bytes();
        channel.write_file("/srv/ark/Game.ini", payload).await.unwrap();

        let read_back = channel.read_file("/srv/ark/Game.ini").await.unwrap();
        assert_eq!(read_back, payload);

        // The write used a temporary path and renamed into place.
        let writes = handle.executed();
        let write_cmd = writes.iter().find(|c| c.contains("base64 -d")).unwrap();
        assert!(write_cmd.contains(".arkfleet-tmp"));
        assert!(write_cmd.contains("mv -f"));
    }

    #[tokio::test]
    async fn session_drop_signals_lost_exactly_once_and_fails_fast() {
        let mock = MockTransport::new().lost_on("docker ps");
        let channel = RemoteChannel::spawn(mock, timeout());
        let mut lost_rx = channel.subscribe_lost();
        channel.connect(credential()).await.unwrap();

        assert!(matches!(
            channel.execute("docker ps").await,
            Err(ChannelError::ConnectionLost)
        ));
        // Subsequent work fails fast without touching the transport.
        assert!(matches!(
            channel.execute("echo hi").await,
            Err(ChannelError::ConnectionLost)
        ));

        // Exactly one notification.
        lost_rx.recv().await.unwrap();
        assert!(matches!(
            lost_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn reconnect_after_loss_restores_service() {
        let mock = MockTransport::new().lost_on("docker ps");
        let channel = RemoteChannel::spawn(mock, timeout());
        channel.connect(credential()).await.unwrap();

        let _ = channel.execute("docker ps").await;
        assert!(!channel.is_connected());

        channel.connect(credential()).await.unwrap();
        assert!(channel.is_connected());
        assert!(channel.execute("echo hi").await.is_ok());
    }

    #[tokio::test]
    async fn streamed_execution_forwards_lines() {
        let mock =
            MockTransport::new().on_lines("POK-manager.sh -update", &["step 1", "step 2", "done"]);
        let channel = RemoteChannel::spawn(mock, timeout());
        channel.connect(credential()).await.unwrap();

        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
        let output = channel
            .execute_streamed("POK-manager.sh -update center", lines_tx)
            .await
            .unwrap();
        assert!(output.success());

        let mut collected = Vec::new();
        while let Some(line) = lines_rx.recv().await {
            collected.push(line);
        }
        assert_eq!(collected, vec!["step 1", "step 2", "done"]);
    }

    #[tokio::test]
    async fn dropped_caller_discards_result_without_breaking_channel() {
        let mock = MockTransport::new();
        let channel = RemoteChannel::spawn(mock, timeout());
        channel.connect(credential()).await.unwrap();

        {
            let channel = channel.clone();
            let future = async move { channel.execute("slow-command").await };
            drop(future);
        }

        assert!(channel.execute("echo still-alive").await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_then_execute_is_not_connected() {
        let mock = MockTransport::new();
        let channel = RemoteChannel::spawn(mock, timeout());
        channel.connect(credential()).await.unwrap();
        channel.disconnect().await;

        assert!(matches!(
            channel.execute("echo hi").await,
            Err(ChannelError::NotConnected)
        ));
    }
}
