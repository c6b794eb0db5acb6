//! SSH transport backed by libssh2.
//!
//! Blocking by design: the channel worker thread is the only caller. Errors
//! are classified so the channel can tell a dropped session from a command
//! that merely failed.

use std::io::{BufRead, BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use ssh2::{ErrorCode, Session};
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{CommandOutput, Transport};
use crate::errors::{ConnectError, TransportError};
use crate::types::{AuthMethod, ConnectionCredential};

// libssh2 session-level error codes that mean the socket is gone.
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

/// Production [`Transport`] over one SSH session.
pub struct SshTransport {
    session: Option<Session>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            session: None,
            connect_timeout,
        }
    }

    fn open_channel(
        session: &Session,
        timeout: Duration,
    ) -> Result<ssh2::Channel, TransportError> {
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session.channel_session().map_err(classify)
    }
}

impl Transport for SshTransport {
    fn connect(&mut self, credential: &ConnectionCredential) -> Result<(), ConnectError> {
        let address = (credential.host.as_str(), credential.port)
            .to_socket_addrs()
            .map_err(|err| ConnectError::Unreachable {
                host: credential.host.clone(),
                port: credential.port,
                reason: err.to_string(),
            })?
            .next()
            .ok_or_else(|| ConnectError::Unreachable {
                host: credential.host.clone(),
                port: credential.port,
                reason: "no addresses resolved".to_string(),
            })?;

        let stream =
            TcpStream::connect_timeout(&address, self.connect_timeout).map_err(|err| {
                if err.kind() == std::io::ErrorKind::TimedOut {
                    ConnectError::Timeout {
                        host: credential.host.clone(),
                        port: credential.port,
                    }
                } else {
                    ConnectError::Unreachable {
                        host: credential.host.clone(),
                        port: credential.port,
                        reason: err.to_string(),
                    }
                }
            })?;

        let mut session =
            Session::new().map_err(|err| ConnectError::Handshake(err.to_string()))?;
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|err| ConnectError::Handshake(err.to_string()))?;

        match &credential.auth {
            AuthMethod::Password(password) => session
                .userauth_password(&credential.username, password)
                .map_err(|_| ConnectError::AuthFailed {
                    user: credential.username.clone(),
                    host: credential.host.clone(),
                })?,
            AuthMethod::KeyFile(path) => session
                .userauth_pubkey_file(&credential.username, None, path, None)
                .map_err(|_| ConnectError::AuthFailed {
                    user: credential.username.clone(),
                    host: credential.host.clone(),
                })?,
        }
        if !session.authenticated() {
            return Err(ConnectError::AuthFailed {
                user: credential.username.clone(),
                host: credential.host.clone(),
            });
        }

        session.set_keepalive(true, 15);
        session.set_blocking(true);
        debug!(host = %credential.host, port = credential.port, "ssh session established");
        self.session = Some(session);
        Ok(())
    }

    fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TransportError::SessionLost("no session".to_string()))?;

        let mut channel = Self::open_channel(session, timeout)?;
        channel.exec(command).map_err(classify)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(classify_io)?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(classify_io)?;

        let _ = channel.wait_close();
        let exit_code = channel.exit_status().unwrap_or(-1);
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn exec_streamed(
        &mut self,
        command: &str,
        timeout: Duration,
        lines: &mpsc::UnboundedSender<String>,
    ) -> Result<CommandOutput, TransportError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TransportError::SessionLost("no session".to_string()))?;

        let mut channel = Self::open_channel(session, timeout)?;
        // Fold stderr into the stream so the transcript is one sequence.
        channel
            .handle_extended_data(ssh2::ExtendedData::Merge)
            .map_err(classify)?;
        channel.exec(command).map_err(classify)?;

        let mut transcript = String::new();
        {
            let reader = BufReader::new(&mut channel);
            for line in reader.lines() {
                let line = line.map_err(classify_io)?;
                let _ = lines.send(line.clone());
                transcript.push_str(&line);
                transcript.push('\n');
            }
        }

        let _ = channel.wait_close();
        let exit_code = channel.exit_status().unwrap_or(-1);
        Ok(CommandOutput {
            stdout: transcript,
            stderr: String::new(),
            exit_code,
        })
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing", None);
        }
    }
}

fn classify(err: ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND
            | LIBSSH2_ERROR_SOCKET_DISCONNECT
            | LIBSSH2_ERROR_SOCKET_RECV,
        ) => TransportError::SessionLost(err.to_string()),
        _ => TransportError::Failed(err.to_string()),
    }
}

fn classify_io(err: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => TransportError::SessionLost(err.to_string()),
        _ => TransportError::Failed(err.to_string()),
    }
}
