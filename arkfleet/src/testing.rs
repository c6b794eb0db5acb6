//! Scripted transport for tests.
//!
//! [`MockTransport`] stands in for the SSH transport so channel, monitoring,
//! discovery, and lifecycle tests run without a live host. Responses are
//! rules matched by substring in insertion order; repeated rules for the
//! same pattern form a response sequence (the last response repeats). A
//! tiny emulated remote filesystem backs the channel's `base64`-encoded
//! file operations, so file round-trip tests exercise the real encode and
//! decode paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;

use crate::channel::{CommandOutput, Transport};
use crate::errors::{ConnectError, TransportError};
use crate::types::ConnectionCredential;

/// One scripted response.
#[derive(Debug, Clone)]
enum MockResponse {
    Output(CommandOutput),
    Lines(Vec<String>),
    SessionLost,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    responses: Vec<MockResponse>,
    served: usize,
}

impl Rule {
    fn next(&mut self) -> MockResponse {
        let idx = self.served.min(self.responses.len() - 1);
        self.served += 1;
        self.responses[idx].clone()
    }
}

#[derive(Debug, Default)]
struct MockState {
    rules: Vec<Rule>,
    executed: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    connects: usize,
    fail_next_connect: bool,
}

impl MockState {
    fn push(&mut self, pattern: &str, response: MockResponse) {
        if let Some(rule) = self.rules.iter_mut().find(|r| r.pattern == pattern) {
            rule.responses.push(response);
        } else {
            self.rules.push(Rule {
                pattern: pattern.to_string(),
                responses: vec![response],
                served: 0,
            });
        }
    }

    fn respond(&mut self, command: &str) -> MockResponse {
        if let Some(rule) = self
            .rules
            .iter_mut()
            .find(|rule| command.contains(&rule.pattern))
        {
            return rule.next();
        }
        if let Some(output) = self.emulate_file_ops(command) {
            return MockResponse::Output(output);
        }
        MockResponse::Output(CommandOutput::default())
    }

    /// Emulate the channel's base64 file plumbing against the in-memory fs.
    fn emulate_file_ops(&mut self, command: &str) -> Option<CommandOutput> {
        if let Some(rest) = command.strip_prefix("base64 ") {
            let path = unquote(rest.trim());
            return Some(match self.files.get(&path) {
                Some(bytes) => CommandOutput {
                    stdout: BASE64.encode(bytes),
                    ..Default::default()
                },
                None => CommandOutput {
                    exit_code: 1,
                    stderr: format!("base64: {}: No such file or directory", path),
                    ..Default::default()
                },
            });
        }
        if command.contains("| base64 -d > ") {
            let encoded = command.split_once("printf %s '")?.1.split_once('\'')?.0;
            let move_args = command.rsplit_once("mv -f ")?.1;
            let final_path = unquote(move_args.split_whitespace().last()?);
            let bytes = BASE64.decode(encoded).ok()?;
            self.files.insert(final_path, bytes);
            return Some(CommandOutput::default());
        }
        None
    }
}

fn unquote(token: &str) -> String {
    token.chars().filter(|c| *c != '\'').collect()
}

/// Inspection handle retained by tests after the transport moves into the
/// channel.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Commands executed so far, in wire order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    /// How many times a command containing `pattern` was executed.
    pub fn count(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|cmd| cmd.contains(pattern))
            .count()
    }

    /// Content of an emulated remote file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Append another scripted response after the transport has been
    /// handed to the channel.
    pub fn script(&self, pattern: &str, stdout: &str) {
        self.state.lock().unwrap().push(
            pattern,
            MockResponse::Output(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
        );
    }
}

/// Scripted [`Transport`] implementation.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }

    /// Respond to commands containing `pattern` with `stdout` and exit 0.
    /// Repeated calls with the same pattern build a response sequence.
    pub fn on(self, pattern: &str, stdout: &str) -> Self {
        self.state.lock().unwrap().push(
            pattern,
            MockResponse::Output(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
        );
        self
    }

    /// Respond with a non-zero exit and the given stderr.
    pub fn on_fail(self, pattern: &str, stderr: &str) -> Self {
        self.state.lock().unwrap().push(
            pattern,
            MockResponse::Output(CommandOutput {
                exit_code: 1,
                stderr: stderr.to_string(),
                ..Default::default()
            }),
        );
        self
    }

    /// Respond with a full output value.
    pub fn on_output(self, pattern: &str, output: CommandOutput) -> Self {
        self.state
            .lock()
            .unwrap()
            .push(pattern, MockResponse::Output(output));
        self
    }

    /// Stream the given lines, then exit 0.
    pub fn on_lines(self, pattern: &str, lines: &[&str]) -> Self {
        self.state.lock().unwrap().push(
            pattern,
            MockResponse::Lines(lines.iter().map(|l| l.to_string()).collect()),
        );
        self
    }

    /// Simulate a dropped session when a matching command runs.
    pub fn lost_on(self, pattern: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .push(pattern, MockResponse::SessionLost);
        self
    }

    /// Seed the emulated remote filesystem.
    pub fn with_file(self, path: &str, bytes: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), bytes.to_vec());
        self
    }

    /// Make the next `connect` fail with an auth error.
    pub fn fail_next_connect(self) -> Self {
        self.state.lock().unwrap().fail_next_connect = true;
        self
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, credential: &ConnectionCredential) -> Result<(), ConnectError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_next_connect {
            state.fail_next_connect = false;
            return Err(ConnectError::AuthFailed {
                user: credential.username.clone(),
                host: credential.host.clone(),
            });
        }
        Ok(())
    }

    fn exec(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(command.to_string());
        match state.respond(command) {
            MockResponse::Output(output) => Ok(output),
            MockResponse::Lines(lines) => Ok(CommandOutput {
                stdout: lines.join("\n"),
                ..Default::default()
            }),
            MockResponse::SessionLost => {
                Err(TransportError::SessionLost("mock session drop".to_string()))
            }
        }
    }

    fn exec_streamed(
        &mut self,
        command: &str,
        _timeout: Duration,
        lines: &mpsc::UnboundedSender<String>,
    ) -> Result<CommandOutput, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(command.to_string());
        match state.respond(command) {
            MockResponse::Output(output) => {
                for line in output.stdout.lines() {
                    let _ = lines.send(line.to_string());
                }
                Ok(output)
            }
            MockResponse::Lines(scripted) => {
                let mut transcript = String::new();
                for line in &scripted {
                    let _ = lines.send(line.clone());
                    transcript.push_str(line);
                    transcript.push('\n');
                }
                Ok(CommandOutput {
                    stdout: transcript,
                    ..Default::default()
                })
            }
            MockResponse::SessionLost => {
                Err(TransportError::SessionLost("mock session drop".to_string()))
            }
        }
    }

    fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_rules_form_a_sequence() {
        let mut transport = MockTransport::new()
            .on_fail("docker info", "permission denied")
            .on("docker info", "ok");

        let first = transport.exec("docker info", Duration::from_secs(1)).unwrap();
        assert!(!first.success());
        let second = transport.exec("docker info", Duration::from_secs(1)).unwrap();
        assert!(second.success());
        // The last response repeats.
        let third = transport.exec("docker info", Duration::from_secs(1)).unwrap();
        assert!(third.success());
    }

    #[test]
    fn unmatched_commands_succeed_with_empty_output() {
        let mut transport = MockTransport::new();
        let output = transport.exec("true", Duration::from_secs(1)).unwrap();
        assert!(output.success());
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn file_emulation_serves_seeded_content() {
        let mut transport = MockTransport::new().with_file("/srv/a.txt", b"hello");
        let output = transport
            .exec("base64 /srv/a.txt", Duration::from_secs(1))
            .unwrap();
        assert_eq!(output.stdout, BASE64.encode(b"hello"));
    }
}
