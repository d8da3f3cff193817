//! Driver-side client for the command channel.
//!
//! This is the component a test harness, tutorial player, or dev inspector
//! holds: it writes one command line, then blocks until the matching
//! response arrives. Requests are strictly serial per channel: the client
//! never has two commands in flight, so responses correlate by order
//! alone. Out-of-band frames the host may interleave (`log`, `network`,
//! `notification`) are skipped while waiting.
//!
//! Error policy follows the protocol taxonomy: a response whose `type`
//! does not echo the command, or a channel that closes mid-request, is a
//! fatal protocol violation; a populated `error` field is a recoverable
//! command failure; an expired polling loop is a timeout carrying the last
//! observed value for diagnostics.

use serde_json::Value;
use std::ffi::OsStr;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Child, ChildStdin, ChildStdout, Command as HostCommand, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::host::command::{Response, encode_argument};

/// Backoff between polling attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Frame types the host may interleave outside the request/response flow.
const OUT_OF_BAND: &[&str] = &["log", "network", "notification"];

/// Errors produced by the [`DriverClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error while communicating with the host.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Malformed JSON frame from the host.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The channel broke the protocol contract; the session is dead.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The host answered with a command error; the session stays usable.
    #[error("command '{command}' failed: {message}")]
    Command {
        /// Command that failed.
        command: String,
        /// Error message from the host.
        message: String,
    },
    /// A polling loop exceeded its deadline.
    #[error("timed out after {waited:?} (last observed: {last:?})")]
    Timeout {
        /// How long the loop ran.
        waited: Duration,
        /// Last value observed before expiry, for diagnostics.
        last: Option<Value>,
    },
    /// Attempted to spawn the host without a command.
    #[error("host command is empty")]
    EmptyHostCommand,
    /// Spawned host is missing a stdout pipe.
    #[error("spawned host process did not expose stdout")]
    MissingStdout,
    /// Spawned host is missing a stdin pipe.
    #[error("spawned host process did not expose stdin")]
    MissingStdin,
}

impl ClientError {
    /// Whether the error leaves the channel usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Command { .. } | ClientError::Timeout { .. }
        )
    }
}

/// One round of a polling loop.
pub enum Poll {
    /// Condition met; the loop returns this value.
    Ready(Value),
    /// Not yet; optionally record what was observed.
    Pending(Option<Value>),
}

/// Synchronous client for the command channel.
///
/// The client communicates over one of two transports:
///   * Spawned host process via stdin/stdout pipes
///   * TCP socket to an already running host
pub struct DriverClient {
    transport: Transport,
}

enum Transport {
    Process {
        child: Child,
        reader: BufReader<ChildStdout>,
        writer: BufWriter<ChildStdin>,
    },
    Tcp {
        reader: BufReader<TcpStream>,
        writer: BufWriter<TcpStream>,
    },
}

impl DriverClient {
    /// Spawn a host process and connect over its stdio pipes.
    pub fn connect_stdio<I, S>(mut command: I) -> Result<Self, ClientError>
    where
        I: Iterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = command.next().ok_or(ClientError::EmptyHostCommand)?;
        let mut child = HostCommand::new(program);
        child.stdin(Stdio::piped());
        child.stdout(Stdio::piped());
        child.stderr(Stdio::inherit());
        for arg in command {
            child.arg(arg);
        }

        let mut child = child.spawn()?;
        let stdout = child.stdout.take().ok_or(ClientError::MissingStdout)?;
        let stdin = child.stdin.take().ok_or(ClientError::MissingStdin)?;

        Ok(DriverClient {
            transport: Transport::Process {
                reader: BufReader::new(stdout),
                writer: BufWriter::new(stdin),
                child,
            },
        })
    }

    /// Connect to a host listening on a TCP socket.
    pub fn connect_tcp<A>(addr: A) -> Result<Self, ClientError>
    where
        A: ToSocketAddrs,
    {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect(candidate) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    let reader = BufReader::new(stream.try_clone()?);
                    let writer = BufWriter::new(stream);
                    return Ok(DriverClient {
                        transport: Transport::Tcp { reader, writer },
                    });
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(ClientError::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no address resolved")
        })))
    }

    /// Issue one command and await its response.
    ///
    /// Arguments are percent-encoded for the wire. Returns the response
    /// `value` (`Null` when the command carries none).
    pub fn issue(&mut self, name: &str, args: &[&str]) -> Result<Value, ClientError> {
        let mut line = String::from(name);
        for arg in args {
            line.push(' ');
            line.push_str(&encode_argument(arg));
        }
        line.push('\n');
        self.transport.write_all(line.as_bytes())?;

        loop {
            let frame = self.transport.read_line()?;
            let response: Response = serde_json::from_slice(&frame)?;

            if OUT_OF_BAND.contains(&response.kind.as_str()) {
                continue;
            }

            if response.kind != name {
                return Err(ClientError::Protocol(format!(
                    "response type mismatch (sent '{name}', got '{}')",
                    response.kind
                )));
            }

            if let Some(message) = response.error {
                return Err(ClientError::Command {
                    command: name.to_string(),
                    message,
                });
            }

            return Ok(response.value.unwrap_or(Value::Null));
        }
    }

    // -- typed wrappers ----------------------------------------------------

    /// Existence check of an element.
    pub fn query(&mut self, id: &str) -> Result<bool, ClientError> {
        Ok(self.issue("query", &[id])?.as_bool().unwrap_or(false))
    }

    /// Read an element property.
    pub fn property(&mut self, id: &str, name: &str) -> Result<Value, ClientError> {
        self.issue("property", &[id, name])
    }

    /// Click an element.
    pub fn click(&mut self, id: &str) -> Result<(), ClientError> {
        self.issue("click", &[id]).map(|_| ())
    }

    /// Write a persisted setting.
    pub fn set_setting(&mut self, key: &str, value: &str) -> Result<(), ClientError> {
        self.issue("set_setting", &[key, value]).map(|_| ())
    }

    /// Toggle a feature's flipped-on state.
    pub fn flip_feature_on(&mut self, name: &str) -> Result<(), ClientError> {
        self.issue("flip_on_feature", &[name]).map(|_| ())
    }

    /// Toggle a feature's flipped-off state.
    pub fn flip_feature_off(&mut self, name: &str) -> Result<(), ClientError> {
        self.issue("flip_off_feature", &[name]).map(|_| ())
    }

    /// Soft-reset the host.
    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.issue("reset", &[]).map(|_| ())
    }

    /// Hard-reset the host.
    pub fn hard_reset(&mut self) -> Result<(), ClientError> {
        self.issue("hard_reset", &[]).map(|_| ())
    }

    // -- polling -----------------------------------------------------------

    /// Run `poll` every [`POLL_INTERVAL`] until it reports ready or the
    /// timeout expires. Expiry raises [`ClientError::Timeout`] carrying the
    /// last observed value.
    pub fn wait_until<F>(&mut self, timeout: Duration, mut poll: F) -> Result<Value, ClientError>
    where
        F: FnMut(&mut Self) -> Result<Poll, ClientError>,
    {
        let started = Instant::now();
        let mut last = None;

        loop {
            match poll(self)? {
                Poll::Ready(value) => return Ok(value),
                Poll::Pending(observed) => {
                    if observed.is_some() {
                        last = observed;
                    }
                }
            }

            if started.elapsed() >= timeout {
                return Err(ClientError::Timeout {
                    waited: started.elapsed(),
                    last,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait until an element exists.
    pub fn wait_for_element(&mut self, id: &str, timeout: Duration) -> Result<(), ClientError> {
        self.wait_until(timeout, |client| {
            if client.query(id)? {
                Ok(Poll::Ready(Value::Bool(true)))
            } else {
                Ok(Poll::Pending(Some(Value::Bool(false))))
            }
        })
        .map(|_| ())
    }

    /// Wait until an element property equals `expected`.
    pub fn wait_for_element_property(
        &mut self,
        id: &str,
        name: &str,
        expected: &Value,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.wait_until(timeout, |client| {
            let observed = client.property(id, name)?;
            if observed == *expected {
                Ok(Poll::Ready(observed))
            } else {
                Ok(Poll::Pending(Some(observed)))
            }
        })
        .map(|_| ())
    }
}

impl Transport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Transport::Process { writer, .. } => {
                writer.write_all(buf)?;
                writer.flush()
            }
            Transport::Tcp { writer, .. } => {
                writer.write_all(buf)?;
                writer.flush()
            }
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, ClientError> {
        let mut buffer = Vec::with_capacity(256);
        let bytes = match self {
            Transport::Process { reader, .. } => reader.read_until(b'\n', &mut buffer)?,
            Transport::Tcp { reader, .. } => reader.read_until(b'\n', &mut buffer)?,
        };

        if bytes == 0 {
            // EOF mid-request is fatal: the pending command can never
            // resolve.
            Err(ClientError::Protocol(
                "channel closed by host mid-request".to_string(),
            ))
        } else {
            Ok(buffer)
        }
    }
}

impl Drop for DriverClient {
    fn drop(&mut self) {
        if let Transport::Process { child, .. } = &mut self.transport {
            // Attempt a graceful shutdown; ignore errors because we're in Drop.
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
