// Blocking side of the daemon socket, used by the CLI

use crate::error::{OverseerError, Result};
use crate::ipc::protocol::{Command, Request, Response};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Attempts per command, including the first one
const ATTEMPTS: u32 = 3;

/// Pause between attempts, doubled each time
const FIRST_BACKOFF: Duration = Duration::from_millis(100);

pub struct IpcClient {
    socket_path: PathBuf,
    next_id: AtomicU64,
}

impl IpcClient {
    pub fn with_socket_path(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Send one command and wait for the daemon's reply.
    ///
    /// Only transient failures are retried. A socket nobody listens on means
    /// the daemon is down and is reported without waiting.
    pub fn send_command(&self, command: Command) -> Result<Response> {
        let request = Request::new(self.next_id.fetch_add(1, Ordering::Relaxed), command);
        let line = serde_json::to_string(&request)
            .map_err(|e| OverseerError::SerializationError(e.to_string()))?;

        let mut backoff = FIRST_BACKOFF;
        let mut attempt = 1;
        loop {
            let outcome = self.connect().and_then(|stream| exchange(stream, &line));
            match outcome {
                Ok(response) if response.id == request.id => return Ok(response),
                Ok(response) => {
                    return Err(OverseerError::ProtocolError(format!(
                        "reply {} does not answer request {}",
                        response.id, request.id
                    )))
                }
                Err(e) if attempt < ATTEMPTS && is_transient(&e) => {
                    debug!("Request {} attempt {} failed: {}", request.id, attempt, e);
                    thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                OverseerError::DaemonNotRunning
            }
            _ => OverseerError::ConnectionError(format!("{}: {}", self.socket_path.display(), e)),
        })
    }
}

/// Write one request line and read one reply line
fn exchange<S: Read + Write>(mut stream: S, line: &str) -> Result<Response> {
    let io_error = |e: io::Error| OverseerError::IpcError(e.to_string());

    stream.write_all(line.as_bytes()).map_err(io_error)?;
    stream.write_all(b"\n").map_err(io_error)?;
    stream.flush().map_err(io_error)?;

    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply).map_err(io_error)?;
    if reply.trim().is_empty() {
        return Err(OverseerError::ProtocolError(
            "daemon closed the connection without replying".to_string(),
        ));
    }
    serde_json::from_str(&reply).map_err(|e| OverseerError::ProtocolError(e.to_string()))
}

fn is_transient(error: &OverseerError) -> bool {
    matches!(
        error,
        OverseerError::IpcError(_) | OverseerError::ConnectionError(_)
    )
}
