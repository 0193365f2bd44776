// IPC Protocol definitions for client-daemon communication

use crate::error::{ErrorKind, OverseerError};
use crate::process::{InstanceHandle, InstanceStatus, ReloadAction, StopOutcome};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Either every declared process or a single name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    All,
    Name(String),
}

impl Target {
    /// `all` selects everything; anything else is a process name
    pub fn parse(value: &str) -> Self {
        if value == "all" {
            Target::All
        } else {
            Target::Name(value.to_string())
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::All => write!(f, "all"),
            Target::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Which log stream to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Out,
    Err,
}

/// Options for viewing logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    pub name: String,
    pub lines: usize,
    /// Both streams when unset
    pub stream: Option<LogStream>,
}

/// All available commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Start { target: Target },
    Stop { target: Target },
    Restart { name: String },
    Status { name: Option<String> },
    /// Re-read the configuration file, or `config` when given
    Reload { config: Option<PathBuf> },
    Delete { name: String },
    Logs(LogRequest),
    Ping,
}

/// A failure as seen by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OverseerError> for ErrorReply {
    fn from(error: &OverseerError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<OverseerError> for ErrorReply {
    fn from(error: OverseerError) -> Self {
        Self::from(&error)
    }
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Result of a multi-name operation for one name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameOutcome<T> {
    pub name: String,
    pub result: Result<T, ErrorReply>,
}

impl<T> NameOutcome<T> {
    pub fn new(name: impl Into<String>, result: crate::error::Result<T>) -> Self {
        Self {
            name: name.into(),
            result: result.map_err(ErrorReply::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub name: String,
    pub action: ReloadAction,
    pub error: Option<ErrorReply>,
}

/// Tail of one log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSection {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseData {
    Started(Vec<NameOutcome<Vec<InstanceHandle>>>),
    Stopped(Vec<NameOutcome<StopOutcome>>),
    Restarted(Vec<InstanceHandle>),
    Status(Vec<InstanceStatus>),
    Reloaded(Vec<ReloadReport>),
    Deleted(StopOutcome),
    Logs(Vec<LogSection>),
    Pong {
        pid: u32,
        uptime: Duration,
        version: String,
    },
}

impl ResponseData {
    /// Most severe failure among per-name outcomes, if any
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        let kinds: Vec<ErrorKind> = match self {
            ResponseData::Started(outcomes) => error_kinds(outcomes),
            ResponseData::Stopped(outcomes) => error_kinds(outcomes),
            ResponseData::Reloaded(reports) => reports
                .iter()
                .filter_map(|r| r.error.as_ref().map(|e| e.kind))
                .collect(),
            _ => Vec::new(),
        };
        kinds.into_iter().max_by_key(|kind| kind.severity())
    }
}

fn error_kinds<T>(outcomes: &[NameOutcome<T>]) -> Vec<ErrorKind> {
    outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().err().map(|e| e.kind))
        .collect()
}

/// Request message from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, ErrorReply>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: ErrorReply) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }

    /// Process exit code for the CLI: 0, or the code of the most severe failure
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Ok(data) => data.failure_kind().map_or(0, ErrorKind::exit_code),
            Err(error) => error.kind.exit_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("all"), Target::All);
        assert_eq!(Target::parse("medusa-backend"), Target::Name("medusa-backend".to_string()));
        assert_eq!(Target::All.to_string(), "all");
    }

    #[test]
    fn test_request_wire_format() {
        let request = Request::new(
            7,
            Command::Start {
                target: Target::Name("api".to_string()),
            },
        );
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains('\n'));
        assert_eq!(
            json,
            r#"{"id":7,"command":{"start":{"target":{"name":"api"}}}}"#
        );

        let ping: Request = serde_json::from_str(r#"{"id":1,"command":"ping"}"#).unwrap();
        assert_eq!(ping.command, Command::Ping);
    }

    #[test]
    fn test_error_reply_carries_kind() {
        let reply = ErrorReply::from(OverseerError::ProcessNotFound("api".to_string()));
        assert_eq!(reply.kind, ErrorKind::NotFound);
        assert_eq!(reply.message, "Process not found: api");

        let response = Response::error(3, reply);
        assert_eq!(response.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_picks_most_severe_outcome() {
        let data = ResponseData::Stopped(vec![
            NameOutcome::new("a", Ok(StopOutcome::Graceful)),
            NameOutcome::new(
                "b",
                Err(OverseerError::Timeout("b".to_string(), "stuck".to_string())),
            ),
            NameOutcome::new("c", Err(OverseerError::ProcessNotFound("c".to_string()))),
        ]);
        assert_eq!(Response::success(1, data).exit_code(), 4);

        let data = ResponseData::Stopped(vec![NameOutcome::new("a", Ok(StopOutcome::Killed))]);
        assert_eq!(Response::success(1, data).exit_code(), 0);
    }

    #[test]
    fn test_response_roundtrip_keeps_error_kind() {
        let response = Response::success(
            9,
            ResponseData::Reloaded(vec![ReloadReport {
                name: "api".to_string(),
                action: ReloadAction::Started,
                error: Some(ErrorReply::from(OverseerError::Launch(
                    "api".to_string(),
                    "no such file".to_string(),
                ))),
            }]),
        );

        let json = serde_json::to_string(&response).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 9);
        assert_eq!(parsed.exit_code(), 5);
    }
}
