use crate::config::ExecMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, SystemTime};

/// Lifecycle status of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    ExitedClean,
    ExitedError,
    Killed,
    RestartPending,
    Stopped,
    /// Gave up after too many restarts in the restart window
    Errored,
}

impl ProcessStatus {
    /// An OS process exists (or is being torn down) for this instance
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping
        )
    }

    /// The instance counts as started for the purpose of `start` idempotence
    pub fn is_active(&self) -> bool {
        self.is_live() || *self == ProcessStatus::RestartPending
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::ExitedClean => "exited-clean",
            ProcessStatus::ExitedError => "exited-error",
            ProcessStatus::Killed => "killed",
            ProcessStatus::RestartPending => "restart-pending",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Errored => "errored",
        };
        write!(f, "{}", text)
    }
}

/// How a process ended: exit code or terminating signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Status an instance takes right after this exit
    pub fn status(&self) -> ProcessStatus {
        if self.is_success() {
            ProcessStatus::ExitedClean
        } else if self.signal.is_some() {
            ProcessStatus::Killed
        } else {
            ProcessStatus::ExitedError
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown"),
        }
    }
}

/// Returned by `start` for each launched (or already running) instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub name: String,
    pub index: usize,
    pub pid: u32,
}

/// How a stop request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Every instance exited within the grace period
    Graceful,
    /// At least one instance had to be killed after the grace period
    Killed,
    /// Nothing was running
    AlreadyStopped,
}

/// Point-in-time view of one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub name: String,
    pub index: usize,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub uptime: Duration,
    pub restarts: usize,
    /// Last resident memory sample, in bytes
    pub memory: Option<u64>,
    pub memory_limit: Option<u64>,
    pub last_exit: Option<ExitInfo>,
    pub cwd: PathBuf,
    pub profile: Option<String>,
    pub exec_mode: ExecMode,
    pub log_warnings: usize,
}
