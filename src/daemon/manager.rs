// Daemon registration through the PID file

use super::pid::PidFile;
use crate::error::{OverseerError, Result};
use std::path::PathBuf;
use tracing::info;

/// Guards against two daemons running on the same PID file
pub struct DaemonManager {
    pid_file: PidFile,
}

impl DaemonManager {
    pub fn new() -> Self {
        Self::with_pid_file(PidFile::new())
    }

    pub fn with_pid_file(pid_file: PidFile) -> Self {
        Self { pid_file }
    }

    pub fn is_running(&self) -> bool {
        self.pid_file.running_pid().is_some()
    }

    /// Claim the PID file for this process.
    ///
    /// Fails with `DaemonAlreadyRunning` when the recorded PID is alive; a stale
    /// file is replaced.
    pub fn register_daemon(&self) -> Result<()> {
        if let Some(pid) = self.pid_file.running_pid() {
            if pid != std::process::id() {
                return Err(OverseerError::DaemonAlreadyRunning(pid));
            }
        }

        if self.pid_file.exists() {
            info!("Removing stale PID file {}", self.pid_file.path().display());
            self.pid_file.remove()?;
        }

        self.pid_file.write()
    }

    pub fn unregister_daemon(&self) -> Result<()> {
        self.pid_file.remove()
    }

    pub fn get_status(&self) -> DaemonStatus {
        let pid = self.pid_file.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.path().to_path_buf(),
        }
    }
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_unregister() {
        let dir = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(PidFile::with_path(dir.path().join("d.pid")));
        assert!(!manager.is_running());

        manager.register_daemon().unwrap();
        let status = manager.get_status();
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));

        manager.unregister_daemon().unwrap();
        assert!(!manager.get_status().running);
    }

    #[test]
    fn test_refuses_second_daemon() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d.pid");
        let mut other = Command::new("/bin/sleep").arg("5").spawn().unwrap();
        std::fs::write(&path, other.id().to_string()).unwrap();

        let manager = DaemonManager::with_pid_file(PidFile::with_path(&path));
        match manager.register_daemon() {
            Err(OverseerError::DaemonAlreadyRunning(pid)) => assert_eq!(pid, other.id()),
            other => panic!("Expected DaemonAlreadyRunning, got {:?}", other),
        }

        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[test]
    fn test_replaces_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d.pid");
        std::fs::write(&path, "999999999").unwrap();

        let manager = DaemonManager::with_pid_file(PidFile::with_path(&path));
        manager.register_daemon().unwrap();
        assert_eq!(manager.get_status().pid, Some(std::process::id()));
    }
}
