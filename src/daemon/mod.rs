// Daemon module - Long-running supervisor process and its IPC front

pub mod manager;
pub mod pid;
mod service;

pub use manager::{DaemonManager, DaemonStatus};
pub use pid::{PidFile, DEFAULT_PID_FILE};
pub use service::{Daemon, ShutdownSignals};
