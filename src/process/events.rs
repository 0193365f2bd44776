use crate::process::monitor::MemorySample;
use crate::process::ExitInfo;
use std::path::PathBuf;

/// Asynchronous notifications consumed by the supervisor event loop
#[derive(Debug)]
pub(crate) enum SupervisorEvent {
    /// An instance's process was reaped and its output fully flushed
    Exited {
        name: String,
        index: usize,
        generation: u64,
        exit: ExitInfo,
    },
    Memory(MemorySample),
    FileChanged { name: String, path: PathBuf },
}
