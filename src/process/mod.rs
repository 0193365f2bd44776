// Process module - Supervision of OS processes declared by ProcessSpecs

mod events;
pub mod monitor;
pub mod restart;
pub mod signal;
pub mod spawner;
mod supervisor;
mod types;
pub mod watch;

pub use monitor::{MemorySample, MemorySampler, MemoryWatcher, SysinfoSampler};
pub use restart::{ExitCause, RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{spawn_process, SpawnedProcess};
pub use supervisor::{ReloadAction, ReloadEntry, Supervisor, SupervisorSettings};
pub use types::{ExitInfo, InstanceHandle, InstanceStatus, ProcessStatus, StopOutcome};
