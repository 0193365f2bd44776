use overseer::config::{MemorySize, ProcessSpec};
use overseer::process::{MemorySampler, ProcessStatus, Supervisor, SupervisorSettings};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MB: u64 = 1024 * 1024;

/// Reports the same resident size for every pid
struct FakeSampler {
    bytes: Arc<AtomicU64>,
}

impl MemorySampler for FakeSampler {
    fn sample(&self, pids: &[u32]) -> HashMap<u32, u64> {
        let bytes = self.bytes.load(Ordering::SeqCst);
        pids.iter().map(|&pid| (pid, bytes)).collect()
    }
}

#[tokio::test]
async fn test_ceiling_forces_restart() {
    let dir = TempDir::new().unwrap();
    let bytes = Arc::new(AtomicU64::new(100 * MB));
    let supervisor = Supervisor::with_sampler(
        SupervisorSettings {
            log_dir: dir.path().join("logs"),
            memory_interval: Duration::from_millis(50),
            ..SupervisorSettings::default()
        },
        Arc::new(FakeSampler {
            bytes: bytes.clone(),
        }),
    );

    let mut spec = ProcessSpec::new("medusa-worker", "/bin/sleep", dir.path());
    spec.args = vec!["30".to_string()];
    spec.max_memory_restart = Some(MemorySize::from_bytes(512 * MB));
    let first = supervisor.start(spec).await.unwrap();

    // Below the ceiling nothing happens
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = supervisor.status(Some("medusa-worker")).await.unwrap().remove(0);
    assert_eq!(status.restarts, 0);
    assert_eq!(status.memory, Some(100 * MB));
    assert_eq!(status.memory_limit, Some(512 * MB));

    // Reaching the ceiling exactly counts as exceeding it
    bytes.store(512 * MB, Ordering::SeqCst);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = supervisor.status(Some("medusa-worker")).await.unwrap().remove(0);
        if status.restarts >= 1 {
            break;
        }
        assert!(Instant::now() < deadline, "no forced restart: {:?}", status);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    bytes.store(100 * MB, Ordering::SeqCst);

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        let status = supervisor.status(Some("medusa-worker")).await.unwrap().remove(0);
        if status.status == ProcessStatus::Running {
            break status;
        }
        assert!(Instant::now() < deadline, "never came back: {:?}", status);
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_ne!(status.pid, Some(first[0].pid));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_no_ceiling_never_restarts() {
    let dir = TempDir::new().unwrap();
    let bytes = Arc::new(AtomicU64::new(64 * 1024 * MB));
    let supervisor = Supervisor::with_sampler(
        SupervisorSettings {
            log_dir: dir.path().join("logs"),
            memory_interval: Duration::from_millis(50),
            ..SupervisorSettings::default()
        },
        Arc::new(FakeSampler { bytes }),
    );

    let mut spec = ProcessSpec::new("unbounded", "/bin/sleep", dir.path());
    spec.args = vec!["30".to_string()];
    let first = supervisor.start(spec).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let status = supervisor.status(Some("unbounded")).await.unwrap().remove(0);
    assert_eq!(status.restarts, 0);
    assert_eq!(status.pid, Some(first[0].pid));

    supervisor.shutdown().await;
}
