use crate::process::events::SupervisorEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Source of resident-memory readings
pub trait MemorySampler: Send + Sync {
    /// Resident memory in bytes of each pid together with its descendants.
    ///
    /// Pids that no longer exist are left out of the result.
    fn sample(&self, pids: &[u32]) -> HashMap<u32, u64>;
}

/// Samples memory from the OS process table
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&self, pids: &[u32]) -> HashMap<u32, u64> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);

        // Descendants count too: `npm run start` is a wrapper around the real server
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in system.processes() {
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        pids.iter()
            .filter_map(|&pid| {
                let root = Pid::from_u32(pid);
                system.process(root)?;

                let mut total = 0u64;
                let mut stack = vec![root];
                while let Some(current) = stack.pop() {
                    if let Some(process) = system.process(current) {
                        total = total.saturating_add(process.memory());
                    }
                    if let Some(kids) = children.get(&current) {
                        stack.extend(kids.iter().copied());
                    }
                }
                Some((pid, total))
            })
            .collect()
    }
}

/// One running instance to sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTarget {
    pub name: String,
    pub index: usize,
    pub generation: u64,
    pub pid: u32,
    pub ceiling: Option<u64>,
}

/// A memory reading for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySample {
    pub name: String,
    pub index: usize,
    pub generation: u64,
    pub bytes: u64,
    pub ceiling: Option<u64>,
}

impl MemorySample {
    pub fn exceeds_ceiling(&self) -> bool {
        self.ceiling.is_some_and(|ceiling| self.bytes >= ceiling)
    }
}

/// Periodically samples the memory of running instances
pub struct MemoryWatcher {
    interval: Duration,
    sampler: Arc<dyn MemorySampler>,
}

impl MemoryWatcher {
    pub fn new(interval: Duration, sampler: Arc<dyn MemorySampler>) -> Self {
        Self { interval, sampler }
    }

    pub fn sample(&self, targets: &[MemoryTarget]) -> Vec<MemorySample> {
        sample_targets(self.sampler.as_ref(), targets)
    }

    /// Run the sampling loop.
    ///
    /// `targets` is polled once per tick; the loop ends when it returns `None`
    /// or the event channel closes.
    pub(crate) fn spawn<F>(
        self,
        targets: F,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Option<Vec<MemoryTarget>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(targets) = targets() else {
                    break;
                };
                if targets.is_empty() {
                    continue;
                }

                let sampler = self.sampler.clone();
                let samples = match tokio::task::spawn_blocking(move || {
                    sample_targets(sampler.as_ref(), &targets)
                })
                .await
                {
                    Ok(samples) => samples,
                    Err(e) => {
                        warn!("Memory sampling task failed: {}", e);
                        continue;
                    }
                };

                debug!("Collected {} memory samples", samples.len());
                for sample in samples {
                    if events.send(SupervisorEvent::Memory(sample)).is_err() {
                        return;
                    }
                }
            }
        })
    }
}

fn sample_targets(sampler: &dyn MemorySampler, targets: &[MemoryTarget]) -> Vec<MemorySample> {
    let pids: Vec<u32> = targets.iter().map(|t| t.pid).collect();
    let readings = sampler.sample(&pids);

    targets
        .iter()
        .filter_map(|target| {
            readings.get(&target.pid).map(|&bytes| MemorySample {
                name: target.name.clone(),
                index: target.index,
                generation: target.generation,
                bytes,
                ceiling: target.ceiling,
            })
        })
        .collect()
}
