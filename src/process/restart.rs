use crate::config::ProcessSpec;
use crate::process::ExitInfo;
use std::time::{Duration, Instant};

/// Why an instance stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The process exited on its own
    Exited(ExitInfo),
    /// Killed for exceeding its memory ceiling
    MemoryCeiling,
    /// Killed because a watched file changed
    FileChange,
}

/// What the supervisor should do after an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Leave the instance stopped
    Stop,
    /// Relaunch after `delay`
    Restart { delay: Duration },
    /// Crash loop: too many restarts within the window
    GiveUp,
}

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Maximum number of restarts within the time window
    pub max_restarts: usize,
    /// Time window for counting restarts
    pub time_window: Duration,
    /// Delay before the first restart
    pub initial_delay: Duration,
    /// Ceiling for the doubling backoff
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn from_spec(spec: &ProcessSpec) -> Self {
        Self {
            enabled: spec.autorestart,
            max_restarts: spec.max_restarts,
            time_window: Duration::from_secs(spec.restart_window_secs),
            initial_delay: Duration::from_millis(spec.restart_delay_ms),
            max_delay: Duration::from_millis(spec.max_restart_delay_ms),
        }
    }

    /// Decide what follows an exit.
    ///
    /// Forced restarts (memory ceiling, file change) only obey `enabled`: they
    /// skip both the backoff and the crash-loop guard.
    pub fn evaluate(&self, cause: &ExitCause, tracker: &RestartTracker) -> RestartDecision {
        match cause {
            _ if !self.enabled => RestartDecision::Stop,
            ExitCause::MemoryCeiling | ExitCause::FileChange => RestartDecision::Restart {
                delay: Duration::ZERO,
            },
            ExitCause::Exited(_) => {
                if self.should_restart(tracker) {
                    RestartDecision::Restart {
                        delay: self.calculate_delay(tracker),
                    }
                } else {
                    RestartDecision::GiveUp
                }
            }
        }
    }

    /// Check if restart should be attempted based on restart history
    pub fn should_restart(&self, tracker: &RestartTracker) -> bool {
        if !self.enabled {
            return false;
        }

        tracker.count_recent_restarts(self.time_window) < self.max_restarts
    }

    /// Delay before the next restart attempt.
    ///
    /// Only restarts inside the window count, so a process that stayed up for a
    /// while starts again from the initial delay.
    pub fn calculate_delay(&self, tracker: &RestartTracker) -> Duration {
        let recent = tracker.count_recent_restarts(self.time_window);
        self.backoff(recent)
    }

    /// initial * 2^n, capped at `max_delay`
    fn backoff(&self, restarts: usize) -> Duration {
        let factor = 2_u32.saturating_pow(restarts.min(31) as u32);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Tracks restart history for one instance
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    restart_times: Vec<Instant>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_restart(&mut self) {
        self.restart_times.push(Instant::now());
    }

    pub fn count_recent_restarts(&self, window: Duration) -> usize {
        self.restart_times
            .iter()
            .filter(|time| time.elapsed() < window)
            .count()
    }

    /// Remove restart records older than the window
    pub fn prune_old_restarts(&mut self, window: Duration) {
        self.restart_times.retain(|time| time.elapsed() < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn policy(enabled: bool, max_restarts: usize) -> RestartPolicy {
        RestartPolicy {
            enabled,
            max_restarts,
            time_window: Duration::from_secs(60),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(15),
        }
    }

    #[test]
    fn test_restart_policy_from_spec() {
        let mut spec = ProcessSpec::new("api", "/bin/true", "/tmp");
        spec.max_restarts = 5;
        spec.restart_delay_ms = 250;
        spec.max_restart_delay_ms = 4000;
        spec.restart_window_secs = 30;

        let policy = RestartPolicy::from_spec(&spec);
        assert!(policy.enabled);
        assert_eq!(policy.max_restarts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.time_window, Duration::from_secs(30));
        assert_eq!(policy.max_delay, Duration::from_secs(4));
    }

    #[test]
    fn test_restart_policy_should_restart() {
        let policy = policy(true, 3);
        let mut tracker = RestartTracker::new();

        assert!(policy.should_restart(&tracker));
        tracker.record_restart();
        tracker.record_restart();
        assert!(policy.should_restart(&tracker));

        tracker.record_restart();
        assert!(!policy.should_restart(&tracker));
    }

    #[test]
    fn test_evaluate_crash_exit() {
        let policy = policy(true, 2);
        let mut tracker = RestartTracker::new();
        let crash = ExitCause::Exited(ExitInfo::code(1));

        assert_eq!(
            policy.evaluate(&crash, &tracker),
            RestartDecision::Restart {
                delay: Duration::from_millis(100)
            }
        );

        tracker.record_restart();
        assert_eq!(
            policy.evaluate(&crash, &tracker),
            RestartDecision::Restart {
                delay: Duration::from_millis(200)
            }
        );

        tracker.record_restart();
        assert_eq!(policy.evaluate(&crash, &tracker), RestartDecision::GiveUp);
    }

    #[test]
    fn test_evaluate_clean_exit_still_restarts() {
        let policy = policy(true, 16);
        let tracker = RestartTracker::new();
        assert!(matches!(
            policy.evaluate(&ExitCause::Exited(ExitInfo::code(0)), &tracker),
            RestartDecision::Restart { .. }
        ));
    }

    #[test]
    fn test_evaluate_disabled() {
        let policy = policy(false, 16);
        let tracker = RestartTracker::new();

        assert_eq!(
            policy.evaluate(&ExitCause::Exited(ExitInfo::code(1)), &tracker),
            RestartDecision::Stop
        );
        assert_eq!(
            policy.evaluate(&ExitCause::MemoryCeiling, &tracker),
            RestartDecision::Stop
        );
    }

    #[test]
    fn test_forced_restart_bypasses_crash_loop_guard() {
        let policy = policy(true, 1);
        let mut tracker = RestartTracker::new();
        tracker.record_restart();
        tracker.record_restart();

        assert_eq!(
            policy.evaluate(&ExitCause::MemoryCeiling, &tracker),
            RestartDecision::Restart {
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            policy.evaluate(&ExitCause::FileChange, &tracker),
            RestartDecision::Restart {
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_backoff_exponential() {
        let policy = policy(true, 16);

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        // 100ms * 2^8 = 25.6s, capped
        assert_eq!(policy.backoff(8), Duration::from_secs(15));
        assert_eq!(policy.backoff(1000), Duration::from_secs(15));
    }

    #[test]
    fn test_restart_tracker_window() {
        let mut tracker = RestartTracker::new();
        tracker.record_restart();
        thread::sleep(Duration::from_millis(60));
        tracker.record_restart();

        assert_eq!(tracker.count_recent_restarts(Duration::from_secs(60)), 2);
        assert_eq!(tracker.count_recent_restarts(Duration::from_millis(30)), 1);

        tracker.prune_old_restarts(Duration::from_millis(30));
        assert_eq!(tracker.count_recent_restarts(Duration::from_secs(60)), 1);
    }
}
