use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::model::RestartPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart the task locally after the given delay.
    Restart { after: Duration },
    /// Attempts used up inside the interval; report the allocation failed.
    Exhausted,
}

/// Node-local failure counter for one allocation.
///
/// Failures older than `interval` fall out of the window. The failure that
/// brings the count inside the window to `attempts` exhausts the policy.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    failures: VecDeque<Instant>,
    restarts: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            failures: VecDeque::new(),
            restarts: 0,
        }
    }

    /// Local restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn on_failure(&mut self, now: Instant) -> RestartDecision {
        while let Some(first) = self.failures.front() {
            if now.saturating_duration_since(*first) >= self.policy.interval {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);

        if self.failures.len() as u32 >= self.policy.attempts {
            RestartDecision::Exhausted
        } else {
            self.restarts += 1;
            RestartDecision::Restart {
                after: self.policy.delay,
            }
        }
    }
}
