use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounds how often a failing service is respawned.
///
/// At most `max_restarts` respawns are allowed within any `window`; once the
/// budget is spent the service stays failed until older restarts age out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: usize,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window: Duration::from_secs(10),
        }
    }
}

impl RestartPolicy {
    /// A policy that never respawns
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            window: Duration::ZERO,
        }
    }
}

/// Sliding window of restart timestamps for one service
#[derive(Debug, Default, Clone)]
pub struct RestartTracker {
    history: VecDeque<Instant>,
    total: usize,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a restart at `now` if the policy allows one
    pub fn try_acquire(&mut self, policy: &RestartPolicy, now: Instant) -> bool {
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) >= policy.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() >= policy.max_restarts {
            return false;
        }

        self.history.push_back(now);
        self.total += 1;
        true
    }

    /// Restarts inside the current window
    pub fn recent(&self) -> usize {
        self.history.len()
    }

    /// Restarts over the supervisor's lifetime
    pub fn total(&self) -> usize {
        self.total
    }
}
