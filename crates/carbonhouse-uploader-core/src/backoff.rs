use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Exponential delay applied to a path after each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Failed files become eligible again on the very next scan.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        !self.initial.is_zero()
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        if !self.is_enabled() || attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryEntry {
    attempts: u32,
    not_before: Instant,
}

/// Per-path failure history, consulted by the watcher.
#[derive(Debug)]
pub(crate) struct RetryTracker {
    policy: BackoffPolicy,
    entries: Mutex<HashMap<PathBuf, RetryEntry>>,
}

impl RetryTracker {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn is_ready(&self, path: &Path, now: Instant) -> bool {
        if !self.policy.is_enabled() {
            return true;
        }
        let entries = self.entries.lock().expect("retry mutex poisoned");
        entries
            .get(path)
            .map(|entry| now >= entry.not_before)
            .unwrap_or(true)
    }

    /// Returns the delay until the path is eligible again.
    pub(crate) fn record_failure(&self, path: &Path, now: Instant) -> Duration {
        if !self.policy.is_enabled() {
            return Duration::ZERO;
        }
        let mut entries = self.entries.lock().expect("retry mutex poisoned");
        let entry = entries.entry(path.to_path_buf()).or_insert(RetryEntry {
            attempts: 0,
            not_before: now,
        });
        entry.attempts = entry.attempts.saturating_add(1);
        let delay = self.policy.delay(entry.attempts);
        entry.not_before = now + delay;
        delay
    }

    /// Forgets paths that are no longer in the source directory. `listed`
    /// must be sorted.
    pub(crate) fn retain_listed(&self, listed: &[PathBuf]) {
        if !self.policy.is_enabled() {
            return;
        }
        self.entries
            .lock()
            .expect("retry mutex poisoned")
            .retain(|path, _| listed.binary_search(path).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("retry mutex poisoned").len()
    }

    pub(crate) fn record_success(&self, path: &Path) {
        if !self.policy.is_enabled() {
            return;
        }
        self.entries
            .lock()
            .expect("retry mutex poisoned")
            .remove(path);
    }
}
