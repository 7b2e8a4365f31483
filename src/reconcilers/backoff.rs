//! Per-key exponential backoff for transient failures

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::store::ObjectKey;

/// Consecutive transient failures per key, turned into retry delays
///
/// The delay doubles with each failure, starting at `base` and capped at `max`.
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure of `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        delay_for(self.base, self.max, *count)
    }

    /// Forget the failures of `key`
    pub fn reset(&self, key: &ObjectKey) {
        self.lock().remove(key);
    }

    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }
}

fn delay_for(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}
