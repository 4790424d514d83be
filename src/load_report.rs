//! A sink for load statistics, populated by the balancer and drained by a
//! reporting pipeline elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters describing what the balancer observed: assignments received
/// from the control plane, stream failures, and calls dropped by category.
#[derive(Debug, Default)]
pub struct LoadStore {
    assignments_received: AtomicU64,
    stream_failures: AtomicU64,
    drops: Mutex<HashMap<String, u64>>,
}

impl LoadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_assignment(&self) {
        self.assignments_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_failure(&self) {
        self.stream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, category: &str) {
        *self
            .drops
            .lock()
            .unwrap()
            .entry(category.to_string())
            .or_insert(0) += 1;
    }

    /// A point-in-time copy of all counters.
    pub fn snapshot(&self) -> LoadReport {
        LoadReport {
            assignments_received: self.assignments_received.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            drops: self.drops.lock().unwrap().clone(),
        }
    }
}

/// The values read out of a [`LoadStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub assignments_received: u64,
    pub stream_failures: u64,
    pub drops: HashMap<String, u64>,
}
