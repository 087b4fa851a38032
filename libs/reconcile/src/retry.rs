//! Allocation retry tracking across attempts.

use std::collections::BTreeSet;

use tesbatch_model::AttemptLog;

/// Default number of allocation retries per task (so four attempts in total).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// VM sizes a task must not be scheduled on again. Case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet(BTreeSet<String>);

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vm_size: &str) {
        self.0.insert(vm_size.to_ascii_lowercase());
    }

    pub fn contains(&self, vm_size: &str) -> bool {
        self.0.contains(&vm_size.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercased names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for name in iter {
            set.insert(name.as_ref());
        }
        set
    }
}

/// Retry tracker for node allocation failures.
///
/// The counter only grows during a task's lifetime. Every failed attempt
/// also excludes the VM size it used.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per task.
    max_retries: u32,

    allocation_failures: u32,

    excluded: ExclusionSet,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            allocation_failures: 0,
            excluded: ExclusionSet::new(),
        }
    }

    /// Rebuilds the tracker from a task's attempt logs.
    pub fn from_attempts(logs: &[AttemptLog], max_retries: u32) -> Self {
        let mut tracker = Self::new(max_retries);
        for log in logs.iter().filter(|log| log.allocation_failed) {
            tracker.record_allocation_failure(log.vm.as_ref().map(|vm| vm.vm_size.as_str()));
        }
        tracker
    }

    /// Record an allocation failure on the given VM size.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_allocation_failure(&mut self, vm_size: Option<&str>) -> bool {
        if let Some(vm_size) = vm_size {
            self.excluded.insert(vm_size);
        }
        self.allocation_failures += 1;
        self.is_exhausted()
    }

    /// Check if retries are exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.allocation_failures > self.max_retries
    }

    pub fn allocation_failures(&self) -> u32 {
        self.allocation_failures
    }

    pub fn excluded(&self) -> &ExclusionSet {
        &self.excluded
    }
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}
