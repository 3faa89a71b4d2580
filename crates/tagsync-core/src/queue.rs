//! Per-record mutation batching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::LabelSet;

/// Pending additions and removals over one attribute. A value is never in
/// both sets: queueing the opposite operation cancels the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSet {
    to_add: LabelSet,
    to_remove: LabelSet,
}

impl PendingSet {
    pub fn add<I: IntoIterator<Item = String>>(&mut self, values: I) {
        for value in values {
            self.to_remove.remove(&value);
            self.to_add.insert(value);
        }
    }

    pub fn remove<I: IntoIterator<Item = String>>(&mut self, values: I) {
        for value in values {
            self.to_add.remove(&value);
            self.to_remove.insert(value);
        }
    }

    pub fn is_queued_for_addition(&self, value: &str) -> bool {
        self.to_add.contains(value)
    }

    pub fn is_queued_for_removal(&self, value: &str) -> bool {
        self.to_remove.contains(value)
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// `(current ∪ to_add) \ to_remove`
    pub fn effective(&self, current: &LabelSet) -> LabelSet {
        current
            .union(&self.to_add)
            .filter(|v| !self.to_remove.contains(*v))
            .cloned()
            .collect()
    }

    /// Minimal `(add, remove)` that moves `current` to the effective set.
    pub fn diff(&self, current: &LabelSet) -> (LabelSet, LabelSet) {
        let add = self.to_add.difference(current).cloned().collect();
        let remove = self.to_remove.intersection(current).cloned().collect();
        (add, remove)
    }

    pub fn clear(&mut self) {
        self.to_add.clear();
        self.to_remove.clear();
    }
}

/// Store calls needed to commit a queue; empty sets are skipped by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPlan {
    pub add_labels: LabelSet,
    pub remove_labels: LabelSet,
    pub add_annotations: LabelSet,
    pub remove_annotations: LabelSet,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.add_labels.is_empty()
            && self.remove_labels.is_empty()
            && self.add_annotations.is_empty()
            && self.remove_annotations.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MutationQueue {
    batching: Arc<AtomicBool>,
    pub labels: PendingSet,
    pub annotations: PendingSet,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_batching(&self) -> bool {
        self.batching.load(Ordering::SeqCst)
    }

    /// Enable batching until the returned scope is dropped, at which point the
    /// mode in force before this call comes back.
    #[must_use = "batching ends when the scope is dropped"]
    pub fn begin_batch(&self) -> BatchScope {
        let previous = self.batching.swap(true, Ordering::SeqCst);
        BatchScope {
            flag: Arc::clone(&self.batching),
            previous,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }

    /// Diff the queue against the store's current state and clear it.
    pub fn take_plan(&mut self, labels: &LabelSet, annotations: &LabelSet) -> CommitPlan {
        let (add_labels, remove_labels) = self.labels.diff(labels);
        let (add_annotations, remove_annotations) = self.annotations.diff(annotations);
        self.labels.clear();
        self.annotations.clear();
        CommitPlan {
            add_labels,
            remove_labels,
            add_annotations,
            remove_annotations,
        }
    }
}

#[derive(Debug)]
pub struct BatchScope {
    flag: Arc<AtomicBool>,
    previous: bool,
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}
