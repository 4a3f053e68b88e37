//! Deferred index work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A reduce task stops accepting merges once it holds this many keys.
pub const MAX_REDUCE_KEYS_PER_TASK: usize = 128;

/// The kind of a task, used to pick tasks for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// See [`Task::RemoveFromIndex`].
    RemoveFromIndex,
    /// See [`Task::Reduce`].
    Reduce,
}

/// A unit of deferred indexing work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Remove the entries of deleted documents from an index.
    RemoveFromIndex {
        /// Target index.
        index: String,
        /// Document keys to remove.
        keys: Vec<String>,
    },
    /// Recompute the reduced entries of some reduce keys.
    Reduce {
        /// Target index.
        index: String,
        /// Reduce keys to recompute.
        reduce_keys: Vec<String>,
    },
}

impl Task {
    /// Creates a removal task.
    pub fn remove_from_index(index: impl Into<String>, keys: Vec<String>) -> Self {
        Self::RemoveFromIndex {
            index: index.into(),
            keys,
        }
    }

    /// Creates a reduce task.
    pub fn reduce(index: impl Into<String>, reduce_keys: Vec<String>) -> Self {
        Self::Reduce {
            index: index.into(),
            reduce_keys,
        }
    }

    /// The index the task targets.
    #[must_use]
    pub fn index(&self) -> &str {
        match self {
            Self::RemoveFromIndex { index, .. } | Self::Reduce { index, .. } => index,
        }
    }

    /// The task kind.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::RemoveFromIndex { .. } => TaskKind::RemoveFromIndex,
            Self::Reduce { .. } => TaskKind::Reduce,
        }
    }

    /// The keys the task carries.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        match self {
            Self::RemoveFromIndex { keys, .. } => keys,
            Self::Reduce { reduce_keys, .. } => reduce_keys,
        }
    }

    /// Whether other tasks may still be merged into this one.
    #[must_use]
    pub fn supports_merging(&self) -> bool {
        match self {
            Self::RemoveFromIndex { .. } => true,
            Self::Reduce { reduce_keys, .. } => reduce_keys.len() < MAX_REDUCE_KEYS_PER_TASK,
        }
    }

    /// Merges `other` into `self` when both have the same kind and index
    /// and `self` still accepts merges. The keys become the distinct union,
    /// in first-seen order.
    ///
    /// Returns `false`, leaving `self` untouched, when the tasks cannot be
    /// merged.
    pub fn try_merge(&mut self, other: &Task) -> bool {
        if self.kind() != other.kind() || self.index() != other.index() || !self.supports_merging()
        {
            return false;
        }

        let keys = match self {
            Self::RemoveFromIndex { keys, .. } => keys,
            Self::Reduce { reduce_keys, .. } => reduce_keys,
        };
        let mut seen: BTreeSet<String> = keys.iter().cloned().collect();
        for key in other.keys() {
            if seen.insert(key.clone()) {
                keys.push(key.clone());
            }
        }
        true
    }
}

/// A task in the queue table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Queue position, assigned on commit.
    pub id: u64,
    /// When the task was first queued, ms since epoch.
    pub added_ms: u64,
    /// The work.
    pub task: Task,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn reduce_tasks_merge_into_union() {
        let mut a = Task::reduce("Totals", keys(&["x", "y"]));
        let b = Task::reduce("Totals", keys(&["y", "z"]));
        assert!(a.try_merge(&b));
        assert_eq!(a.keys(), keys(&["x", "y", "z"]).as_slice());
    }

    #[test]
    fn different_index_or_kind_does_not_merge() {
        let mut a = Task::reduce("Totals", keys(&["x"]));
        assert!(!a.try_merge(&Task::reduce("Other", keys(&["y"]))));
        assert!(!a.try_merge(&Task::remove_from_index("Totals", keys(&["y"]))));
        assert_eq!(a.keys(), keys(&["x"]).as_slice());
    }

    #[test]
    fn full_reduce_task_stops_merging() {
        let full: Vec<String> = (0..MAX_REDUCE_KEYS_PER_TASK).map(|i| i.to_string()).collect();
        let mut a = Task::reduce("Totals", full);
        assert!(!a.supports_merging());
        assert!(!a.try_merge(&Task::reduce("Totals", keys(&["extra"]))));

        let many: Vec<String> = (0..1000).map(|i| i.to_string()).collect();
        let mut removal = Task::remove_from_index("Totals", many);
        assert!(removal.supports_merging());
        assert!(removal.try_merge(&Task::remove_from_index("Totals", keys(&["k"]))));
    }

    proptest! {
        #[test]
        fn merge_never_drops_a_key(
            left in proptest::collection::vec("[a-e]{1,2}", 0..20),
            right in proptest::collection::vec("[a-e]{1,2}", 0..20),
        ) {
            let mut merged = Task::reduce("Idx", left.clone());
            prop_assert!(merged.try_merge(&Task::reduce("Idx", right.clone())));

            let got: BTreeSet<_> = merged.keys().iter().cloned().collect();
            let expected: BTreeSet<_> = left.into_iter().chain(right).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
