use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of a single operation: a per-peer logical counter plus the
/// originating peer.
///
/// Ids are totally ordered by counter first and peer second, so every replica
/// resolves concurrent operations the same way. Counters follow Lamport rules:
/// a replica always issues a counter greater than any counter it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub peer: u64,
}

impl OpId {
    pub fn new(counter: u64, peer: u64) -> Self {
        Self { counter, peer }
    }

    /// The id of the `n`-th element covered by a multi-element operation.
    pub fn offset(self, n: u64) -> Option<OpId> {
        self.counter.checked_add(n).map(|counter| OpId { counter, peer: self.peer })
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.peer.cmp(&other.peer))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.peer)
    }
}

/// Last-writer-wins register stamped with the id of the op that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lww<T> {
    value: T,
    stamp: OpId,
}

impl<T> Lww<T> {
    pub fn new(value: T, stamp: OpId) -> Self {
        Self { value, stamp }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> OpId {
        self.stamp
    }

    /// Overwrites the value when `stamp` is newer. Equal stamps are a no-op,
    /// which keeps re-delivery idempotent.
    pub fn set(&mut self, value: T, stamp: OpId) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }
}
