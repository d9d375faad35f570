//! The compiled set of denied host names.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// An immutable snapshot of denied hosts.
///
/// Built by [`combine`](BlockSet::combine); consumers must treat a snapshot
/// as read-only - the compiler publishes a new one instead of mutating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSet {
    hosts: HashSet<String>,
}

impl BlockSet {
    /// Deterministic set algebra: union of the deny hosts minus union of the
    /// allow hosts. Order-independent and idempotent - recomputing with the
    /// same inputs yields a set equal by value.
    pub fn combine<'a, D, A>(deny: D, allow: A) -> Self
    where
        D: IntoIterator<Item = &'a str>,
        A: IntoIterator<Item = &'a str>,
    {
        let mut hosts: HashSet<String> = deny.into_iter().map(str::to_owned).collect();
        for host in allow {
            hosts.remove(host);
        }
        Self { hosts }
    }

    /// Exact-host membership check.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }
}

/// Shared handle to the current block-set snapshot.
///
/// The compiler publishes through it, consumers pull cheap `Arc` clones of
/// whatever snapshot is current. There is no subscription machinery: the
/// packet path re-reads the handle per decision, which is a lock-free-enough
/// read for its rate.
#[derive(Debug, Default)]
pub struct BlockSetHandle {
    inner: RwLock<Arc<BlockSet>>,
}

impl BlockSetHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<BlockSet> {
        self.inner.read().expect("block-set lock poisoned").clone()
    }

    /// Replace the published snapshot.
    pub fn publish(&self, set: Arc<BlockSet>) {
        *self.inner.write().expect("block-set lock poisoned") = set;
    }
}
