//! The concurrent tree cache.
//!
//! The cache memoizes parsed trees by `(path, context)` and coordinates
//! concurrent parses of overlapping template graphs: the first worker to
//! ask for a missing key reserves it and parses; any other worker asking
//! for the same key blocks until the first releases the reservation with
//! [`done`](TreeCache::done), with or without a preceding
//! [`add`](TreeCache::add). This guarantees the reader is invoked at most
//! once per distinct key however many workers race on it.
//!
//! Trees stored here are shared between workers and must be treated as
//! immutable.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::trace;
use vela_core::Context;

use crate::ast::Tree;

#[derive(Debug)]
enum Entry {
    /// A worker holds the reservation and is parsing.
    InProgress,
    /// The parse completed with this tree.
    Parsed(Arc<Tree>),
}

/// A thread-safe cache of parsed trees keyed by `(path, context)`.
#[derive(Debug, Default)]
pub struct TreeCache {
    entries: Mutex<FxHashMap<(String, Context), Entry>>,
    cond: Condvar,
}

impl TreeCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the tree for `(path, ctx)`.
    ///
    /// Returns `Some(tree)` on a hit. On a miss the reservation is taken
    /// on behalf of the caller, who must parse and then call
    /// [`done`](Self::done) on every exit path; `add` publishes the result
    /// first on success. If another worker holds the reservation, the call
    /// blocks until that worker calls `done`, then either returns the tree
    /// it published or takes over the reservation.
    #[must_use]
    pub fn get(&self, path: &str, ctx: Context) -> Option<Arc<Tree>> {
        let mut entries = self.entries.lock();
        loop {
            match entries.get(&(path.to_string(), ctx)) {
                Some(Entry::Parsed(tree)) => {
                    trace!(path, "tree cache hit");
                    return Some(Arc::clone(tree));
                }
                Some(Entry::InProgress) => {
                    trace!(path, "tree cache wait");
                    self.cond.wait(&mut entries);
                }
                None => {
                    entries.insert((path.to_string(), ctx), Entry::InProgress);
                    trace!(path, "tree cache reserved");
                    return None;
                }
            }
        }
    }

    /// Publish the parsed tree for `(path, ctx)` and wake blocked workers.
    pub fn add(&self, path: &str, ctx: Context, tree: Arc<Tree>) {
        let mut entries = self.entries.lock();
        entries.insert((path.to_string(), ctx), Entry::Parsed(tree));
        trace!(path, "tree cache add");
        self.cond.notify_all();
    }

    /// Release the reservation taken by [`get`](Self::get). If no tree was
    /// published with [`add`](Self::add), the slot is cleared so a future
    /// caller can retry the parse. Must be called on every path exiting a
    /// parse attempt, successful or not.
    pub fn done(&self, path: &str, ctx: Context) {
        let mut entries = self.entries.lock();
        if let Some(Entry::InProgress) = entries.get(&(path.to_string(), ctx)) {
            entries.remove(&(path.to_string(), ctx));
        }
        trace!(path, "tree cache done");
        self.cond.notify_all();
    }
}
