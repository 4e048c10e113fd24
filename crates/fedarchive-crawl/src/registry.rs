//! Session registry.
//!
//! Tracks which `(server url, timeline)` pairs already have a live archiver or
//! explorer, plus the set of server URLs the manager has ever processed.
//!
//! # Concurrency
//!
//! One [`parking_lot::RwLock`] guards both session maps and the known-server
//! set. Reads take the shared lock; every mutation takes the exclusive lock
//! and never awaits or touches the network while holding it.
//!
//! Registration is insert-if-absent: the existence check and the insert happen
//! in the same critical section, so two concurrent spawns for the same key
//! cannot both succeed. A second registration for a live key is ignored and
//! reported to the caller.

use std::collections::{HashMap, HashSet};

use fedarchive_core::{Server, Target, TargetKey, Timeline};
use fedarchive_core::metrics::set_gauge;
use parking_lot::RwLock;

use crate::session::SessionHandle;

/// Registry of live sessions and known servers.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    archivers: HashMap<TargetKey, SessionHandle>,
    explorers: HashMap<TargetKey, SessionHandle>,
    known_servers: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an archiver. Returns `false` if one already exists for the key.
    pub fn register_archiver(&self, handle: SessionHandle) -> bool {
        let key = handle.target().key();
        let mut inner = self.inner.write();
        if inner.archivers.contains_key(&key) {
            tracing::debug!("Archiver for {} ({}) already registered", key.url, key.timeline);
            return false;
        }
        inner.archivers.insert(key, handle);
        set_gauge("crawl_archivers_registered", inner.archivers.len() as f64);
        true
    }

    /// Register an explorer. Returns `false` if one already exists for the key.
    pub fn register_explorer(&self, handle: SessionHandle) -> bool {
        let key = handle.target().key();
        let mut inner = self.inner.write();
        if inner.explorers.contains_key(&key) {
            tracing::debug!("Explorer for {} ({}) already registered", key.url, key.timeline);
            return false;
        }
        inner.explorers.insert(key, handle);
        set_gauge("crawl_explorers_registered", inner.explorers.len() as f64);
        true
    }

    pub fn archiver_exists(&self, target: &Target) -> bool {
        self.inner.read().archivers.contains_key(&target.key())
    }

    pub fn explorer_exists(&self, target: &Target) -> bool {
        self.inner.read().explorers.contains_key(&target.key())
    }

    /// Handle of the archiver for `target`, if any.
    pub fn archiver(&self, target: &Target) -> Option<SessionHandle> {
        self.inner.read().archivers.get(&target.key()).cloned()
    }

    /// Handle of the explorer for `target`, if any.
    pub fn explorer(&self, target: &Target) -> Option<SessionHandle> {
        self.inner.read().explorers.get(&target.key()).cloned()
    }

    /// True if an archiver exists for the server on any of `timelines`, or an
    /// explorer exists on its global timeline.
    pub fn is_observed_server(&self, server: &Server, timelines: &[Timeline]) -> bool {
        let inner = self.inner.read();
        let archived = timelines.iter().any(|tl| {
            inner.archivers.contains_key(&TargetKey {
                url: server.url.clone(),
                timeline: *tl,
            })
        });
        archived
            || inner.explorers.contains_key(&TargetKey {
                url: server.url.clone(),
                timeline: Timeline::Global,
            })
    }

    pub fn is_known_server(&self, server: &Server) -> bool {
        self.inner.read().known_servers.contains(&server.url)
    }

    /// Mark a server URL as known. Returns `false` if it already was.
    pub fn add_known_server(&self, server: &Server) -> bool {
        let mut inner = self.inner.write();
        let added = inner.known_servers.insert(server.url.clone());
        if added {
            set_gauge("crawl_known_servers", inner.known_servers.len() as f64);
        }
        added
    }

    pub fn archiver_count(&self) -> usize {
        self.inner.read().archivers.len()
    }

    pub fn explorer_count(&self) -> usize {
        self.inner.read().explorers.len()
    }

    pub fn known_server_count(&self) -> usize {
        self.inner.read().known_servers.len()
    }

    /// Snapshot of every registered session handle, archivers first.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        let inner = self.inner.read();
        inner
            .archivers
            .values()
            .chain(inner.explorers.values())
            .cloned()
            .collect()
    }
}
