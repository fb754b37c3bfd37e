//! Connection registry — the single synchronization point between the
//! event-loop thread and the control path.
//!
//! Backed by a `DashMap`: lookups take a shared section on one shard,
//! insert/mutate/remove take the exclusive section for that entry. Guards are
//! scoped, so every acquisition is released exactly once on every exit path.

use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tether_core::{ConnectionRecord, ConnectionSnapshot, SessionError};

/// Anything usable as a connection id.
pub trait ConnectionKey: Clone + Eq + Hash + Display + Send + Sync + 'static {}

impl<K> ConnectionKey for K where K: Clone + Eq + Hash + Display + Send + Sync + 'static {}

/// Shared id → record table. Cloning yields another handle to the same table.
pub struct ConnectionRegistry<K: ConnectionKey> {
    entries: Arc<DashMap<K, ConnectionRecord<K>>>,
}

impl<K: ConnectionKey> Default for ConnectionRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ConnectionKey> Clone for ConnectionRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<K: ConnectionKey> ConnectionRegistry<K> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Insert a new record. A second insert for a live id is a conflict.
    pub fn insert(&self, record: ConnectionRecord<K>) -> Result<(), SessionError> {
        match self.entries.entry(record.id().clone()) {
            Entry::Occupied(occupied) => Err(SessionError::StateConflict {
                id: occupied.key().to_string(),
                reason: "id already registered".to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &K) -> Option<ConnectionSnapshot> {
        self.entries.get(id).map(|r| r.value().snapshot())
    }

    pub fn contains(&self, id: &K) -> bool {
        self.entries.contains_key(id)
    }

    /// Run `f` inside the exclusive section for `id`. `None` if absent.
    ///
    /// `f` must not touch the registry again; it may call transport
    /// primitives, which only submit work.
    pub fn with_entry<R>(&self, id: &K, f: impl FnOnce(&mut ConnectionRecord<K>) -> R) -> Option<R> {
        self.entries.get_mut(id).map(|mut r| f(r.value_mut()))
    }

    /// Like `with_entry`, but an absent id is a `StateConflict`.
    pub fn mutate<R>(
        &self,
        id: &K,
        f: impl FnOnce(&mut ConnectionRecord<K>) -> R,
    ) -> Result<R, SessionError> {
        self.with_entry(id, f).ok_or_else(|| SessionError::StateConflict {
            id: id.to_string(),
            reason: "no such record".to_string(),
        })
    }

    pub fn remove(&self, id: &K) -> Option<ConnectionRecord<K>> {
        self.entries.remove(id).map(|(_, r)| r)
    }

    /// Remove only if `pred` holds, checked under the same exclusive section.
    pub fn remove_if(
        &self,
        id: &K,
        pred: impl FnOnce(&ConnectionRecord<K>) -> bool,
    ) -> Option<ConnectionRecord<K>> {
        self.entries.remove_if(id, |_, r| pred(r)).map(|(_, r)| r)
    }

    /// Visit a snapshot of every record. The snapshot is taken first, so `f`
    /// runs with no registry lock held and may call back into the registry.
    pub fn for_each(&self, mut f: impl FnMut(&K, &ConnectionSnapshot)) {
        let snapshot: Vec<(K, ConnectionSnapshot)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        for (id, snap) in &snapshot {
            f(id, snap);
        }
    }

    pub fn ids(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
