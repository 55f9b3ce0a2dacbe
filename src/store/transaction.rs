use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::connection::Connection;
use super::gate::WritePermit;
use super::snapshot::{Collection, Entries, Keys, Snapshot, SortedEntries};
use super::wal::entry::Mutation;
use crate::error::{Result, StoreError};
use crate::record::Record;

/// When a commit becomes durable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// The log is synced before `commit` returns.
    #[default]
    Immediate,
    /// The log is written but not synced. The commit becomes durable with the
    /// next immediate commit, checkpoint, or close; a crash before then may
    /// lose it, but never partially.
    Deferred,
}

/// Read access shared by both transaction kinds.
///
/// Every method reads from one fixed snapshot. For a [`WriteTransaction`]
/// that snapshot includes the transaction's own uncommitted changes.
pub trait ReadableStore {
    fn snapshot(&self) -> &Snapshot;

    /// Commit sequence the transaction reads at.
    fn sequence(&self) -> u64 {
        self.snapshot().sequence()
    }

    fn collection(&self, name: &str) -> Option<&Collection> {
        self.snapshot().collection(name)
    }

    fn get(&self, collection: &str, key: &str) -> Option<&Record> {
        self.collection(collection)?.get(key)
    }

    fn contains(&self, collection: &str, key: &str) -> bool {
        self.collection(collection)
            .is_some_and(|c| c.contains_key(key))
    }

    /// `(key, record)` pairs in insertion order. Empty for an unknown collection.
    fn enumerate(&self, collection: &str) -> Entries<'_> {
        self.collection(collection)
            .unwrap_or_else(Collection::empty)
            .iter()
    }

    /// `(key, record)` pairs in key order.
    fn enumerate_sorted(&self, collection: &str) -> SortedEntries<'_> {
        self.collection(collection)
            .unwrap_or_else(Collection::empty)
            .iter_sorted()
    }

    fn keys(&self, collection: &str) -> Keys<'_> {
        self.collection(collection)
            .unwrap_or_else(Collection::empty)
            .keys()
    }

    fn count(&self, collection: &str) -> usize {
        self.collection(collection).map_or(0, Collection::len)
    }

    /// Names of all non-empty collections, sorted.
    fn collections(&self) -> Vec<&str> {
        self.snapshot().collection_names().collect()
    }
}

/// A consistent, read-only view of the store.
///
/// Holding a read transaction never blocks writers or checkpoints; it keeps
/// the snapshot it started with alive until dropped.
#[derive(Debug, Clone)]
pub struct ReadTransaction {
    snapshot: Arc<Snapshot>,
}

impl ReadTransaction {
    pub(crate) fn new(snapshot: Arc<Snapshot>) -> Self {
        Self { snapshot }
    }
}

impl ReadableStore for ReadTransaction {
    fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

/// The single active read-write transaction.
///
/// Changes are staged on a private copy of the snapshot and become visible to
/// other transactions only when [`commit`](Self::commit) returns. Dropping the
/// transaction without committing rolls it back.
#[derive(Debug)]
pub struct WriteTransaction {
    connection: Connection,
    permit: Option<WritePermit>,
    working: Snapshot,
    mutations: Vec<Mutation>,
    durability: Durability,
}

impl WriteTransaction {
    pub(crate) fn new(
        connection: Connection,
        permit: WritePermit,
        base: Snapshot,
        durability: Durability,
    ) -> Self {
        Self {
            connection,
            permit: Some(permit),
            working: base,
            mutations: Vec::new(),
            durability,
        }
    }

    pub fn set_durability(&mut self, durability: Durability) {
        self.durability = durability;
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// True once the transaction has staged at least one change.
    pub fn has_changes(&self) -> bool {
        !self.mutations.is_empty()
    }

    /// Inserts or overwrites `key` in `collection`.
    pub fn set(&mut self, collection: &str, key: &str, record: Record) -> Result<()> {
        validate_collection(collection)?;
        check_len("key", key.len())?;
        check_len("record", record.len())?;

        self.stage(Mutation::Put {
            collection: collection.to_string(),
            key: key.to_string(),
            record: Arc::new(record),
        });
        Ok(())
    }

    /// Removes `key` from `collection`. Returns whether it was present.
    pub fn remove(&mut self, collection: &str, key: &str) -> Result<bool> {
        validate_collection(collection)?;
        if !self.contains(collection, key) {
            return Ok(false);
        }

        self.stage(Mutation::Remove {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(true)
    }

    /// Removes every record in `collection` and returns how many there were.
    pub fn remove_all(&mut self, collection: &str) -> Result<usize> {
        validate_collection(collection)?;
        let removed = self.count(collection);
        if removed == 0 {
            return Ok(0);
        }

        self.stage(Mutation::RemoveAll {
            collection: collection.to_string(),
        });
        Ok(removed)
    }

    fn stage(&mut self, mutation: Mutation) {
        self.working.apply(&mutation);
        self.mutations.push(mutation);
    }

    /// Publishes the staged changes atomically and returns the commit's
    /// sequence number.
    ///
    /// A transaction without changes commits trivially and returns the
    /// sequence it read at. If writing the log fails, nothing is published and
    /// the error is returned; the transaction is rolled back either way.
    pub fn commit(mut self) -> Result<u64> {
        let Some(permit) = self.permit.take() else {
            return Err(StoreError::Closed);
        };
        if self.mutations.is_empty() {
            return Ok(self.working.sequence());
        }

        let mutations = std::mem::take(&mut self.mutations);
        let working = std::mem::take(&mut self.working);
        let snapshot = self.connection.shared().commit(
            &permit,
            working,
            mutations,
            self.durability,
        )?;

        let sequence = snapshot.sequence();
        self.connection.adopt(snapshot);
        drop(permit);
        Ok(sequence)
    }

    /// Discards the staged changes.
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if self.permit.take().is_some() && !self.mutations.is_empty() {
            #[cfg(feature = "logging")]
            log::debug!(
                "rolled back write transaction with {} staged mutations",
                self.mutations.len()
            );
            self.mutations.clear();
        }
    }
}

impl ReadableStore for WriteTransaction {
    fn snapshot(&self) -> &Snapshot {
        &self.working
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        self.rollback();
    }
}

pub(crate) fn validate_collection(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidCollection(name.to_string()));
    }
    check_len("collection name", name.len())
}

fn check_len(what: &'static str, len: usize) -> Result<()> {
    if u32::try_from(len).is_err() {
        return Err(StoreError::ValueTooLarge { what, len });
    }
    Ok(())
}
