use std::collections::BTreeMap;
use std::collections::btree_map;
use std::io;
use std::sync::Arc;

use super::wal::entry::{Mutation, WALEntry};
use crate::codec::{ByteReader, put_bytes, put_str, put_u32, put_u64};
use crate::record::Record;

static EMPTY_COLLECTION: Collection = Collection::new();

#[derive(Debug, Clone)]
struct Slot {
    ordinal: u64,
    record: Arc<Record>,
}

/// The records of one collection at a given commit.
///
/// Besides the key index, a collection remembers the order in which keys were
/// first inserted. Overwriting a key keeps its position; removing a key and
/// inserting it again moves it to the end.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    entries: BTreeMap<String, Slot>,
    order: BTreeMap<u64, String>,
    next_ordinal: u64,
}

impl Collection {
    pub(crate) const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            order: BTreeMap::new(),
            next_ordinal: 0,
        }
    }

    pub(crate) fn empty<'a>() -> &'a Collection {
        &EMPTY_COLLECTION
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.entries.get(key).map(|slot| slot.record.as_ref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(key, record)` pairs in insertion order.
    pub fn iter(&self) -> Entries<'_> {
        Entries {
            entries: &self.entries,
            order: self.order.iter(),
        }
    }

    /// Iterates `(key, record)` pairs in key order.
    pub fn iter_sorted(&self) -> SortedEntries<'_> {
        SortedEntries {
            inner: self.entries.iter(),
        }
    }

    /// Iterates keys in insertion order.
    pub fn keys(&self) -> Keys<'_> {
        Keys { inner: self.iter() }
    }

    pub(crate) fn insert(&mut self, key: &str, record: Arc<Record>) {
        if let Some(slot) = self.entries.get_mut(key) {
            slot.record = record;
            return;
        }
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.order.insert(ordinal, key.to_string());
        self.entries
            .insert(key.to_string(), Slot { ordinal, record });
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.ordinal);
                true
            }
            None => false,
        }
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = (&'a str, &'a Record);
    type IntoIter = Entries<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Insertion-ordered iterator over a collection.
pub struct Entries<'a> {
    entries: &'a BTreeMap<String, Slot>,
    order: btree_map::Iter<'a, u64, String>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = (&'a str, &'a Record);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, key) = self.order.next()?;
            if let Some(slot) = self.entries.get(key) {
                return Some((key.as_str(), slot.record.as_ref()));
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.order.size_hint().1)
    }
}

pub struct Keys<'a> {
    inner: Entries<'a>,
}

impl<'a> Iterator for Keys<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(key, _)| key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Key-ordered iterator over a collection.
pub struct SortedEntries<'a> {
    inner: btree_map::Iter<'a, String, Slot>,
}

impl<'a> Iterator for SortedEntries<'a> {
    type Item = (&'a str, &'a Record);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(key, slot)| (key.as_str(), slot.record.as_ref()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for SortedEntries<'_> {}

/// An immutable view of every collection as of one commit.
///
/// Committed snapshots are shared between readers through `Arc`. A write
/// transaction works on a private clone; untouched collections stay shared
/// and a collection is copied the first time the transaction modifies it.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    sequence: u64,
    collections: BTreeMap<String, Arc<Collection>>,
}

impl Snapshot {
    /// Commit sequence number this snapshot reflects. Zero for a new store.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name).map(Arc::as_ref)
    }

    /// Names of the non-empty collections, in name order.
    pub fn collection_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.collections.keys().map(String::as_str)
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Applies one mutation. Collections left empty are dropped so that a
    /// collection exists exactly when it holds at least one record.
    pub(crate) fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::Put {
                collection,
                key,
                record,
            } => {
                let target = self.collections.entry(collection.clone()).or_default();
                Arc::make_mut(target).insert(key, Arc::clone(record));
            }
            Mutation::Remove { collection, key } => {
                let now_empty = match self.collections.get_mut(collection) {
                    Some(target) if target.contains_key(key) => {
                        let target = Arc::make_mut(target);
                        target.remove(key);
                        target.is_empty()
                    }
                    _ => false,
                };
                if now_empty {
                    self.collections.remove(collection);
                }
            }
            Mutation::RemoveAll { collection } => {
                self.collections.remove(collection);
            }
        }
    }

    /// Replays a logged transaction and advances the sequence to it.
    pub(crate) fn apply_entry(&mut self, entry: &WALEntry) {
        for mutation in &entry.mutations {
            self.apply(mutation);
        }
        self.sequence = entry.sequence;
    }

    /// Serializes every collection for the primary file.
    ///
    /// Format, all integers little-endian:
    /// - `collection_count` (u32)
    /// - per collection: `name` (u32-prefixed), `next_ordinal` (u64),
    ///   `entry_count` (u64), then per entry in insertion order:
    ///   `ordinal` (u64) | `key` (u32-prefixed) | `tag` (u32) | `data` (u32-prefixed)
    pub(crate) fn encode_image(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        #[allow(clippy::cast_possible_truncation)]
        put_u32(&mut buf, self.collections.len() as u32);

        for (name, collection) in &self.collections {
            put_str(&mut buf, name);
            put_u64(&mut buf, collection.next_ordinal);
            put_u64(&mut buf, collection.entries.len() as u64);
            for (ordinal, key) in &collection.order {
                let Some(slot) = collection.entries.get(key) else {
                    continue;
                };
                put_u64(&mut buf, *ordinal);
                put_str(&mut buf, key);
                put_u32(&mut buf, slot.record.tag());
                put_bytes(&mut buf, slot.record.data());
            }
        }

        buf
    }

    /// Inverse of [`encode_image`](Self::encode_image). An empty buffer is the
    /// image of an empty store.
    pub(crate) fn decode_image(sequence: u64, data: &[u8]) -> io::Result<Self> {
        let mut snapshot = Snapshot {
            sequence,
            collections: BTreeMap::new(),
        };
        if data.is_empty() {
            return Ok(snapshot);
        }

        let mut reader = ByteReader::new(data);
        let collection_count = reader.u32("collection count")?;
        for _ in 0..collection_count {
            let name = reader.string("collection name")?;
            let next_ordinal = reader.u64("next ordinal")?;
            let entry_count = reader.u64("entry count")?;

            let mut collection = Collection::new();
            collection.next_ordinal = next_ordinal;
            for _ in 0..entry_count {
                let ordinal = reader.u64("ordinal")?;
                let key = reader.string("key")?;
                let tag = reader.u32("record tag")?;
                let record = Record::new(tag, reader.bytes("record data")?);

                if ordinal >= next_ordinal || collection.order.contains_key(&ordinal) {
                    return Err(invalid(format!(
                        "ordinal {ordinal} out of place in collection '{name}'"
                    )));
                }
                if collection.entries.contains_key(&key) {
                    return Err(invalid(format!(
                        "duplicate key '{key}' in collection '{name}'"
                    )));
                }
                collection.order.insert(ordinal, key.clone());
                collection.entries.insert(
                    key,
                    Slot {
                        ordinal,
                        record: Arc::new(record),
                    },
                );
            }

            if name.is_empty() || collection.is_empty() {
                return Err(invalid(format!("empty collection '{name}' in image")));
            }
            if snapshot
                .collections
                .insert(name.clone(), Arc::new(collection))
                .is_some()
            {
                return Err(invalid(format!("duplicate collection '{name}' in image")));
            }
        }

        if !reader.is_empty() {
            return Err(invalid(format!(
                "{} trailing bytes after image",
                data.len() - reader.position()
            )));
        }

        Ok(snapshot)
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
