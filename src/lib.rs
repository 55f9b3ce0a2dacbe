//! # session-store
//!
//! A durable, crash-safe keyed store for cryptographic session state: session
//! records, identity keys, pre-keys, and sender keys, grouped into named
//! collections of opaque tagged records.
//!
//! Every committed write transaction is durable once `commit` returns, and a
//! crash at any point loses no committed transaction. Readers see consistent
//! snapshots without blocking. See [`Store`] to get started.

#![deny(clippy::all)]

mod backend;
mod codec;
mod deadline;
mod error;
mod keys;
mod record;
mod store;

pub use deadline::Deadline;
pub use error::{Result, StoreError};
pub use keys::{DelimitedKey, KeyComposer};
pub use record::Record;
pub use store::wal::WALConfig;
pub use store::{
    CloseReport, Collection, Connection, ConnectionStats, ContextToken, Durability, Entries,
    FORMAT_VERSION, Keys, MAGIC_NUMBER, ReadTransaction, ReadableStore, Snapshot, SortedEntries,
    Store, StoreBuilder, StoreConfig, StorePaths, StoreStats, WriteTransaction,
};
