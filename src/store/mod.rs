//! Durable storage for keyed session records.
//!
//! A store is three files sharing one base path: the primary file holding the
//! last checkpointed image, a write-ahead log of commits since then, and a
//! small memory-mapped index with the counters connections poll.
//!
//! # Concurrency Model
//!
//! - One write transaction at a time. Writers queue at the write gate in
//!   arrival order and never see a conflict error.
//! - Readers never block and are never blocked. Each read transaction holds
//!   the snapshot that was current when it began.
//! - A checkpoint takes the write gate, so it waits for the active writer and
//!   holds back new ones while the image is written. Readers carry on.
//!
//! # Durability
//!
//! A commit with [`Durability::Immediate`] is synced to the log before it
//! returns. Recovery on open replays every entry past the primary file's
//! checkpoint and cuts away a torn tail left by a crash mid-append.
//!
//! # Example Usage
//!
//! ```no_run
//! use session_store::{ContextToken, Deadline, ReadableStore, Record, Store};
//!
//! let store = Store::open("signal.db")?;
//! let worker = store.connection_for(ContextToken::new());
//!
//! std::thread::scope(|s| {
//!     s.spawn(|| {
//!         worker.write(|txn| txn.set("preKeys", "17", Record::new(1, vec![0u8; 32])))
//!     });
//! });
//!
//! let keys = store.connection().read(|txn| txn.count("preKeys"))?;
//! assert_eq!(keys, 1);
//! store.close(&Deadline::none())?;
//! # Ok::<(), session_store::StoreError>(())
//! ```

pub(crate) mod builder;
pub(crate) mod connection;
pub(crate) mod database;
pub(crate) mod gate;
pub(crate) mod header;
pub(crate) mod paths;
pub(crate) mod pool;
pub(crate) mod shm;
pub(crate) mod snapshot;
pub(crate) mod transaction;
pub(crate) mod wal;

pub use self::builder::{StoreBuilder, StoreConfig};
pub use self::connection::{Connection, ConnectionStats};
pub use self::database::{CloseReport, Store, StoreStats};
pub use self::header::{FORMAT_VERSION, MAGIC_NUMBER};
pub use self::paths::StorePaths;
pub use self::pool::ContextToken;
pub use self::snapshot::{Collection, Entries, Keys, Snapshot, SortedEntries};
pub use self::transaction::{Durability, ReadTransaction, ReadableStore, WriteTransaction};
