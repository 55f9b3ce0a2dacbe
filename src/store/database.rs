use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use super::builder::{StoreBuilder, StoreConfig};
use super::connection::Connection;
use super::gate::{WriteGate, WritePermit};
use super::header::PrimaryFile;
use super::paths::StorePaths;
use super::pool::{ContextToken, ConnectionPool};
use super::shm::{ShmIndex, ShmState};
use super::snapshot::Snapshot;
use super::transaction::{Durability, ReadTransaction, WriteTransaction};
use super::wal::checkpoint::CheckpointManager;
use super::wal::entry::{Mutation, WALEntry};
use super::wal::journal::WALJournal;
use super::wal::recovery::WALRecovery;
use crate::backend::FileBackend;
use crate::deadline::Deadline;
use crate::error::{Result, StoreError};

/// Grace period for the implicit close when a [`Store`] is dropped.
const DROP_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

const JOURNAL_FAILED: &str = "write-ahead log is blocked by a failed append";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// `close` has started: no new transactions, in-flight writers may finish.
    Closing,
    /// Files synced and the primary lock released. Nothing may be written.
    Released,
}

/// Summary of [`Store::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReport {
    /// True if the log was folded into the primary file before closing. When
    /// false, the log was synced and is replayed on the next open.
    pub checkpointed: bool,
    /// Last committed sequence.
    pub sequence: u64,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Sequence of the newest commit.
    pub committed_seq: u64,
    /// Sequence of the newest checkpoint in the primary file.
    pub checkpoint_seq: u64,
    /// Size of the write-ahead log, header included.
    pub wal_bytes: u64,
    /// Bytes of the primary file in use by the header and live image.
    pub primary_bytes: u64,
    /// Contexts with a registered connection.
    pub connections: usize,
    /// Non-empty collections in the newest snapshot.
    pub collections: usize,
}

/// State shared by the store, its connections, and the checkpoint thread.
pub(crate) struct StoreShared {
    paths: StorePaths,
    config: StoreConfig,
    current: ArcSwap<Snapshot>,
    gate: Arc<WriteGate>,
    journal: WALJournal,
    primary: Mutex<PrimaryFile>,
    shm: RwLock<ShmIndex>,
    lifecycle: RwLock<Lifecycle>,
}

impl StoreShared {
    /// Opens the three files, recovers committed state, and folds any
    /// replayed log entries into the primary file.
    fn open(paths: StorePaths, config: StoreConfig) -> Result<Self> {
        let primary_path = paths.primary();
        let primary_backend = FileBackend::open_locked(primary_path)
            .map_err(|e| StoreError::unavailable(primary_path, e))?;
        let (mut primary, mut snapshot) = PrimaryFile::open(Arc::new(primary_backend))
            .map_err(|e| StoreError::unavailable(primary_path, e))?;
        let checkpoint_seq = primary.checkpoint_seq();

        let wal_path = paths.wal();
        let wal_backend =
            FileBackend::open_unlocked(wal_path).map_err(|e| StoreError::unavailable(wal_path, e))?;
        let journal = WALJournal::new(Arc::new(wal_backend), checkpoint_seq + 1)
            .map_err(|e| StoreError::unavailable(wal_path, e))?;

        let recovered = WALRecovery::new(&journal)
            .recover(checkpoint_seq)
            .map_err(|e| StoreError::unavailable(wal_path, e))?;

        if recovered.discarded_bytes > 0 {
            #[cfg(feature = "logging")]
            log::warn!(
                "WAL recovery: discarded {} bytes of torn tail",
                recovered.discarded_bytes
            );
        }

        if !recovered.entries.is_empty() {
            #[cfg(feature = "logging")]
            log::info!(
                "WAL recovery: applying {} transactions after checkpoint {}",
                recovered.entries.len(),
                checkpoint_seq
            );
            for entry in &recovered.entries {
                snapshot.apply_entry(entry);
            }
            primary
                .write_image(&snapshot)
                .map_err(|e| StoreError::unavailable(primary_path, e))?;
        }

        // An empty log can still carry the header of an earlier generation if
        // a truncate was interrupted. It must expect the next sequence before
        // anything is appended to it.
        if !journal.is_empty() || journal.oldest_seq() != snapshot.sequence() + 1 {
            journal
                .truncate(snapshot.sequence() + 1)
                .map_err(|e| StoreError::unavailable(wal_path, e))?;
            #[cfg(feature = "logging")]
            log::info!(
                "WAL recovery completed through sequence {} ({} entries already checkpointed)",
                snapshot.sequence(),
                recovered.already_checkpointed
            );
        }

        let shm_path = paths.shm();
        let shm = ShmIndex::open(
            shm_path,
            ShmState {
                checkpoint_seq: primary.checkpoint_seq(),
                committed_seq: snapshot.sequence(),
                wal_end: journal.file_size(),
                connections: 0,
            },
        )
        .map_err(|e| StoreError::unavailable(shm_path, e))?;

        Ok(Self {
            paths,
            config,
            current: ArcSwap::from_pointee(snapshot),
            gate: WriteGate::new(),
            journal,
            primary: Mutex::new(primary),
            shm: RwLock::new(shm),
            lifecycle: RwLock::new(Lifecycle::Open),
        })
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if *self.lifecycle.read() == Lifecycle::Open {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn gate(&self) -> &Arc<WriteGate> {
        &self.gate
    }

    pub(crate) fn current_snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Latest committed sequence as published in the shared index.
    pub(crate) fn committed_seq(&self) -> u64 {
        self.shm.read().committed_seq()
    }

    pub(crate) fn wal_size(&self) -> u64 {
        self.journal.file_size()
    }

    pub(crate) fn wal_is_empty(&self) -> bool {
        self.journal.is_empty()
    }

    /// Logs and publishes a write transaction.
    ///
    /// `working` is the transaction's snapshot, still carrying the sequence it
    /// was based on. The caller's permit guarantees that base is current.
    pub(crate) fn commit(
        &self,
        _permit: &WritePermit,
        mut working: Snapshot,
        mutations: Vec<Mutation>,
        durability: Durability,
    ) -> Result<Arc<Snapshot>> {
        let lifecycle = self.lifecycle.read();
        if *lifecycle == Lifecycle::Released {
            return Err(StoreError::Closed);
        }

        if self.journal.is_failed() {
            return Err(StoreError::Corrupted(JOURNAL_FAILED.to_string()));
        }

        let sequence = working.sequence() + 1;
        let entry = WALEntry::new(sequence, mutations);
        let wal_end = self
            .journal
            .append(&entry, durability == Durability::Immediate)
            .map_err(|e| {
                if self.journal.is_failed() {
                    StoreError::Corrupted(format!("{JOURNAL_FAILED}: {e}"))
                } else {
                    StoreError::Io(e)
                }
            })?;

        working.set_sequence(sequence);
        let snapshot = Arc::new(working);
        self.current.store(Arc::clone(&snapshot));
        self.shm.write().record_commit(sequence, wal_end);
        Ok(snapshot)
    }

    /// Writes the current snapshot to the primary file and empties the log.
    ///
    /// Readers are never blocked; writers wait at the gate until the image is
    /// written.
    pub(crate) fn checkpoint(&self, deadline: &Deadline) -> Result<u64> {
        self.ensure_open()?;
        let permit = self
            .gate
            .acquire_until(deadline)
            .ok_or(StoreError::DeadlineExceeded("checkpoint"))?;
        self.checkpoint_locked(&permit, deadline)
    }

    fn checkpoint_locked(&self, _permit: &WritePermit, deadline: &Deadline) -> Result<u64> {
        let lifecycle = self.lifecycle.read();
        if *lifecycle == Lifecycle::Released {
            return Err(StoreError::Closed);
        }

        let snapshot = self.current.load_full();
        let sequence = snapshot.sequence();
        let mut primary = self.primary.lock();

        if sequence == primary.checkpoint_seq() {
            if !self.journal.is_empty() || self.journal.is_failed() {
                self.journal.truncate(sequence + 1)?;
                self.shm
                    .write()
                    .record_checkpoint(sequence, self.journal.file_size());
            }
            return Ok(sequence);
        }

        if deadline.is_expired() {
            return Err(StoreError::DeadlineExceeded("checkpoint"));
        }

        primary.write_image(&snapshot)?;
        self.journal.truncate(sequence + 1)?;
        self.shm
            .write()
            .record_checkpoint(sequence, self.journal.file_size());

        #[cfg(feature = "logging")]
        log::info!(
            "checkpoint through sequence {} ({} collections, {} bytes)",
            sequence,
            snapshot.collection_count(),
            primary.file_size()
        );
        Ok(sequence)
    }

    /// Syncs the log and releases the primary lock. After this no further
    /// writes reach the files.
    fn release(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write();
        if *lifecycle == Lifecycle::Released {
            return Ok(());
        }
        *lifecycle = Lifecycle::Released;

        let journal = self.journal.shutdown();
        let shm = {
            let mut shm = self.shm.write();
            shm.set_connections(0);
            shm.flush()
        };
        let primary = self.primary.lock().close();
        if self.journal.is_failed() {
            return Err(StoreError::Corrupted(JOURNAL_FAILED.to_string()));
        }
        journal?;
        shm?;
        primary?;
        Ok(())
    }
}

/// A durable, keyed session store.
///
/// Open one `Store` per database and pass it by reference to whatever needs
/// it. Transactions are opened through [`Connection`]s: the store's default
/// connection from [`connection`](Self::connection), or a per-context one
/// from [`connection_for`](Self::connection_for).
///
/// # Example
///
/// ```no_run
/// use session_store::{Deadline, ReadableStore, Record, Store};
///
/// let store = Store::open("signal.db")?;
/// let conn = store.connection();
///
/// conn.write(|txn| txn.set("sessions", "+15550100.1", Record::new(3, vec![1, 2, 3])))?;
///
/// let found = conn.read(|txn| txn.get("sessions", "+15550100.1").cloned())?;
/// assert_eq!(found.unwrap().tag(), 3);
///
/// store.close(&Deadline::none())?;
/// # Ok::<(), session_store::StoreError>(())
/// ```
pub struct Store {
    shared: Arc<StoreShared>,
    pool: ConnectionPool,
    default_connection: Connection,
    checkpointer: Mutex<Option<CheckpointManager>>,
}

impl Store {
    /// Opens or creates a store at `path` with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] if the files cannot be
    /// created, another process holds the store open, or the files are
    /// corrupt beyond recovery.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().open(path)
    }

    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Internal implementation of open, called by the builder.
    pub(crate) fn open_with_config(paths: StorePaths, config: StoreConfig) -> Result<Self> {
        let shared = Arc::new(StoreShared::open(paths, config)?);

        let checkpointer = if shared.config.background_checkpoint {
            Some(CheckpointManager::start(
                Arc::downgrade(&shared),
                shared.config.checkpoint.clone().into(),
            )?)
        } else {
            None
        };

        #[cfg(feature = "logging")]
        log::info!(
            "opened session store at {} (sequence {})",
            shared.paths.primary().display(),
            shared.current.load().sequence()
        );

        Ok(Self {
            pool: ConnectionPool::new(shared.config.max_connections),
            default_connection: Connection::new(Arc::clone(&shared), None),
            checkpointer: Mutex::new(checkpointer),
            shared,
        })
    }

    pub fn paths(&self) -> &StorePaths {
        &self.shared.paths
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// The store's default shared connection.
    pub fn connection(&self) -> Connection {
        self.default_connection.clone()
    }

    /// The connection registered for `context`, created on first use.
    ///
    /// Repeated calls with the same token return the same connection until
    /// the registry evicts it or it is released.
    pub fn connection_for(&self, context: ContextToken) -> Connection {
        let acquired = self.pool.acquire(context, || {
            self.default_connection.sibling(Some(context))
        });

        if acquired.created {
            #[cfg(feature = "logging")]
            log::debug!(
                "registered connection for context {:?} (evicted {:?})",
                context,
                acquired.evicted
            );
            self.publish_connection_count();
        }
        acquired.connection
    }

    /// Drops the registry entry for `context`. Handles already given out keep
    /// working.
    pub fn release_connection(&self, context: ContextToken) -> bool {
        let released = self.pool.release(context);
        if released {
            #[cfg(feature = "logging")]
            log::debug!("released connection for context {context:?}");
            self.publish_connection_count();
        }
        released
    }

    /// True if `context` currently has a registered connection.
    pub fn is_registered(&self, context: ContextToken) -> bool {
        self.pool.contains(context)
    }

    fn publish_connection_count(&self) {
        let count = u32::try_from(self.pool.len()).unwrap_or(u32::MAX);
        self.shared.shm.write().set_connections(count);
    }

    /// Begins a read transaction on the default connection.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        self.default_connection.begin_read()
    }

    /// Begins a write transaction on the default connection.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        self.default_connection.begin_write()
    }

    /// Folds the log into the primary file and returns the checkpointed
    /// sequence.
    ///
    /// Fails with [`StoreError::DeadlineExceeded`] if the write gate could not
    /// be acquired before `deadline`.
    pub fn checkpoint(&self, deadline: &Deadline) -> Result<u64> {
        self.shared.checkpoint(deadline)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let published = self.shared.shm.read().read()?;
        Ok(StoreStats {
            committed_seq: published.committed_seq,
            checkpoint_seq: published.checkpoint_seq,
            wal_bytes: published.wal_end,
            primary_bytes: self.shared.primary.lock().file_size(),
            connections: published.connections as usize,
            collections: self.shared.current.load().collection_count(),
        })
    }

    /// Checkpoints, syncs, and releases the store files.
    ///
    /// New transactions fail with [`StoreError::Closed`] from the moment this
    /// is called. A writer already in progress may still commit while close
    /// waits for the write gate. If `deadline` expires first, the log is
    /// synced without a checkpoint, the report says so, and recovery replays
    /// it on the next open.
    pub fn close(self, deadline: &Deadline) -> Result<CloseReport> {
        self.shutdown(deadline)
    }

    /// Closes the store and deletes its three files.
    ///
    /// Deletion proceeds even if the final checkpoint fails.
    pub fn reset(self, deadline: &Deadline) -> Result<()> {
        let paths = self.shared.paths.clone();
        if let Err(_e) = self.shutdown(deadline) {
            #[cfg(feature = "logging")]
            log::warn!("close before reset failed: {_e}");
        }
        drop(self);
        paths.delete_files()?;

        #[cfg(feature = "logging")]
        log::info!("deleted session store at {}", paths.primary().display());
        Ok(())
    }

    fn shutdown(&self, deadline: &Deadline) -> Result<CloseReport> {
        {
            let mut lifecycle = self.shared.lifecycle.write();
            if *lifecycle != Lifecycle::Open {
                return Ok(CloseReport {
                    checkpointed: false,
                    sequence: self.shared.current.load().sequence(),
                });
            }
            *lifecycle = Lifecycle::Closing;
        }

        let mut first_error = None;
        if let Some(manager) = self.checkpointer.lock().take() {
            if let Err(e) = manager.shutdown() {
                first_error = Some(StoreError::Io(e));
            }
        }

        let permit = self.shared.gate.acquire_until(deadline);
        let checkpointed = match &permit {
            Some(permit) => match self.shared.checkpoint_locked(permit, deadline) {
                Ok(_) => true,
                Err(StoreError::DeadlineExceeded(_)) => false,
                Err(e) => {
                    first_error.get_or_insert(e);
                    false
                }
            },
            None => false,
        };

        if let Err(e) = self.shared.release() {
            first_error.get_or_insert(e);
        }
        drop(permit);
        self.pool.clear();

        let sequence = self.shared.current.load().sequence();
        #[cfg(feature = "logging")]
        log::info!("closed session store at sequence {sequence} (checkpointed: {checkpointed})");

        match first_error {
            Some(e) => Err(e),
            None => Ok(CloseReport {
                checkpointed,
                sequence,
            }),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if *self.shared.lifecycle.read() != Lifecycle::Open {
            return;
        }
        if let Err(_e) = self.shutdown(&Deadline::after(DROP_CLOSE_TIMEOUT)) {
            #[cfg(feature = "logging")]
            log::warn!("implicit close on drop failed: {_e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::store::transaction::ReadableStore;
    use tempfile::TempDir;

    fn quiet_store(dir: &TempDir) -> Store {
        Store::builder()
            .without_background_checkpoint()
            .open(dir.path().join("store.db"))
            .unwrap()
    }

    #[test]
    fn test_open_creates_three_files() {
        let dir = TempDir::new().unwrap();
        let store = quiet_store(&dir);
        for path in store.paths().files() {
            assert!(path.exists(), "{} missing", path.display());
        }
    }

    #[test]
    fn test_commit_publishes_to_shm() {
        let dir = TempDir::new().unwrap();
        let store = quiet_store(&dir);

        let mut txn = store.begin_write().unwrap();
        txn.set("sessions", "a", Record::new(1, b"x".to_vec())).unwrap();
        assert_eq!(txn.commit().unwrap(), 1);

        assert_eq!(store.shared.committed_seq(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.committed_seq, 1);
        assert_eq!(stats.checkpoint_seq, 0);
        assert!(stats.wal_bytes > 512);
        assert_eq!(stats.collections, 1);
    }

    #[test]
    fn test_checkpoint_empties_wal() {
        let dir = TempDir::new().unwrap();
        let store = quiet_store(&dir);

        let mut txn = store.begin_write().unwrap();
        txn.set("sessions", "a", Record::new(1, b"x".to_vec())).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.checkpoint(&Deadline::none()).unwrap(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.checkpoint_seq, 1);
        assert_eq!(stats.wal_bytes, 512);
        assert!(store.shared.wal_is_empty());

        // A second checkpoint with nothing new is a no-op
        assert_eq!(store.checkpoint(&Deadline::none()).unwrap(), 1);
    }

    #[test]
    fn test_checkpoint_times_out_behind_writer() {
        let dir = TempDir::new().unwrap();
        let store = quiet_store(&dir);

        let writer = store.begin_write().unwrap();
        let err = store
            .checkpoint(&Deadline::after(Duration::from_millis(30)))
            .unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded("checkpoint")));

        // Readers proceed while the writer holds the gate
        assert!(store.begin_read().is_ok());
        drop(writer);
    }

    #[test]
    fn test_second_open_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = quiet_store(&dir);

        let err = Store::open(dir.path().join("store.db")).err().unwrap();
        assert!(matches!(err, StoreError::StorageUnavailable { .. }));

        store.close(&Deadline::none()).unwrap();
        let reopened = Store::open(dir.path().join("store.db")).unwrap();
        assert_eq!(reopened.begin_read().unwrap().sequence(), 0);
    }

    #[test]
    fn test_connection_count_is_published() {
        let dir = TempDir::new().unwrap();
        let store = quiet_store(&dir);

        let a = ContextToken::from_raw(1);
        store.connection_for(a);
        store.connection_for(ContextToken::from_raw(2));
        assert_eq!(store.stats().unwrap().connections, 2);
        assert!(store.is_registered(a));

        assert!(store.release_connection(a));
        assert!(!store.is_registered(a));
        assert_eq!(store.stats().unwrap().connections, 1);
    }
}
