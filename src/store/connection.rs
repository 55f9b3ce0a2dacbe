use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;

use super::database::StoreShared;
use super::pool::ContextToken;
use super::snapshot::Snapshot;
use super::transaction::{ReadTransaction, WriteTransaction};
use crate::deadline::Deadline;
use crate::error::{Result, StoreError};

/// Snapshot cache counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Read transactions served from the cached snapshot.
    pub cache_hits: u64,
    /// Times the cache was replaced because a newer commit existed.
    pub cache_refreshes: u64,
}

/// A long-lived handle for opening transactions.
///
/// Connections are cheap to clone; clones share one snapshot cache. The cache
/// is checked against the committed sequence in the shared index, so repeated
/// read transactions with no intervening commits reuse the same snapshot.
///
/// A thread must not begin a second write transaction while it still holds
/// one: the second call waits for the first forever.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    shared: Arc<StoreShared>,
    context: Option<ContextToken>,
    cached: ArcSwap<Snapshot>,
    cache_hits: AtomicU64,
    cache_refreshes: AtomicU64,
}

impl Connection {
    pub(crate) fn new(shared: Arc<StoreShared>, context: Option<ContextToken>) -> Self {
        let cached = ArcSwap::new(shared.current_snapshot());
        Self {
            inner: Arc::new(ConnectionInner {
                shared,
                context,
                cached,
                cache_hits: AtomicU64::new(0),
                cache_refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// A new connection to the same store with its own snapshot cache.
    pub(crate) fn sibling(&self, context: Option<ContextToken>) -> Connection {
        Connection::new(Arc::clone(&self.inner.shared), context)
    }

    pub(crate) fn shared(&self) -> &StoreShared {
        &self.inner.shared
    }

    /// The context this connection was handed out for. `None` for the
    /// store's default connection.
    pub fn context(&self) -> Option<ContextToken> {
        self.inner.context
    }

    /// True if both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        self.inner.shared.ensure_open()?;
        Ok(ReadTransaction::new(self.snapshot()))
    }

    /// Begins the write transaction, waiting behind earlier writers in
    /// arrival order.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        let shared = &self.inner.shared;
        shared.ensure_open()?;
        let permit = shared.gate().acquire();
        shared.ensure_open()?;
        Ok(WriteTransaction::new(
            self.clone(),
            permit,
            (*shared.current_snapshot()).clone(),
            shared.config().default_durability,
        ))
    }

    /// Like [`begin_write`](Self::begin_write), but gives up when `deadline`
    /// expires.
    pub fn begin_write_until(&self, deadline: &Deadline) -> Result<WriteTransaction> {
        let shared = &self.inner.shared;
        shared.ensure_open()?;
        let permit = shared
            .gate()
            .acquire_until(deadline)
            .ok_or(StoreError::DeadlineExceeded("begin_write"))?;
        shared.ensure_open()?;
        Ok(WriteTransaction::new(
            self.clone(),
            permit,
            (*shared.current_snapshot()).clone(),
            shared.config().default_durability,
        ))
    }

    /// Runs `f` inside a read transaction.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction) -> T,
    {
        let txn = self.begin_read()?;
        Ok(f(&txn))
    }

    /// Runs `f` inside a write transaction, committing if it returns `Ok`.
    ///
    /// If `f` returns `Err` or panics, the transaction is rolled back. A failed
    /// commit is returned through `E`.
    pub fn write<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut WriteTransaction) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut txn = self.begin_write()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_refreshes: self.inner.cache_refreshes.load(Ordering::Relaxed),
        }
    }

    /// The newest committed snapshot, from the cache when it is still current.
    fn snapshot(&self) -> Arc<Snapshot> {
        let inner = &self.inner;
        let committed = inner.shared.committed_seq();
        let cached = inner.cached.load_full();
        if cached.sequence() >= committed {
            inner.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }

        let fresh = inner.shared.current_snapshot();
        inner.cached.store(Arc::clone(&fresh));
        inner.cache_refreshes.fetch_add(1, Ordering::Relaxed);
        fresh
    }

    /// Caches the snapshot this connection just committed.
    pub(crate) fn adopt(&self, snapshot: Arc<Snapshot>) {
        self.inner.cached.store(snapshot);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("context", &self.inner.context)
            .field("cached_sequence", &self.inner.cached.load().sequence())
            .finish()
    }
}
