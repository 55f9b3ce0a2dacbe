use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::connection::Connection;

/// Tokens from [`ContextToken::new`] start here, away from small raw ids
/// chosen by the host.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1 << 63);

/// Stable identity of a logical execution context (a worker queue, a
/// background job, the UI loop) that wants its own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextToken(u64);

impl ContextToken {
    /// A token distinct from every other token returned by `new`.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// A token with a host-chosen id, for contexts that persist across
    /// restarts or are named by configuration.
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Entry in the connection registry tracking usage metadata.
struct PoolEntry {
    connection: Connection,
    last_used: u64,
}

struct PoolState {
    entries: HashMap<ContextToken, PoolEntry>,
    clock: u64,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Registry handing out one connection per context.
///
/// The registry holds at most `max_size` entries and evicts the least
/// recently used one when full. Eviction only forgets the mapping: handles
/// already given out keep working, and the context gets a new connection the
/// next time it asks.
pub(crate) struct ConnectionPool {
    max_size: usize,
    state: Mutex<PoolState>,
}

/// Result of [`ConnectionPool::acquire`].
pub(crate) struct Acquired {
    pub(crate) connection: Connection,
    /// True if a new registry entry was created.
    pub(crate) created: bool,
    /// Context evicted to make room, if any.
    pub(crate) evicted: Option<ContextToken>,
}

impl ConnectionPool {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            max_size,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Returns the connection registered for `context`, creating it with
    /// `open` if there is none.
    ///
    /// A pool with `max_size` zero registers nothing and opens a fresh
    /// connection on every call.
    pub(crate) fn acquire(
        &self,
        context: ContextToken,
        open: impl FnOnce() -> Connection,
    ) -> Acquired {
        let mut state = self.state.lock();
        let now = state.tick();

        if let Some(entry) = state.entries.get_mut(&context) {
            entry.last_used = now;
            return Acquired {
                connection: entry.connection.clone(),
                created: false,
                evicted: None,
            };
        }

        let connection = open();
        if self.max_size == 0 {
            return Acquired {
                connection,
                created: false,
                evicted: None,
            };
        }

        let evicted = if state.entries.len() >= self.max_size {
            Self::evict_lru(&mut state.entries)
        } else {
            None
        };

        state.entries.insert(
            context,
            PoolEntry {
                connection: connection.clone(),
                last_used: now,
            },
        );
        Acquired {
            connection,
            created: true,
            evicted,
        }
    }

    /// Forgets the connection registered for `context`.
    pub(crate) fn release(&self, context: ContextToken) -> bool {
        self.state.lock().entries.remove(&context).is_some()
    }

    pub(crate) fn contains(&self, context: ContextToken) -> bool {
        self.state.lock().entries.contains_key(&context)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub(crate) fn clear(&self) {
        self.state.lock().entries.clear();
    }

    fn evict_lru(entries: &mut HashMap<ContextToken, PoolEntry>) -> Option<ContextToken> {
        let lru = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(context, _)| *context)?;
        entries.remove(&lru);
        Some(lru)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::Store;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::builder()
            .without_background_checkpoint()
            .open(dir.path().join("pool.db"))
            .unwrap()
    }

    fn acquire(pool: &ConnectionPool, store: &Store, context: ContextToken) -> Acquired {
        pool.acquire(context, || store.connection().sibling(Some(context)))
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = ContextToken::new();
        let b = ContextToken::new();
        assert_ne!(a, b);
        assert_eq!(ContextToken::from_raw(7).as_raw(), 7);
    }

    #[test]
    fn test_acquire_reuses_existing_connection() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let pool = ConnectionPool::new(10);
        let ctx = ContextToken::from_raw(1);

        let first = acquire(&pool, &store, ctx);
        assert!(first.created);
        let second = acquire(&pool, &store, ctx);
        assert!(!second.created);
        assert!(first.connection.ptr_eq(&second.connection));
        assert_eq!(pool.len(), 1);

        let other = acquire(&pool, &store, ContextToken::from_raw(2));
        assert!(!other.connection.ptr_eq(&first.connection));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_lru_eviction_respects_reuse() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let pool = ConnectionPool::new(3);
        let ctx = ContextToken::from_raw;

        acquire(&pool, &store, ctx(1));
        acquire(&pool, &store, ctx(2));
        acquire(&pool, &store, ctx(3));
        assert!(!acquire(&pool, &store, ctx(1)).created);

        let fourth = acquire(&pool, &store, ctx(4));
        assert_eq!(fourth.evicted, Some(ctx(2)));
        assert_eq!(pool.len(), 3);
        assert!(pool.contains(ctx(1)));
        assert!(!pool.contains(ctx(2)));
        assert!(pool.contains(ctx(3)));
        assert!(pool.contains(ctx(4)));
    }

    #[test]
    fn test_evicted_handle_keeps_working() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let pool = ConnectionPool::new(1);

        let old = acquire(&pool, &store, ContextToken::from_raw(1)).connection;
        acquire(&pool, &store, ContextToken::from_raw(2));
        assert!(!pool.contains(ContextToken::from_raw(1)));

        assert!(old.begin_read().is_ok());
        let again = acquire(&pool, &store, ContextToken::from_raw(1));
        assert!(again.created);
        assert!(!again.connection.ptr_eq(&old));
    }

    #[test]
    fn test_release_and_zero_capacity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let pool = ConnectionPool::new(4);
        acquire(&pool, &store, ContextToken::from_raw(9));
        assert!(pool.release(ContextToken::from_raw(9)));
        assert!(!pool.release(ContextToken::from_raw(9)));
        assert_eq!(pool.len(), 0);

        let unregistered = ConnectionPool::new(0);
        let a = acquire(&unregistered, &store, ContextToken::from_raw(1));
        let b = acquire(&unregistered, &store, ContextToken::from_raw(1));
        assert!(!a.connection.ptr_eq(&b.connection));
        assert_eq!(unregistered.len(), 0);
    }
}
