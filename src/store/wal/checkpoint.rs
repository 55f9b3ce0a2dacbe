use super::config::CheckpointConfig;
use crate::deadline::Deadline;
use crate::error::StoreError;
use crate::store::database::StoreShared;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the background thread wakes to evaluate its triggers.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a background checkpoint waits for the write gate before retrying
/// on a later tick.
const GATE_WAIT: Duration = Duration::from_secs(1);

/// Manages background checkpointing of the WAL into the primary file.
///
/// The thread wakes every [`POLL_INTERVAL`] and checkpoints when the log is
/// non-empty and either:
/// - the configured interval has passed since the last checkpoint, or
/// - the log has grown past `max_wal_size`.
///
/// It holds the store weakly, so it never keeps a store alive on its own,
/// and exits once the store is closed or dropped.
pub(crate) struct CheckpointManager {
    shutdown_signal: Arc<(Mutex<bool>, Condvar)>,
    checkpoint_thread: Option<JoinHandle<()>>,
}

impl CheckpointManager {
    /// Creates and starts the checkpoint manager.
    pub(crate) fn start(store: Weak<StoreShared>, config: CheckpointConfig) -> io::Result<Self> {
        let shutdown_signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_shutdown = Arc::clone(&shutdown_signal);

        let checkpoint_thread = thread::Builder::new()
            .name("session-store-checkpoint".to_string())
            .spawn(move || Self::checkpoint_loop(store, config, thread_shutdown))?;

        Ok(Self {
            shutdown_signal,
            checkpoint_thread: Some(checkpoint_thread),
        })
    }

    /// Stops the thread and waits for it to finish its current checkpoint.
    pub(crate) fn shutdown(mut self) -> io::Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> io::Result<()> {
        {
            let (lock, cvar) = &*self.shutdown_signal;
            *lock.lock() = true;
            cvar.notify_all();
        }

        if let Some(handle) = self.checkpoint_thread.take() {
            handle
                .join()
                .map_err(|_| io::Error::other("checkpoint thread panicked"))?;
        }
        Ok(())
    }

    fn checkpoint_loop(
        store: Weak<StoreShared>,
        config: CheckpointConfig,
        shutdown_signal: Arc<(Mutex<bool>, Condvar)>,
    ) {
        let mut last_checkpoint = Instant::now();

        loop {
            {
                let (lock, cvar) = &*shutdown_signal;
                let mut stop = lock.lock();
                if !*stop {
                    cvar.wait_for(&mut stop, POLL_INTERVAL);
                }
                if *stop {
                    break;
                }
            }

            let Some(store) = store.upgrade() else {
                break;
            };

            if store.wal_is_empty() {
                last_checkpoint = Instant::now();
                continue;
            }

            let time_elapsed = last_checkpoint.elapsed() >= config.interval;
            let size_exceeded = store.wal_size() >= config.max_wal_size;
            if !(time_elapsed || size_exceeded) {
                continue;
            }

            match store.checkpoint(&Deadline::after(GATE_WAIT)) {
                Ok(_sequence) => {
                    last_checkpoint = Instant::now();
                    #[cfg(feature = "logging")]
                    log::debug!("background checkpoint through sequence {_sequence}");
                }
                Err(StoreError::Closed) => break,
                // Writers kept the gate busy; retry on the next tick
                Err(StoreError::DeadlineExceeded(_)) => {}
                Err(_e) => {
                    #[cfg(feature = "logging")]
                    log::warn!("background checkpoint failed: {_e}");
                }
            }
        }
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use crate::record::Record;
    use crate::store::database::Store;
    use crate::store::wal::WALConfig;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn wait_for_checkpoint(store: &Store, sequence: u64) -> bool {
        let give_up = Instant::now() + Duration::from_secs(5);
        while Instant::now() < give_up {
            if store.stats().unwrap().checkpoint_seq >= sequence {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_interval_trigger() {
        let dir = TempDir::new().unwrap();
        let store = Store::builder()
            .checkpoint(WALConfig {
                checkpoint_interval: Duration::from_millis(50),
                max_wal_size: u64::MAX,
            })
            .open(dir.path().join("interval.db"))
            .unwrap();

        let mut txn = store.begin_write().unwrap();
        txn.set("sessions", "alice", Record::new(1, b"state".to_vec()))
            .unwrap();
        let sequence = txn.commit().unwrap();

        assert!(wait_for_checkpoint(&store, sequence));
        assert_eq!(store.stats().unwrap().wal_bytes, 512);
    }

    #[test]
    fn test_size_trigger() {
        let dir = TempDir::new().unwrap();
        let store = Store::builder()
            .checkpoint(WALConfig {
                checkpoint_interval: Duration::from_secs(3600),
                max_wal_size: 1024,
            })
            .open(dir.path().join("size.db"))
            .unwrap();

        let mut last = 0;
        for i in 0..8 {
            let mut txn = store.begin_write().unwrap();
            txn.set("preKeys", &i.to_string(), Record::new(2, vec![7u8; 200]))
                .unwrap();
            last = txn.commit().unwrap();
        }

        assert!(wait_for_checkpoint(&store, last - 3));
    }

    #[test]
    fn test_thread_exits_when_store_closes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("exit.db")).unwrap();
        let report = store.close(&crate::Deadline::none()).unwrap();
        assert!(report.checkpointed);
    }
}
