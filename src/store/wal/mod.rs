// Write-ahead log for the session store
//
// The log provides:
// - Append-only commits framed with a CRC32, synced per transaction by default
// - Crash recovery that replays every committed transaction after the last checkpoint
// - Background checkpointing that folds the log into the primary file

pub(crate) mod checkpoint;
pub mod config;
pub(crate) mod entry;
pub(crate) mod journal;
pub(crate) mod recovery;

pub use self::config::WALConfig;
