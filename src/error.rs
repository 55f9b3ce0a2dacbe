use std::io;
use std::path::PathBuf;

/// Result alias used throughout the store.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors surfaced by the session store.
///
/// Lookups that find nothing are not errors: `get` returns `None`. Contention
/// between writers is resolved by blocking at the write gate and is never
/// reported to callers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing files could not be opened, locked, or recovered.
    ///
    /// This is fatal for whatever depends on the store: session state cannot
    /// be rebuilt silently.
    #[error("storage unavailable at '{}': {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// On-disk data failed validation after the store was opened.
    #[error("corrupted store data: {0}")]
    Corrupted(String),

    /// The store has been closed; no new transactions can begin.
    #[error("store is closed")]
    Closed,

    /// A deadline expired or was cancelled before the operation could start.
    #[error("deadline exceeded before {0} could complete")]
    DeadlineExceeded(&'static str),

    /// Collection names must be non-empty and fit in a `u32` length prefix.
    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    /// A key, record, or collection name exceeds the `u32` length prefix.
    #[error("{what} of {len} bytes exceeds the maximum encodable length")]
    ValueTooLarge { what: &'static str, len: usize },

    /// An I/O error from one of the three store files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub(crate) fn unavailable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Returns true for errors that make the store unusable until reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::StorageUnavailable { .. } | StoreError::Corrupted(_)
        )
    }
}
