use super::entry::WALEntry;
use super::journal::WALJournal;
use std::io;

/// What recovery found in the log.
#[derive(Debug, Default)]
pub(crate) struct RecoveredLog {
    /// Entries newer than the checkpoint, in commit order.
    pub(crate) entries: Vec<WALEntry>,
    /// Entries already folded into the primary file by an interrupted checkpoint.
    pub(crate) already_checkpointed: usize,
    /// Bytes of torn tail that were cut away.
    pub(crate) discarded_bytes: u64,
}

/// WAL recovery performs crash recovery by replaying WAL entries on open.
///
/// Every committed transaction that reached the log is handed back for
/// replay, even if the process died before a checkpoint could fold it into
/// the primary file.
pub(crate) struct WALRecovery<'a> {
    journal: &'a WALJournal,
}

impl<'a> WALRecovery<'a> {
    pub(crate) fn new(journal: &'a WALJournal) -> Self {
        Self { journal }
    }

    /// Validates the log against the primary file's checkpoint and returns the
    /// entries to replay on top of it.
    ///
    /// This method:
    /// 1. Checks that the log starts no later than `checkpoint_seq + 1`
    /// 2. Scans the log and cuts away a torn tail
    /// 3. Requires sequence numbers to be contiguous from the header's oldest
    /// 4. Skips entries the checkpoint already contains
    ///
    /// A gap anywhere is an error: a committed transaction would be lost.
    pub(crate) fn recover(&self, checkpoint_seq: u64) -> io::Result<RecoveredLog> {
        let header = self.journal.read_header()?;
        if header.oldest_seq > checkpoint_seq + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "WAL starts at sequence {} but the primary file ends at {}",
                    header.oldest_seq, checkpoint_seq
                ),
            ));
        }

        let scan = self.journal.scan()?;
        if scan.torn_bytes > 0 {
            self.journal.discard_tail(scan.valid_end)?;
        }

        let mut recovered = RecoveredLog {
            discarded_bytes: scan.torn_bytes,
            ..RecoveredLog::default()
        };
        let mut prev_seq = header.oldest_seq.saturating_sub(1);

        for entry in scan.entries {
            if entry.sequence != prev_seq + 1 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "WAL sequence gap detected: expected {}, got {}",
                        prev_seq + 1,
                        entry.sequence
                    ),
                ));
            }
            prev_seq = entry.sequence;

            if entry.sequence <= checkpoint_seq {
                recovered.already_checkpointed += 1;
            } else {
                recovered.entries.push(entry);
            }
        }

        self.journal.resume(prev_seq.max(checkpoint_seq));
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, StorageBackend};
    use crate::store::wal::entry::Mutation;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn journal(dir: &TempDir, oldest: u64) -> (WALJournal, Arc<FileBackend>) {
        let backend = Arc::new(FileBackend::open_unlocked(&dir.path().join("wal")).unwrap());
        (WALJournal::new(backend.clone(), oldest).unwrap(), backend)
    }

    fn remove_all(sequence: u64) -> WALEntry {
        WALEntry::new(
            sequence,
            vec![Mutation::RemoveAll {
                collection: format!("c{sequence}"),
            }],
        )
    }

    #[test]
    fn test_recovery_empty_wal() {
        let dir = TempDir::new().unwrap();
        let (journal, _) = journal(&dir, 1);

        let recovered = WALRecovery::new(&journal).recover(0).unwrap();
        assert!(recovered.entries.is_empty());
        assert_eq!(recovered.discarded_bytes, 0);
    }

    #[test]
    fn test_recovery_with_entries() {
        let dir = TempDir::new().unwrap();
        let (journal, _) = journal(&dir, 1);
        for seq in 1..=5 {
            journal.append(&remove_all(seq), false).unwrap();
        }
        journal.sync().unwrap();

        let recovered = WALRecovery::new(&journal).recover(0).unwrap();
        assert_eq!(recovered.entries.len(), 5);
        assert_eq!(recovered.entries[4].sequence, 5);
    }

    #[test]
    fn test_skips_entries_covered_by_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (journal, _) = journal(&dir, 1);
        for seq in 1..=4 {
            journal.append(&remove_all(seq), true).unwrap();
        }

        // The image was written through sequence 2 but the WAL was never truncated
        let recovered = WALRecovery::new(&journal).recover(2).unwrap();
        assert_eq!(recovered.already_checkpointed, 2);
        let sequences: Vec<_> = recovered.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, [3, 4]);
    }

    #[test]
    fn test_sequence_gap_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (journal, _) = journal(&dir, 1);
        journal.append(&remove_all(1), true).unwrap();
        journal.append(&remove_all(3), true).unwrap();

        let err = WALRecovery::new(&journal).recover(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("gap"));
    }

    #[test]
    fn test_log_starting_after_checkpoint_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (journal, _) = journal(&dir, 10);

        let err = WALRecovery::new(&journal).recover(3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let (journal, backend) = journal(&dir, 1);
        journal.append(&remove_all(1), true).unwrap();
        let intact = journal.file_size();
        backend.write(intact, &[0x20, 0, 0, 0, 1, 2]).unwrap();

        let recovered = WALRecovery::new(&journal).recover(0).unwrap();
        assert_eq!(recovered.entries.len(), 1);
        assert_eq!(recovered.discarded_bytes, 6);
        assert_eq!(backend.len().unwrap(), intact);
    }
}
