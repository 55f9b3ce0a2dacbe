use super::entry::WALEntry;
use crate::backend::StorageBackend;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

/// Magic number for WAL file identification.
const WAL_MAGIC: &[u8; 8] = b"SESD-WAL";

/// Current WAL format version.
const WAL_VERSION: u8 = 1;

/// Size of the WAL file header in bytes.
pub(crate) const WAL_HEADER_SIZE: usize = 512;

/// Length prefix plus trailing CRC around every entry.
const ENTRY_FRAMING: usize = 8;

/// The write-ahead log of committed transactions.
///
/// Every committed write transaction is appended as one entry:
/// `total_len (u32) | entry bytes | crc32 (u32)`, where `total_len` covers the
/// whole frame. Appends only happen while the caller holds the store's write
/// gate, so entries are written in commit order.
///
/// The journal tracks its own end offset instead of trusting the file length.
/// A failed append is cut off again, and the next append overwrites whatever
/// was left behind, so a half-written frame can never sit in front of a
/// committed one.
pub(crate) struct WALJournal {
    backend: Arc<dyn StorageBackend>,
    state: Mutex<JournalState>,
}

#[derive(Debug)]
struct JournalState {
    end: u64,
    oldest_seq: u64,
    latest_seq: u64,
    synced_seq: u64,
    /// Set when a failed append could not be cut back off the log.
    failed: bool,
}

/// Header structure for the WAL file.
#[derive(Debug, Clone)]
pub(crate) struct WALHeader {
    pub(crate) magic: [u8; 8],
    pub(crate) version: u8,
    pub(crate) oldest_seq: u64,
    pub(crate) latest_seq: u64,
}

/// Entries found in the log by [`WALJournal::scan`].
#[derive(Debug)]
pub(crate) struct ScanResult {
    pub(crate) entries: Vec<WALEntry>,
    /// Offset just past the last intact entry.
    pub(crate) valid_end: u64,
    /// Bytes after `valid_end` that did not form an intact entry.
    pub(crate) torn_bytes: u64,
}

impl WALHeader {
    fn new(oldest_seq: u64) -> Self {
        Self {
            magic: *WAL_MAGIC,
            version: WAL_VERSION,
            oldest_seq,
            latest_seq: oldest_seq.saturating_sub(1),
        }
    }

    fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];

        buf[0..8].copy_from_slice(&self.magic);
        buf[8] = self.version;
        buf[9..17].copy_from_slice(&self.oldest_seq.to_le_bytes());
        buf[17..25].copy_from_slice(&self.latest_seq.to_le_bytes());

        // CRC32 of the header fields, excluding the CRC itself
        let crc = crc32fast::hash(&buf[0..25]);
        buf[25..29].copy_from_slice(&crc.to_le_bytes());

        buf
    }

    fn from_bytes(buf: &[u8; WAL_HEADER_SIZE]) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        if &magic != WAL_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid WAL magic number",
            ));
        }

        let version = buf[8];
        if version != WAL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported WAL version: {version}"),
            ));
        }

        let oldest_seq = read_u64(&buf[9..17]);
        let latest_seq = read_u64(&buf[17..25]);
        let stored_crc = read_u32(&buf[25..29]);

        let computed_crc = crc32fast::hash(&buf[0..25]);
        if computed_crc != stored_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "WAL header CRC mismatch",
            ));
        }

        Ok(Self {
            magic,
            version,
            oldest_seq,
            latest_seq,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

impl WALJournal {
    /// Opens the log on `backend`, writing a fresh header if the backend holds
    /// less than a full header.
    ///
    /// `initial_oldest_seq` is the first sequence a fresh log expects, one past
    /// the primary file's checkpoint. A log shorter than its header cannot hold
    /// any entries, so it only ever comes from a crash while creating the file.
    pub(crate) fn new(
        backend: Arc<dyn StorageBackend>,
        initial_oldest_seq: u64,
    ) -> io::Result<Self> {
        let backend_len = backend.len()?;
        let header = if backend_len < WAL_HEADER_SIZE as u64 {
            let header = WALHeader::new(initial_oldest_seq);
            backend.set_len(0)?;
            backend.write(0, &header.to_bytes())?;
            backend.sync_data()?;
            header
        } else {
            let mut header_buf = [0u8; WAL_HEADER_SIZE];
            backend.read(0, &mut header_buf)?;
            WALHeader::from_bytes(&header_buf)?
        };

        let end = backend.len()?;
        Ok(Self {
            backend,
            state: Mutex::new(JournalState {
                end,
                oldest_seq: header.oldest_seq,
                latest_seq: header.latest_seq,
                synced_seq: header.latest_seq,
                failed: false,
            }),
        })
    }

    /// Appends a committed transaction and returns the new end of the log.
    ///
    /// With `sync`, the entry is durable when this returns. On any failure the
    /// log is cut back to its length before the call.
    pub(crate) fn append(&self, entry: &WALEntry, sync: bool) -> io::Result<u64> {
        let entry_data = entry.to_bytes();
        let total_len = u32::try_from(entry_data.len() + ENTRY_FRAMING).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "WAL entry exceeds the maximum frame size",
            )
        })?;

        let crc = crc32fast::hash(&entry_data);
        let mut wire_data = Vec::with_capacity(total_len as usize);
        wire_data.extend_from_slice(&total_len.to_le_bytes());
        wire_data.extend_from_slice(&entry_data);
        wire_data.extend_from_slice(&crc.to_le_bytes());

        let mut state = self.state.lock();
        if state.failed {
            return Err(io::Error::other(
                "WAL holds the frame of a failed append and must be truncated first",
            ));
        }
        let offset = state.end;
        let written = self.backend.write(offset, &wire_data).and_then(|()| {
            if sync {
                self.backend.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            // The frame may have been written whole before the sync failed,
            // and recovery would replay it. Until it is cut off nothing else
            // may be appended behind it.
            if let Err(_cut) = self.backend.set_len(offset) {
                #[cfg(feature = "logging")]
                log::error!("WAL could not drop a failed append at offset {offset}: {_cut}");
                state.failed = true;
            }
            return Err(e);
        }

        state.end = offset + wire_data.len() as u64;
        state.latest_seq = entry.sequence;
        if sync {
            state.synced_seq = entry.sequence;
        }
        Ok(state.end)
    }

    /// Makes every appended entry durable.
    pub(crate) fn sync(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.synced_seq == state.latest_seq {
            return Ok(());
        }
        self.backend.sync_data()?;
        state.synced_seq = state.latest_seq;
        Ok(())
    }

    /// Reads entries from the start of the log up to the first frame that is
    /// incomplete or fails its CRC.
    ///
    /// A frame that passes its CRC but cannot be decoded is an error: it was
    /// written whole, so the log itself is corrupt.
    pub(crate) fn scan(&self) -> io::Result<ScanResult> {
        let backend_len = self.backend.len()?;
        let mut offset = WAL_HEADER_SIZE as u64;
        let mut entries = Vec::new();

        loop {
            if offset + 4 > backend_len {
                break;
            }
            let mut len_buf = [0u8; 4];
            self.backend.read(offset, &mut len_buf)?;

            let total_len = u64::from(u32::from_le_bytes(len_buf));
            if total_len < ENTRY_FRAMING as u64 || offset + total_len > backend_len {
                break;
            }

            #[allow(clippy::cast_possible_truncation)]
            let mut entry_data = vec![0u8; total_len as usize - ENTRY_FRAMING];
            self.backend.read(offset + 4, &mut entry_data)?;

            let mut crc_buf = [0u8; 4];
            self.backend.read(offset + total_len - 4, &mut crc_buf)?;
            if crc32fast::hash(&entry_data) != u32::from_le_bytes(crc_buf) {
                break;
            }

            entries.push(WALEntry::from_bytes(&entry_data)?);
            offset += total_len;
        }

        Ok(ScanResult {
            entries,
            valid_end: offset,
            torn_bytes: backend_len - offset,
        })
    }

    /// Cuts the log back to `valid_end` after a scan found a torn tail.
    pub(crate) fn discard_tail(&self, valid_end: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        self.backend.set_len(valid_end)?;
        self.backend.sync_data()?;
        state.end = valid_end;
        Ok(())
    }

    /// Records the last sequence found by recovery.
    pub(crate) fn resume(&self, latest_seq: u64) {
        let mut state = self.state.lock();
        state.latest_seq = latest_seq;
        state.synced_seq = latest_seq;
    }

    /// Empties the log after a checkpoint covering everything before
    /// `new_oldest_seq`.
    pub(crate) fn truncate(&self, new_oldest_seq: u64) -> io::Result<()> {
        let mut state = self.state.lock();

        self.backend.set_len(WAL_HEADER_SIZE as u64)?;
        let header = WALHeader::new(new_oldest_seq);
        self.backend.write(0, &header.to_bytes())?;
        self.backend.sync_data()?;

        state.end = WAL_HEADER_SIZE as u64;
        state.oldest_seq = header.oldest_seq;
        state.latest_seq = header.latest_seq;
        state.synced_seq = header.latest_seq;
        state.failed = false;
        Ok(())
    }

    pub(crate) fn read_header(&self) -> io::Result<WALHeader> {
        let mut header_buf = [0u8; WAL_HEADER_SIZE];
        self.backend.read(0, &mut header_buf)?;
        WALHeader::from_bytes(&header_buf)
    }

    /// Bytes in the log, header included.
    pub(crate) fn file_size(&self) -> u64 {
        self.state.lock().end
    }

    /// True when the log holds no entries.
    pub(crate) fn is_empty(&self) -> bool {
        self.file_size() <= WAL_HEADER_SIZE as u64
    }

    /// First sequence the log header expects.
    pub(crate) fn oldest_seq(&self) -> u64 {
        self.state.lock().oldest_seq
    }

    /// True after an append failed and its frame could not be cut off.
    /// Appends are refused until [`truncate`](Self::truncate) succeeds.
    pub(crate) fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Syncs outstanding entries and releases the backend.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        self.sync()?;
        self.backend.close()
    }
}

impl Drop for WALJournal {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}
