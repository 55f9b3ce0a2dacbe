use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

/// Size of the shared index file.
pub(crate) const SHM_SIZE: usize = 4096;

const SHM_MAGIC: &[u8; 8] = b"SESD-SHM";
const SHM_VERSION: u8 = 1;

const CHECKPOINT_SEQ: usize = 9;
const COMMITTED_SEQ: usize = 17;
const WAL_END: usize = 25;
const CONNECTIONS: usize = 33;
const CRC: usize = 37;

/// Values published through the shared index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ShmState {
    pub(crate) checkpoint_seq: u64,
    pub(crate) committed_seq: u64,
    pub(crate) wal_end: u64,
    pub(crate) connections: u32,
}

/// The memory-mapped `-shm` file.
///
/// Everything in it can be derived from the primary file and the log, so it
/// is rewritten from scratch on every open and never synced. Commits and
/// checkpoints publish their sequence numbers here; connections read the
/// committed sequence to tell whether a cached snapshot is still current.
///
/// Layout: magic (8) | version (1) | checkpoint_seq (u64) | committed_seq (u64)
/// | wal_end (u64) | connections (u32) | crc32 of the preceding bytes (u32).
pub(crate) struct ShmIndex {
    map: MmapMut,
    _file: File,
    state: ShmState,
}

impl ShmIndex {
    pub(crate) fn open(path: &Path, state: ShmState) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(SHM_SIZE as u64)?;

        // SAFETY: the file is private to the process holding the primary
        // lock, and it is sized before mapping.
        let map = unsafe { MmapOptions::new().len(SHM_SIZE).map_mut(&file)? };

        let mut index = Self {
            map,
            _file: file,
            state,
        };
        index.map.fill(0);
        index.publish(state);
        Ok(index)
    }

    /// Writes `state` into the mapping.
    pub(crate) fn publish(&mut self, state: ShmState) {
        let buf = &mut self.map[..];
        buf[0..8].copy_from_slice(SHM_MAGIC);
        buf[8] = SHM_VERSION;
        buf[CHECKPOINT_SEQ..COMMITTED_SEQ].copy_from_slice(&state.checkpoint_seq.to_le_bytes());
        buf[COMMITTED_SEQ..WAL_END].copy_from_slice(&state.committed_seq.to_le_bytes());
        buf[WAL_END..CONNECTIONS].copy_from_slice(&state.wal_end.to_le_bytes());
        buf[CONNECTIONS..CRC].copy_from_slice(&state.connections.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..CRC]);
        buf[CRC..CRC + 4].copy_from_slice(&crc.to_le_bytes());
        self.state = state;
    }

    pub(crate) fn record_commit(&mut self, committed_seq: u64, wal_end: u64) {
        self.publish(ShmState {
            committed_seq,
            wal_end,
            ..self.state
        });
    }

    pub(crate) fn record_checkpoint(&mut self, checkpoint_seq: u64, wal_end: u64) {
        self.publish(ShmState {
            checkpoint_seq,
            wal_end,
            ..self.state
        });
    }

    pub(crate) fn set_connections(&mut self, connections: u32) {
        self.publish(ShmState {
            connections,
            ..self.state
        });
    }

    /// Last committed sequence, read straight from the mapping.
    pub(crate) fn committed_seq(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.map[COMMITTED_SEQ..WAL_END]);
        u64::from_le_bytes(raw)
    }

    /// Decodes and validates the whole mapping.
    pub(crate) fn read(&self) -> io::Result<ShmState> {
        let buf = &self.map[..];
        if &buf[0..8] != SHM_MAGIC || buf[8] != SHM_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid shared index header",
            ));
        }
        let mut crc_raw = [0u8; 4];
        crc_raw.copy_from_slice(&buf[CRC..CRC + 4]);
        if crc32fast::hash(&buf[0..CRC]) != u32::from_le_bytes(crc_raw) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared index CRC mismatch",
            ));
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let mut connections = [0u8; 4];
        connections.copy_from_slice(&buf[CONNECTIONS..CRC]);

        Ok(ShmState {
            checkpoint_seq: u64_at(CHECKPOINT_SEQ),
            committed_seq: u64_at(COMMITTED_SEQ),
            wal_end: u64_at(WAL_END),
            connections: u32::from_le_bytes(connections),
        })
    }

    pub(crate) fn flush(&self) -> io::Result<()> {
        self.map.flush_async()
    }
}
