use std::io;
use std::sync::Arc;

use super::snapshot::Snapshot;
use crate::backend::StorageBackend;

/// Magic number identifying a session store file.
///
/// The sequence includes DOS/Unix line ending detection bytes (0x1A, 0x0A) to help
/// detect text-mode corruption.
pub const MAGIC_NUMBER: [u8; 9] = *b"sesd-db\x1A\x0A";

/// Current format version of the primary file.
pub const FORMAT_VERSION: u8 = 1;

/// Size of one page in bytes (4KB).
///
/// The header with both checkpoint slots fits within a single page; images
/// are written after it.
pub(crate) const PAGE_SIZE: usize = 4096;

const VERSION_OFFSET: usize = 9;
const SLOT_SIZE: usize = 32;
const SLOT_OFFSETS: [usize; 2] = [16, 48];

/// One of the two checkpoint records in the header page.
///
/// Format: `checkpoint_seq` (u64) | `image_offset` (u64) | `image_len` (u64)
/// | `image_crc` (u32) | `slot_crc` (u32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CheckpointSlot {
    pub(crate) checkpoint_seq: u64,
    pub(crate) image_offset: u64,
    pub(crate) image_len: u64,
    pub(crate) image_crc: u32,
}

impl CheckpointSlot {
    /// The slot of a store that has never been checkpointed.
    fn empty() -> Self {
        Self {
            checkpoint_seq: 0,
            image_offset: PAGE_SIZE as u64,
            image_len: 0,
            image_crc: crc32fast::hash(&[]),
        }
    }

    fn end(&self) -> u64 {
        self.image_offset + self.image_len
    }

    fn to_bytes(self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[0..8].copy_from_slice(&self.checkpoint_seq.to_le_bytes());
        buf[8..16].copy_from_slice(&self.image_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.image_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.image_crc.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..28]);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Returns `None` if the slot fails its own CRC, as it does after a torn
    /// header write.
    fn from_bytes(buf: &[u8]) -> Option<Self> {
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let u32_at = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&buf[at..at + 4]);
            u32::from_le_bytes(raw)
        };

        if crc32fast::hash(&buf[0..28]) != u32_at(28) {
            return None;
        }
        Some(Self {
            checkpoint_seq: u64_at(0),
            image_offset: u64_at(8),
            image_len: u64_at(16),
            image_crc: u32_at(24),
        })
    }
}

fn fresh_header_page() -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    page[0..VERSION_OFFSET].copy_from_slice(&MAGIC_NUMBER);
    page[VERSION_OFFSET] = FORMAT_VERSION;
    let empty = CheckpointSlot::empty().to_bytes();
    for offset in SLOT_OFFSETS {
        page[offset..offset + SLOT_SIZE].copy_from_slice(&empty);
    }
    page
}

/// The primary store file: a header page with two checkpoint slots, followed
/// by checkpoint images.
///
/// A checkpoint writes a complete image of the store into space the live
/// image does not occupy, syncs it, and only then overwrites the older of the
/// two slots to point at it. A crash at any step leaves at least one slot
/// describing an intact image. On open the valid slot with the highest
/// sequence wins.
pub(crate) struct PrimaryFile {
    backend: Arc<dyn StorageBackend>,
    live: CheckpointSlot,
    live_index: usize,
}

impl PrimaryFile {
    /// Opens the primary file and loads the image of its newest valid
    /// checkpoint.
    ///
    /// An empty file, or one holding only part of a fresh header page (a crash
    /// during creation), is initialized as an empty store.
    pub(crate) fn open(backend: Arc<dyn StorageBackend>) -> io::Result<(Self, Snapshot)> {
        let file_len = backend.len()?;
        let fresh = fresh_header_page();

        if file_len < PAGE_SIZE as u64 {
            #[allow(clippy::cast_possible_truncation)]
            let mut existing = vec![0u8; file_len as usize];
            backend.read(0, &mut existing)?;
            if !fresh.starts_with(&existing) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("primary file truncated to {file_len} bytes"),
                ));
            }
            backend.write(0, &fresh)?;
            backend.sync_data()?;
            let primary = Self {
                backend,
                live: CheckpointSlot::empty(),
                live_index: 0,
            };
            return Ok((primary, Snapshot::default()));
        }

        let mut page = vec![0u8; PAGE_SIZE];
        backend.read(0, &mut page)?;
        if page[0..VERSION_OFFSET] != MAGIC_NUMBER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid magic number",
            ));
        }
        if page[VERSION_OFFSET] != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported format version: {}", page[VERSION_OFFSET]),
            ));
        }

        let mut candidates: Vec<(usize, CheckpointSlot)> = SLOT_OFFSETS
            .iter()
            .enumerate()
            .filter_map(|(index, &offset)| {
                CheckpointSlot::from_bytes(&page[offset..offset + SLOT_SIZE])
                    .map(|slot| (index, slot))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.checkpoint_seq.cmp(&a.1.checkpoint_seq));

        for (index, slot) in candidates {
            if let Some(snapshot) = Self::load_image(backend.as_ref(), &slot, file_len)? {
                let primary = Self {
                    backend,
                    live: slot,
                    live_index: index,
                };
                return Ok((primary, snapshot));
            }
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no valid checkpoint slot in primary file",
        ))
    }

    /// Reads and decodes the image a slot points at. `None` if the image is
    /// missing or fails its CRC.
    fn load_image(
        backend: &dyn StorageBackend,
        slot: &CheckpointSlot,
        file_len: u64,
    ) -> io::Result<Option<Snapshot>> {
        if slot.image_offset < PAGE_SIZE as u64 || slot.end() > file_len {
            return Ok(None);
        }
        let Ok(image_len) = usize::try_from(slot.image_len) else {
            return Ok(None);
        };

        let mut image = vec![0u8; image_len];
        backend.read(slot.image_offset, &mut image)?;
        if crc32fast::hash(&image) != slot.image_crc {
            return Ok(None);
        }

        Snapshot::decode_image(slot.checkpoint_seq, &image).map(Some)
    }

    /// Sequence of the newest durable checkpoint.
    pub(crate) fn checkpoint_seq(&self) -> u64 {
        self.live.checkpoint_seq
    }

    /// Bytes used by the header page and the live image.
    pub(crate) fn file_size(&self) -> u64 {
        self.live.end()
    }

    /// Durably replaces the live image with an image of `snapshot`.
    pub(crate) fn write_image(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        let image = snapshot.encode_image();
        let image_len = image.len() as u64;

        // Before the live image if there is room, otherwise right after it
        let image_offset = if PAGE_SIZE as u64 + image_len <= self.live.image_offset {
            PAGE_SIZE as u64
        } else {
            self.live.end().max(PAGE_SIZE as u64)
        };

        self.backend.write(image_offset, &image)?;
        self.backend.sync_data()?;

        let slot = CheckpointSlot {
            checkpoint_seq: snapshot.sequence(),
            image_offset,
            image_len,
            image_crc: crc32fast::hash(&image),
        };
        let target = 1 - self.live_index;
        self.backend
            .write(SLOT_OFFSETS[target] as u64, &slot.to_bytes())?;
        self.backend.sync_data()?;

        self.live = slot;
        self.live_index = target;

        // The previous image is no longer referenced by the winning slot
        self.backend.set_len(slot.end())?;
        self.backend.sync_data()
    }

    /// Releases the exclusive lock on the file.
    pub(crate) fn close(&self) -> io::Result<()> {
        self.backend.close()
    }
}
