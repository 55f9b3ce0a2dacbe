use std::io;
use std::sync::Arc;

use crate::codec::{ByteReader, put_bytes, put_str, put_u32, put_u64};
use crate::record::Record;

const OP_PUT: u8 = 1;
const OP_REMOVE: u8 = 2;
const OP_REMOVE_ALL: u8 = 3;

/// One keyed change made by a write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Mutation {
    Put {
        collection: String,
        key: String,
        record: Arc<Record>,
    },
    Remove {
        collection: String,
        key: String,
    },
    RemoveAll {
        collection: String,
    },
}

impl Mutation {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Mutation::Put {
                collection,
                key,
                record,
            } => {
                buf.push(OP_PUT);
                put_str(buf, collection);
                put_str(buf, key);
                put_u32(buf, record.tag());
                put_bytes(buf, record.data());
            }
            Mutation::Remove { collection, key } => {
                buf.push(OP_REMOVE);
                put_str(buf, collection);
                put_str(buf, key);
            }
            Mutation::RemoveAll { collection } => {
                buf.push(OP_REMOVE_ALL);
                put_str(buf, collection);
            }
        }
    }

    fn deserialize_from(reader: &mut ByteReader<'_>) -> io::Result<Self> {
        let op = reader.u8("mutation kind")?;
        let collection = reader.string("collection name")?;
        match op {
            OP_PUT => {
                let key = reader.string("key")?;
                let tag = reader.u32("record tag")?;
                let data = reader.bytes("record data")?;
                Ok(Mutation::Put {
                    collection,
                    key,
                    record: Arc::new(Record::new(tag, data)),
                })
            }
            OP_REMOVE => Ok(Mutation::Remove {
                collection,
                key: reader.string("key")?,
            }),
            OP_REMOVE_ALL => Ok(Mutation::RemoveAll { collection }),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown mutation kind: {other}"),
            )),
        }
    }
}

/// A committed write transaction as recorded in the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WALEntry {
    /// Commit sequence number. Entries in the log are contiguous.
    pub(crate) sequence: u64,

    /// Mutations in the order the transaction performed them.
    pub(crate) mutations: Vec<Mutation>,
}

impl WALEntry {
    pub(crate) fn new(sequence: u64, mutations: Vec<Mutation>) -> Self {
        Self {
            sequence,
            mutations,
        }
    }

    /// Serializes the entry.
    ///
    /// Format:
    /// - sequence: u64 (8 bytes)
    /// - mutation_count: u32 (4 bytes)
    /// - mutations: kind (u8) followed by length-prefixed fields
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.sequence);
        #[allow(clippy::cast_possible_truncation)]
        put_u32(&mut buf, self.mutations.len() as u32);
        for mutation in &self.mutations {
            mutation.serialize_into(&mut buf);
        }
        buf
    }

    /// Deserializes an entry, rejecting trailing bytes.
    pub(crate) fn from_bytes(data: &[u8]) -> io::Result<Self> {
        let mut reader = ByteReader::new(data);
        let sequence = reader.u64("sequence")?;
        let count = reader.u32("mutation count")?;

        let mut mutations = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            mutations.push(Mutation::deserialize_from(&mut reader)?);
        }

        if !reader.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes after WAL entry",
            ));
        }

        Ok(Self {
            sequence,
            mutations,
        })
    }
}
