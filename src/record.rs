/// An opaque value stored under a key.
///
/// The store never looks inside `data`. The `tag` is a caller-defined type
/// discriminator (for example "session record v3" vs. "identity key"), kept
/// alongside the bytes so the caller can pick a decoder without parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    tag: u32,
    data: Vec<u8>,
}

impl Record {
    pub fn new(tag: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            data: data.into(),
        }
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
