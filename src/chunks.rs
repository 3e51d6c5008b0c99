//! Pass-through storage for chunks the codec does not interpret.

use core::fmt;

use crate::abi;

/// Where a chunk sits relative to the palette and the image data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkLocation {
    /// After the header, before any palette.
    BeforePalette = abi::HAVE_IHDR,
    /// After the palette, before the image data.
    BeforeImageData = abi::HAVE_PLTE,
    /// After the image data.
    AfterImageData = abi::AFTER_IDAT,
}

impl ChunkLocation {
    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            abi::HAVE_IHDR => Some(Self::BeforePalette),
            abi::HAVE_PLTE => Some(Self::BeforeImageData),
            abi::AFTER_IDAT => Some(Self::AfterImageData),
            _ => None,
        }
    }

    pub(crate) fn raw(self) -> u8 {
        self as u8
    }
}

/// An unrecognized chunk, kept byte for byte.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    name: [u8; 4],
    /// Position the chunk is replayed at.
    pub location: ChunkLocation,
    /// Raw payload.
    pub data: Vec<u8>,
}

impl Chunk {
    /// Create a chunk. Returns `None` unless `name` is four ASCII letters.
    pub fn new(name: [u8; 4], location: ChunkLocation, data: Vec<u8>) -> Option<Self> {
        is_chunk_name(&name).then_some(Self {
            name,
            location,
            data,
        })
    }

    /// Four-letter chunk type.
    pub fn name(&self) -> [u8; 4] {
        self.name
    }

    /// Chunk type as text.
    pub fn name_str(&self) -> &str {
        // Letters only, checked on construction.
        core::str::from_utf8(&self.name).unwrap_or("????")
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("name", &self.name_str())
            .field("location", &self.location)
            .field("len", &self.data.len())
            .finish()
    }
}

pub(crate) fn is_chunk_name(name: &[u8]) -> bool {
    name.len() == 4 && name.iter().all(u8::is_ascii_alphabetic)
}

/// Ordered collection of pass-through chunks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, keeping insertion order.
    pub fn push(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Chunks at `location`, in insertion order.
    pub fn at(&self, location: ChunkLocation) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(move |c| c.location == location)
    }
}

impl FromIterator<Chunk> for ChunkStore {
    fn from_iter<I: IntoIterator<Item = Chunk>>(iter: I) -> Self {
        Self {
            chunks: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ChunkStore {
    type Item = &'a Chunk;
    type IntoIter = core::slice::Iter<'a, Chunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_must_be_letters() {
        assert!(Chunk::new(*b"teXt", ChunkLocation::BeforePalette, vec![]).is_some());
        assert!(Chunk::new(*b"te t", ChunkLocation::BeforePalette, vec![]).is_none());
        assert!(Chunk::new(*b"1234", ChunkLocation::BeforePalette, vec![]).is_none());
    }

    #[test]
    fn store_keeps_order_and_filters_by_location() {
        let mut store = ChunkStore::new();
        for (name, loc) in [
            (*b"aaAa", ChunkLocation::AfterImageData),
            (*b"bbBb", ChunkLocation::BeforePalette),
            (*b"ccCc", ChunkLocation::AfterImageData),
        ] {
            store.push(Chunk::new(name, loc, vec![1]).unwrap());
        }
        let after: Vec<_> = store
            .at(ChunkLocation::AfterImageData)
            .map(Chunk::name)
            .collect();
        assert_eq!(after, [*b"aaAa", *b"ccCc"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn location_codes() {
        for loc in [
            ChunkLocation::BeforePalette,
            ChunkLocation::BeforeImageData,
            ChunkLocation::AfterImageData,
        ] {
            assert_eq!(ChunkLocation::from_raw(loc.raw()), Some(loc));
        }
        assert_eq!(ChunkLocation::from_raw(4), None);
    }
}
