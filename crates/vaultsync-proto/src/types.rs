use bytes::Bytes;
use sha2::{Digest, Sha224};
use std::fmt;

/// Width of content hashes and path ids (SHA-224 output).
pub const HASH_LEN: usize = 28;
/// Width of the per-chunk AES initialisation vector.
pub const IV_LEN: usize = 16;

/// Content hash of an encrypted chunk ("ct_hash").
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; HASH_LEN]);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha224::digest(data);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", hex::encode(&self.0[..8]))
    }
}

/// Keyed hash of a normalized path; stable across revisions of the same file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub [u8; HASH_LEN]);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", hex::encode(&self.0[..8]))
    }
}

/// One point in a path's metadata lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathRevision {
    pub path_id: PathId,
    pub revision: i64,
}

impl PathRevision {
    pub fn new(path_id: PathId, revision: i64) -> Self {
        Self { path_id, revision }
    }
}

impl fmt::Display for PathRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode(&self.path_id.0[..8]), self.revision)
    }
}

/// Content-addressed reference to one encrypted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    pub ct_hash: ContentHash,
    pub size: u32,
    pub iv: [u8; IV_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    File = 0,
    Directory = 1,
    Symlink = 2,
    Deleted = 255,
}

impl MetaKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MetaKind::File),
            1 => Some(MetaKind::Directory),
            2 => Some(MetaKind::Symlink),
            255 => Some(MetaKind::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub path_revision: PathRevision,
    pub kind: MetaKind,
    pub chunks: Vec<ChunkDescriptor>,
}

/// Meta plus the signature produced by the holder of the write key.
/// The engine never checks the signature; the metadata layer does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMeta {
    pub meta: Meta,
    pub signature: Bytes,
}

impl SignedMeta {
    pub fn new(meta: Meta, signature: Bytes) -> Self {
        Self { meta, signature }
    }

    pub fn path_revision(&self) -> PathRevision {
        self.meta.path_revision
    }

    pub fn revision(&self) -> i64 {
        self.meta.path_revision.revision
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.meta.chunks
    }
}

/// One bit per chunk of a Meta's chunk list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<bool>);

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self(vec![false; len])
    }

    pub fn full(len: usize) -> Self {
        Self(vec![true; len])
    }

    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self(bits)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> bool {
        self.0.get(idx).copied().unwrap_or(false)
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if let Some(bit) = self.0.get_mut(idx) {
            *bit = value;
        }
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().filter(|&&b| b).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.0.iter().copied()
    }

    /// Truncate or zero-extend to `len` bits. Packed bitfields arrive rounded
    /// up to whole octets.
    pub fn resized(mut self, len: usize) -> Self {
        self.0.resize(len, false);
        self
    }

    /// Pack MSB-first, the BitTorrent way.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; (self.0.len() + 7) / 8];
        for (i, &b) in self.0.iter().enumerate() {
            if b {
                out[i / 8] |= 1u8 << (7 - (i % 8));
            }
        }
        out
    }

    pub fn from_bytes(data: &[u8], len: usize) -> Self {
        let mut bits = vec![false; len];
        for (idx, bit) in bits.iter_mut().enumerate() {
            if let Some(byte) = data.get(idx / 8) {
                *bit = byte & (1u8 << (7 - (idx % 8))) != 0;
            }
        }
        Self(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_matches_own_data() {
        let hash = ContentHash::compute(b"ciphertext");
        assert!(hash.matches(b"ciphertext"));
        assert!(!hash.matches(b"ciphertexT"));
    }

    #[test]
    fn bitfield_packs_msb_first() {
        let bf = Bitfield::from_bits(vec![true, false, false, false, false, false, false, true, true]);
        assert_eq!(bf.to_bytes(), vec![0x81, 0x80]);
        let back = Bitfield::from_bytes(&[0x81, 0x80], 9);
        assert_eq!(back, bf);
    }

    #[test]
    fn bitfield_resize_drops_octet_padding() {
        let padded = Bitfield::from_bytes(&[0xFF], 8);
        let trimmed = padded.resized(3);
        assert_eq!(trimmed.len(), 3);
        assert_eq!(trimmed.count_ones(), 3);
    }
}
