use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;
use vaultsync_proto::{Bitfield, ContentHash, PathId, PathRevision, SignedMeta};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no meta stored for {0}")]
    MetaNotFound(PathRevision),
    #[error("no chunk stored for {0}")]
    ChunkNotFound(ContentHash),
    #[error("range [{offset}, +{size}) outside chunk {ct_hash} of {chunk_size} bytes")]
    RangeNotFound { ct_hash: ContentHash, offset: u32, size: u32, chunk_size: u32 },
    #[error("content does not hash to {expected}")]
    HashMismatch { expected: ContentHash },
    #[error("meta {0} is not newer than the stored revision")]
    Outdated(PathRevision),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::MetaNotFound(_) | Self::ChunkNotFound(_) | Self::RangeNotFound { .. })
    }
}

/// Signed, versioned metadata keyed by path.
pub trait MetaStore {
    fn get_meta(&self, revision: &PathRevision) -> Result<SignedMeta, StoreError>;

    /// Exactly this revision is stored.
    fn have_meta(&self, revision: &PathRevision) -> bool;

    /// Storing `revision` would advance its path: nothing is stored for the
    /// path yet, or the stored revision is strictly older.
    fn put_allowed(&self, revision: &PathRevision) -> bool;

    fn put_meta(&mut self, meta: SignedMeta) -> Result<(), StoreError>;

    /// Latest meta of every path, announced to freshly authenticated peers.
    fn all_metas(&self) -> Vec<SignedMeta>;
}

/// Content-addressed encrypted chunks.
pub trait ChunkStore {
    /// Persist `data` after checking it hashes to `ct_hash`.
    fn put_chunk(&mut self, ct_hash: &ContentHash, data: Bytes) -> Result<(), StoreError>;

    fn get_chunk(&self, ct_hash: &ContentHash) -> Result<Bytes, StoreError>;

    fn have_chunk(&self, ct_hash: &ContentHash) -> bool;

    fn get_chunk_size(&self, ct_hash: &ContentHash) -> Result<u32, StoreError> {
        self.get_chunk(ct_hash).map(|c| c.len() as u32)
    }

    fn read_block(&self, ct_hash: &ContentHash, offset: u32, size: u32) -> Result<Bytes, StoreError> {
        let chunk = self.get_chunk(ct_hash)?;
        let start = offset as usize;
        let end = start.checked_add(size as usize).filter(|&end| end <= chunk.len());
        match end {
            Some(end) => Ok(chunk.slice(start..end)),
            None => Err(StoreError::RangeNotFound { ct_hash: *ct_hash, offset, size, chunk_size: chunk.len() as u32 }),
        }
    }

    /// One bit per chunk of `meta`, set where the chunk is stored locally.
    fn make_bitfield(&self, meta: &SignedMeta) -> Bitfield {
        Bitfield::from_bits(meta.chunks().iter().map(|c| self.have_chunk(&c.ct_hash)).collect())
    }
}

/// In-memory store holding the latest meta per path and every chunk.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    metas: HashMap<PathId, SignedMeta>,
    chunks: HashMap<ContentHash, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meta_count(&self) -> usize {
        self.metas.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Latest stored revision for a path.
    pub fn revision_of(&self, path_id: &PathId) -> Option<i64> {
        self.metas.get(path_id).map(SignedMeta::revision)
    }
}

impl MetaStore for MemoryStore {
    fn get_meta(&self, revision: &PathRevision) -> Result<SignedMeta, StoreError> {
        self.metas
            .get(&revision.path_id)
            .filter(|m| m.revision() == revision.revision)
            .cloned()
            .ok_or(StoreError::MetaNotFound(*revision))
    }

    fn have_meta(&self, revision: &PathRevision) -> bool {
        self.metas.get(&revision.path_id).map_or(false, |m| m.revision() == revision.revision)
    }

    fn put_allowed(&self, revision: &PathRevision) -> bool {
        self.metas.get(&revision.path_id).map_or(true, |m| m.revision() < revision.revision)
    }

    fn put_meta(&mut self, meta: SignedMeta) -> Result<(), StoreError> {
        let revision = meta.path_revision();
        if !self.put_allowed(&revision) {
            return Err(StoreError::Outdated(revision));
        }
        debug!(revision = %revision, chunks = meta.chunks().len(), "Storing meta");
        self.metas.insert(revision.path_id, meta);
        Ok(())
    }

    fn all_metas(&self) -> Vec<SignedMeta> {
        self.metas.values().cloned().collect()
    }
}

impl ChunkStore for MemoryStore {
    fn put_chunk(&mut self, ct_hash: &ContentHash, data: Bytes) -> Result<(), StoreError> {
        if !ct_hash.matches(&data) {
            return Err(StoreError::HashMismatch { expected: *ct_hash });
        }
        self.chunks.insert(*ct_hash, data);
        Ok(())
    }

    fn get_chunk(&self, ct_hash: &ContentHash) -> Result<Bytes, StoreError> {
        self.chunks.get(ct_hash).cloned().ok_or(StoreError::ChunkNotFound(*ct_hash))
    }

    fn have_chunk(&self, ct_hash: &ContentHash) -> bool {
        self.chunks.contains_key(ct_hash)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use vaultsync_proto::{ChunkDescriptor, Meta, MetaKind};

    pub fn path(n: u8) -> PathId {
        PathId([n; 28])
    }

    pub fn descriptor(data: &[u8]) -> ChunkDescriptor {
        ChunkDescriptor { ct_hash: ContentHash::compute(data), size: data.len() as u32, iv: [0; 16] }
    }

    pub fn signed_meta(path_id: PathId, revision: i64, chunks: &[&[u8]]) -> SignedMeta {
        let meta = Meta {
            path_revision: PathRevision::new(path_id, revision),
            kind: MetaKind::File,
            chunks: chunks.iter().map(|c| descriptor(c)).collect(),
        };
        SignedMeta::new(meta, Bytes::from_static(b"sig"))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn put_allowed_is_strictly_monotonic() {
        let mut store = MemoryStore::new();
        let rev5 = PathRevision::new(path(1), 5);
        assert!(store.put_allowed(&rev5));
        store.put_meta(signed_meta(path(1), 5, &[])).unwrap();

        assert!(store.have_meta(&rev5));
        assert!(!store.put_allowed(&rev5));
        assert!(!store.put_allowed(&PathRevision::new(path(1), 4)));
        assert!(store.put_allowed(&PathRevision::new(path(1), 6)));
        assert!(store.put_allowed(&PathRevision::new(path(2), 1)));

        let err = store.put_meta(signed_meta(path(1), 3, &[])).unwrap_err();
        assert!(matches!(err, StoreError::Outdated(_)));
        assert_eq!(store.revision_of(&path(1)), Some(5));
    }

    #[test]
    fn missing_entries_are_not_found() {
        let store = MemoryStore::new();
        assert!(store.get_meta(&PathRevision::new(path(1), 1)).unwrap_err().is_not_found());
        assert!(store.get_chunk(&ContentHash::compute(b"x")).unwrap_err().is_not_found());
    }

    #[test]
    fn chunk_is_verified_and_sliced() {
        let mut store = MemoryStore::new();
        let data = Bytes::from_static(b"0123456789");
        let hash = ContentHash::compute(&data);

        let err = store.put_chunk(&hash, Bytes::from_static(b"tampered!!")).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        assert!(!store.have_chunk(&hash));

        store.put_chunk(&hash, data).unwrap();
        assert_eq!(store.get_chunk_size(&hash).unwrap(), 10);
        assert_eq!(&store.read_block(&hash, 2, 3).unwrap()[..], b"234");
        assert!(store.read_block(&hash, 8, 3).unwrap_err().is_not_found());
    }

    #[test]
    fn bitfield_reflects_local_chunks() {
        let mut store = MemoryStore::new();
        let meta = signed_meta(path(1), 1, &[b"a", b"b", b"c"]);
        store.put_chunk(&ContentHash::compute(b"b"), Bytes::from_static(b"b")).unwrap();
        assert_eq!(store.make_bitfield(&meta), Bitfield::from_bits(vec![false, true, false]));
    }
}
