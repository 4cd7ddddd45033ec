use crate::availability::{AvailabilityError, ByteRangeAvailability};
use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use thiserror::Error;
use vaultsync_proto::ContentHash;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("chunk {ct_hash} incomplete: {remaining} bytes missing")]
    Incomplete { ct_hash: ContentHash, remaining: u64 },
    #[error(transparent)]
    Range(#[from] AvailabilityError),
    #[error("read back {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("temporary storage: {0}")]
    Io(#[from] std::io::Error),
}

/// A chunk being assembled from blocks, backed by an anonymous temp file.
///
/// The file is removed by the OS once the buffer is dropped, whether the
/// chunk completes or the download is abandoned.
#[derive(Debug)]
pub struct PartialChunkBuffer {
    ct_hash: ContentHash,
    file: File,
    availability: ByteRangeAvailability,
}

impl PartialChunkBuffer {
    pub fn new(ct_hash: ContentHash, declared_size: u32) -> Result<Self, BufferError> {
        let file = tempfile::tempfile()?;
        file.set_len(declared_size as u64)?;
        Ok(Self { ct_hash, file, availability: ByteRangeAvailability::new(declared_size as u64) })
    }

    pub fn ct_hash(&self) -> &ContentHash {
        &self.ct_hash
    }

    pub fn size(&self) -> u64 {
        self.availability.size()
    }

    /// Store `data` at `offset`. Ranges outside the chunk or overlapping
    /// already-written bytes are rejected without touching the file.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), BufferError> {
        let mut probe = self.availability.clone();
        if !probe.insert(offset as u64, data.len() as u64)? {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(data)?;
        self.availability = probe;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.availability.is_full()
    }

    pub fn availability(&self) -> &ByteRangeAvailability {
        &self.availability
    }

    /// Read the assembled chunk back. Fails if any byte is still missing.
    pub fn finalize(&mut self) -> Result<Bytes, BufferError> {
        if !self.is_complete() {
            return Err(BufferError::Incomplete {
                ct_hash: self.ct_hash,
                remaining: self.availability.bytes_remaining(),
            });
        }
        let expected = self.availability.size();
        let mut out = Vec::with_capacity(expected as usize);
        self.file.seek(SeekFrom::Start(0))?;
        (&self.file).take(expected).read_to_end(&mut out)?;
        if out.len() as u64 != expected {
            return Err(BufferError::SizeMismatch { expected, actual: out.len() as u64 });
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_out_of_order_blocks() {
        let data: Vec<u8> = (0..100u8).collect();
        let hash = ContentHash::compute(&data);
        let mut buf = PartialChunkBuffer::new(hash, 100).unwrap();

        buf.write(80, &data[80..]).unwrap();
        buf.write(0, &data[..40]).unwrap();
        assert!(!buf.is_complete());
        assert!(matches!(buf.finalize(), Err(BufferError::Incomplete { remaining: 40, .. })));

        buf.write(40, &data[40..80]).unwrap();
        assert!(buf.is_complete());
        let out = buf.finalize().unwrap();
        assert_eq!(&out[..], &data[..]);
        assert!(hash.matches(&out));
    }

    #[test]
    fn rejects_overlap_and_overflow() {
        let mut buf = PartialChunkBuffer::new(ContentHash::compute(b"x"), 10).unwrap();
        buf.write(0, &[1; 5]).unwrap();
        assert!(matches!(buf.write(3, &[2; 4]), Err(BufferError::Range(_))));
        assert!(matches!(buf.write(8, &[2; 4]), Err(BufferError::Range(_))));
        assert_eq!(buf.availability().bytes_remaining(), 5);
    }

    #[test]
    fn zero_length_write_is_ignored() {
        let mut buf = PartialChunkBuffer::new(ContentHash::compute(b"x"), 10).unwrap();
        buf.write(4, &[]).unwrap();
        assert!(buf.availability().is_empty());
    }
}
