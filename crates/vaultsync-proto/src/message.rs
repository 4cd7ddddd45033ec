use crate::handshake::{Handshake, HandshakeError};
use crate::types::{
    Bitfield, ChunkDescriptor, ContentHash, Meta, MetaKind, PathId, PathRevision, SignedMeta, HASH_LEN, IV_LEN,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default block size for byte-range requests (32 KiB)
pub const BLOCK_SIZE: u32 = 32768;

/// Upper bound on a single frame, header excluded
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

const FRAME_HEADER_LEN: usize = 5;
const REVISION_LEN: usize = HASH_LEN + 8;

/// Peer protocol messages exchanged inside one folder swarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Authentication token plus informational client details
    Handshake(Handshake),
    /// We will not serve block requests
    Choke,
    /// We will serve block requests
    Unchoke,
    /// We want blocks the peer has
    Interested,
    /// We no longer want anything from the peer
    NotInterested,
    /// Announce a Meta revision and which of its chunks we hold
    HaveMeta { revision: PathRevision, bitfield: Bitfield },
    /// Announce a newly acquired chunk
    HaveChunk { ct_hash: ContentHash },
    /// Ask for a signed Meta
    MetaRequest { revision: PathRevision },
    /// Signed Meta plus our bitfield for it
    MetaReply { signed_meta: SignedMeta, bitfield: Bitfield },
    /// Ask for `[offset, offset + size)` of a chunk
    BlockRequest { ct_hash: ContentHash, offset: u32, size: u32 },
    /// Bytes for a previously requested range
    BlockReply { ct_hash: ContentHash, offset: u32, data: Bytes },
}

impl Message {
    pub fn type_id(&self) -> u8 {
        match self {
            Message::Handshake(_) => 0,
            Message::Choke => 1,
            Message::Unchoke => 2,
            Message::Interested => 3,
            Message::NotInterested => 4,
            Message::HaveMeta { .. } => 5,
            Message::HaveChunk { .. } => 6,
            Message::MetaRequest { .. } => 7,
            Message::MetaReply { .. } => 8,
            Message::BlockRequest { .. } => 9,
            Message::BlockReply { .. } => 10,
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Message::Handshake(_))
    }

    /// Encode message to a length-prefixed frame
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        match self {
            Message::Handshake(hs) => {
                body.reserve(hs.encoded_len());
                hs.encode_into(&mut body);
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::HaveMeta { revision, bitfield } => {
                put_revision(&mut body, revision);
                put_bitfield(&mut body, bitfield);
            }
            Message::HaveChunk { ct_hash } => {
                body.put_slice(ct_hash.as_bytes());
            }
            Message::MetaRequest { revision } => {
                put_revision(&mut body, revision);
            }
            Message::MetaReply { signed_meta, bitfield } => {
                put_signed_meta(&mut body, signed_meta);
                put_bitfield(&mut body, bitfield);
            }
            Message::BlockRequest { ct_hash, offset, size } => {
                body.put_slice(ct_hash.as_bytes());
                body.put_u32(*offset);
                body.put_u32(*size);
            }
            Message::BlockReply { ct_hash, offset, data } => {
                body.reserve(HASH_LEN + 4 + data.len());
                body.put_slice(ct_hash.as_bytes());
                body.put_u32(*offset);
                body.put_slice(data);
            }
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.put_u32(1 + body.len() as u32); // length
        buf.put_u8(self.type_id());
        buf.extend_from_slice(&body);
        buf
    }

    /// Decode message from bytes
    /// Returns (message, bytes_consumed) or None if more data needed
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, DecodeError> {
        if buf.len() < 4 {
            return Ok(None); // Need at least length prefix
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length == 0 {
            return Err(DecodeError::EmptyFrame);
        }
        if length > MAX_FRAME_LEN {
            return Err(DecodeError::FrameTooLarge(length));
        }
        let total_len = 4 + length;
        if buf.len() < total_len {
            return Ok(None); // Need more data
        }

        let msg_id = buf[4];
        let mut payload = &buf[FRAME_HEADER_LEN..total_len];

        let message = match msg_id {
            0 => Message::Handshake(Handshake::decode(payload)?),
            1 => Message::Choke,
            2 => Message::Unchoke,
            3 => Message::Interested,
            4 => Message::NotInterested,
            5 => {
                let revision = get_revision(&mut payload)?;
                let bitfield = get_bitfield(&mut payload)?;
                Message::HaveMeta { revision, bitfield }
            }
            6 => Message::HaveChunk { ct_hash: get_hash(&mut payload, "HaveChunk")? },
            7 => Message::MetaRequest { revision: get_revision(&mut payload)? },
            8 => {
                let signed_meta = get_signed_meta(&mut payload)?;
                let bitfield = get_bitfield(&mut payload)?;
                Message::MetaReply { signed_meta, bitfield }
            }
            9 => {
                let ct_hash = get_hash(&mut payload, "BlockRequest")?;
                ensure(&payload, 8, "BlockRequest")?;
                let offset = payload.get_u32();
                let size = payload.get_u32();
                Message::BlockRequest { ct_hash, offset, size }
            }
            10 => {
                let ct_hash = get_hash(&mut payload, "BlockReply")?;
                ensure(&payload, 4, "BlockReply")?;
                let offset = payload.get_u32();
                let data = Bytes::copy_from_slice(payload);
                Message::BlockReply { ct_hash, offset, data }
            }
            other => return Err(DecodeError::UnknownType(other)),
        };

        Ok(Some((message, total_len)))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("unknown message id: {0}")]
    UnknownType(u8),
    #[error("{0} message too short")]
    Truncated(&'static str),
    #[error("unknown meta kind: {0}")]
    MetaKind(u8),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
}

fn ensure(buf: &[u8], need: usize, what: &'static str) -> Result<(), DecodeError> {
    if buf.len() < need {
        return Err(DecodeError::Truncated(what));
    }
    Ok(())
}

fn get_hash(buf: &mut &[u8], what: &'static str) -> Result<ContentHash, DecodeError> {
    ensure(buf, HASH_LEN, what)?;
    let mut out = [0u8; HASH_LEN];
    buf.copy_to_slice(&mut out);
    Ok(ContentHash(out))
}

fn put_revision(buf: &mut BytesMut, revision: &PathRevision) {
    buf.put_slice(&revision.path_id.0);
    buf.put_i64(revision.revision);
}

fn get_revision(buf: &mut &[u8]) -> Result<PathRevision, DecodeError> {
    ensure(buf, REVISION_LEN, "PathRevision")?;
    let mut path_id = [0u8; HASH_LEN];
    buf.copy_to_slice(&mut path_id);
    let revision = buf.get_i64();
    Ok(PathRevision::new(PathId(path_id), revision))
}

fn put_bitfield(buf: &mut BytesMut, bitfield: &Bitfield) {
    buf.put_u32(bitfield.len() as u32);
    buf.put_slice(&bitfield.to_bytes());
}

fn get_bitfield(buf: &mut &[u8]) -> Result<Bitfield, DecodeError> {
    ensure(buf, 4, "Bitfield")?;
    let bits = buf.get_u32() as usize;
    let octets = (bits + 7) / 8;
    ensure(buf, octets, "Bitfield")?;
    let bitfield = Bitfield::from_bytes(&buf[..octets], bits);
    buf.advance(octets);
    Ok(bitfield)
}

fn put_signed_meta(buf: &mut BytesMut, smeta: &SignedMeta) {
    put_revision(buf, &smeta.meta.path_revision);
    buf.put_u8(smeta.meta.kind as u8);
    buf.put_u32(smeta.meta.chunks.len() as u32);
    for chunk in &smeta.meta.chunks {
        buf.put_slice(chunk.ct_hash.as_bytes());
        buf.put_u32(chunk.size);
        buf.put_slice(&chunk.iv);
    }
    buf.put_u32(smeta.signature.len() as u32);
    buf.put_slice(&smeta.signature);
}

fn get_signed_meta(buf: &mut &[u8]) -> Result<SignedMeta, DecodeError> {
    let path_revision = get_revision(buf)?;
    ensure(buf, 5, "MetaReply")?;
    let kind_raw = buf.get_u8();
    let kind = MetaKind::from_u8(kind_raw).ok_or(DecodeError::MetaKind(kind_raw))?;
    let count = buf.get_u32() as usize;
    ensure(buf, count.saturating_mul(HASH_LEN + 4 + IV_LEN), "MetaReply")?;
    let mut chunks = Vec::with_capacity(count);
    for _ in 0..count {
        let ct_hash = get_hash(buf, "MetaReply")?;
        let size = buf.get_u32();
        let mut iv = [0u8; IV_LEN];
        buf.copy_to_slice(&mut iv);
        chunks.push(ChunkDescriptor { ct_hash, size, iv });
    }
    ensure(buf, 4, "MetaReply")?;
    let sig_len = buf.get_u32() as usize;
    ensure(buf, sig_len, "MetaReply")?;
    let signature = Bytes::copy_from_slice(&buf[..sig_len]);
    buf.advance(sig_len);
    Ok(SignedMeta::new(Meta { path_revision, kind, chunks }, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{AuthToken, TOKEN_LEN};

    fn sample_meta() -> SignedMeta {
        let chunks = vec![
            ChunkDescriptor { ct_hash: ContentHash::compute(b"a"), size: 100, iv: [1u8; IV_LEN] },
            ChunkDescriptor { ct_hash: ContentHash::compute(b"b"), size: 64, iv: [2u8; IV_LEN] },
        ];
        let meta = Meta {
            path_revision: PathRevision::new(PathId([9u8; HASH_LEN]), 42),
            kind: MetaKind::File,
            chunks,
        };
        SignedMeta::new(meta, Bytes::from_static(b"signature"))
    }

    #[test]
    fn test_choke_frame_layout() {
        let encoded = Message::Choke.encode();
        assert_eq!(&encoded[..], &[0, 0, 0, 1, 1]);
        let (decoded, consumed) = Message::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, Message::Choke);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_block_request_frame_layout() {
        let msg = Message::BlockRequest { ct_hash: ContentHash([3u8; HASH_LEN]), offset: 32768, size: 32768 };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 4 + 1 + HASH_LEN + 8);
        let (decoded, consumed) = Message::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_meta_reply_carries_chunks_and_bitfield() {
        let msg = Message::MetaReply {
            signed_meta: sample_meta(),
            bitfield: Bitfield::from_bits(vec![true, false]),
        };
        let encoded = msg.encode();
        let (decoded, _) = Message::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_handshake_frame() {
        let msg = Message::Handshake(Handshake::new(AuthToken([5u8; TOKEN_LEN]), "node", "agent"));
        let encoded = msg.encode();
        let (decoded, _) = Message::decode(&encoded).unwrap().unwrap();
        assert!(decoded.is_handshake());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_partial_message() {
        let msg = Message::HaveChunk { ct_hash: ContentHash::compute(b"x") };
        let encoded = msg.encode();

        // Only send first 3 bytes
        assert!(Message::decode(&encoded[..3]).unwrap().is_none());
        // Header present, body cut short
        assert!(Message::decode(&encoded[..10]).unwrap().is_none());

        let (decoded, _) = Message::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = Message::Interested.encode();
        buf.extend_from_slice(&Message::Unchoke.encode());
        let (first, used) = Message::decode(&buf).unwrap().unwrap();
        assert_eq!(first, Message::Interested);
        let (second, _) = Message::decode(&buf[used..]).unwrap().unwrap();
        assert_eq!(second, Message::Unchoke);
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(Message::decode(&[0, 0, 0, 0]), Err(DecodeError::EmptyFrame));
        assert_eq!(Message::decode(&[0, 0, 0, 1, 77]), Err(DecodeError::UnknownType(77)));
        let short = [0, 0, 0, 3, 9, 1, 2];
        assert_eq!(Message::decode(&short), Err(DecodeError::Truncated("BlockRequest")));
        let huge = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(Message::decode(&huge), Err(DecodeError::FrameTooLarge(_))));
    }
}
