pub mod handshake;
pub mod message;
pub mod types;

pub use handshake::{
	derive_token,
	AuthToken,
	Handshake,
	HandshakeError,
	IdentityDigest,
	DIGEST_LEN,
	TOKEN_LEN,
};

pub use message::{DecodeError, Message, BLOCK_SIZE, MAX_FRAME_LEN};

pub use types::{
	Bitfield,
	ChunkDescriptor,
	ContentHash,
	Meta,
	MetaKind,
	PathId,
	PathRevision,
	SignedMeta,
	HASH_LEN,
	IV_LEN,
};
