use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const TOKEN_LEN: usize = 32;
pub const DIGEST_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = 255;

const TOKEN_CONTEXT: &[u8] = b"vaultsync handshake token v1";

/// Digest of a node's connection identity (its TLS certificate, in practice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityDigest(pub [u8; DIGEST_LEN]);

impl IdentityDigest {
	pub fn random() -> Self {
		let mut out = [0u8; DIGEST_LEN];
		rand::thread_rng().fill_bytes(&mut out);
		Self(out)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthToken(pub [u8; TOKEN_LEN]);

/// Keyed one-way transform binding the folder secret to a connection identity.
/// Only holders of the same secret produce matching tokens for a digest.
pub fn derive_token(secret: &[u8], identity: &IdentityDigest) -> AuthToken {
	let mut hasher = Sha256::new();
	hasher.update(TOKEN_CONTEXT);
	hasher.update((secret.len() as u32).to_be_bytes());
	hasher.update(secret);
	hasher.update(identity.0);
	let mut out = [0u8; TOKEN_LEN];
	out.copy_from_slice(&hasher.finalize());
	AuthToken(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
	pub auth_token: AuthToken,
	pub device_name: String,
	pub user_agent: String,
}

impl Handshake {
	pub fn new(auth_token: AuthToken, device_name: impl Into<String>, user_agent: impl Into<String>) -> Self {
		Self {
			auth_token,
			device_name: device_name.into(),
			user_agent: user_agent.into(),
		}
	}

	pub fn encoded_len(&self) -> usize {
		TOKEN_LEN + 2 + self.device_name.len().min(MAX_NAME_LEN) + 2 + self.user_agent.len().min(MAX_NAME_LEN)
	}

	/// Append the handshake body (no frame header).
	pub fn encode_into(&self, buf: &mut BytesMut) {
		buf.extend_from_slice(&self.auth_token.0);
		put_short_str(buf, &self.device_name);
		put_short_str(buf, &self.user_agent);
	}

	pub fn decode(mut bytes: &[u8]) -> Result<Self, HandshakeError> {
		if bytes.len() < TOKEN_LEN {
			return Err(HandshakeError::Length(bytes.len()));
		}
		let mut token = [0u8; TOKEN_LEN];
		token.copy_from_slice(&bytes[..TOKEN_LEN]);
		bytes.advance(TOKEN_LEN);
		let device_name = get_short_str(&mut bytes)?;
		let user_agent = get_short_str(&mut bytes)?;
		Ok(Self {
			auth_token: AuthToken(token),
			device_name,
			user_agent,
		})
	}
}

fn put_short_str(buf: &mut BytesMut, s: &str) {
	let mut end = s.len().min(MAX_NAME_LEN);
	while !s.is_char_boundary(end) {
		end -= 1;
	}
	buf.put_u16(end as u16);
	buf.extend_from_slice(&s.as_bytes()[..end]);
}

fn get_short_str(bytes: &mut &[u8]) -> Result<String, HandshakeError> {
	if bytes.len() < 2 {
		return Err(HandshakeError::Length(bytes.len()));
	}
	let len = bytes.get_u16() as usize;
	if bytes.len() < len {
		return Err(HandshakeError::Length(bytes.len()));
	}
	let s = std::str::from_utf8(&bytes[..len]).map_err(|_| HandshakeError::Utf8)?.to_string();
	bytes.advance(len);
	Ok(s)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
	#[error("invalid handshake length: {0}")]
	Length(usize),
	#[error("handshake string is not valid utf-8")]
	Utf8,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tokens_depend_on_secret_and_identity() {
		let id_a = IdentityDigest([1u8; DIGEST_LEN]);
		let id_b = IdentityDigest([2u8; DIGEST_LEN]);
		assert_eq!(derive_token(b"secret", &id_a), derive_token(b"secret", &id_a));
		assert_ne!(derive_token(b"secret", &id_a), derive_token(b"secret", &id_b));
		assert_ne!(derive_token(b"secret", &id_a), derive_token(b"other", &id_a));
	}

	#[test]
	fn body_decodes() {
		let hs = Handshake::new(AuthToken([7u8; TOKEN_LEN]), "laptop", "vaultsync/0.1");
		let mut buf = BytesMut::new();
		hs.encode_into(&mut buf);
		assert_eq!(buf.len(), hs.encoded_len());
		assert_eq!(Handshake::decode(&buf).expect("decode"), hs);
	}

	#[test]
	fn truncated_body_is_rejected() {
		let hs = Handshake::new(AuthToken([7u8; TOKEN_LEN]), "laptop", "vaultsync/0.1");
		let mut buf = BytesMut::new();
		hs.encode_into(&mut buf);
		assert!(matches!(Handshake::decode(&buf[..TOKEN_LEN + 3]), Err(HandshakeError::Length(_))));
	}
}
