use crate::peer::Role;
use thiserror::Error;
use vaultsync_proto::{derive_token, AuthToken, Handshake, IdentityDigest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeFailure {
	#[error("authentication token does not match the folder secret")]
	InvalidToken,
	#[error("received a handshake before sending ours")]
	Ordering,
	#[error("unexpected handshake after the exchange finished")]
	Unexpected,
	#[error("message type {0} arrived before authentication")]
	Expected(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
	Idle,
	LocalSent,
	Authenticated,
	Failed,
}

/// Mutual authentication of one link.
///
/// Both sides derive tokens from the shared folder secret and the sender's
/// identity digest. The initiator speaks first; the responder answers only a
/// valid handshake.
#[derive(Debug, Clone)]
pub struct HandshakeProtocol {
	role: Role,
	local_token: AuthToken,
	expected_token: AuthToken,
	device_name: String,
	user_agent: String,
	sent: bool,
	received: bool,
	failed: bool,
}

impl HandshakeProtocol {
	pub fn new(
		secret: &[u8],
		role: Role,
		local: &IdentityDigest,
		remote: &IdentityDigest,
		device_name: impl Into<String>,
		user_agent: impl Into<String>,
	) -> Self {
		Self {
			role,
			local_token: derive_token(secret, local),
			expected_token: derive_token(secret, remote),
			device_name: device_name.into(),
			user_agent: user_agent.into(),
			sent: false,
			received: false,
			failed: false,
		}
	}

	pub fn role(&self) -> Role {
		self.role
	}

	pub fn state(&self) -> HandshakeState {
		if self.failed {
			HandshakeState::Failed
		} else if self.sent && self.received {
			HandshakeState::Authenticated
		} else if self.sent {
			HandshakeState::LocalSent
		} else {
			HandshakeState::Idle
		}
	}

	pub fn is_authenticated(&self) -> bool {
		self.state() == HandshakeState::Authenticated
	}

	/// Called once the transport is up. Yields our handshake if we are the
	/// initiator.
	pub fn start(&mut self) -> Option<Handshake> {
		if self.role == Role::Initiator && !self.sent && !self.failed {
			Some(self.local_handshake())
		} else {
			None
		}
	}

	/// Process the remote handshake. On success the responder gets its reply
	/// back; on failure the link must be closed.
	pub fn receive(&mut self, hs: &Handshake) -> Result<Option<Handshake>, HandshakeFailure> {
		if self.failed || self.received {
			self.failed = true;
			return Err(HandshakeFailure::Unexpected);
		}
		if self.role == Role::Initiator && !self.sent {
			self.failed = true;
			return Err(HandshakeFailure::Ordering);
		}
		if hs.auth_token != self.expected_token {
			self.failed = true;
			return Err(HandshakeFailure::InvalidToken);
		}
		self.received = true;

		if self.sent {
			Ok(None)
		} else {
			Ok(Some(self.local_handshake()))
		}
	}

	fn local_handshake(&mut self) -> Handshake {
		self.sent = true;
		Handshake::new(self.local_token, self.device_name.clone(), self.user_agent.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECRET: &[u8] = b"shared secret";

	fn pair() -> (HandshakeProtocol, HandshakeProtocol) {
		let a = IdentityDigest([1; 32]);
		let b = IdentityDigest([2; 32]);
		(
			HandshakeProtocol::new(SECRET, Role::Initiator, &a, &b, "alice", "ua"),
			HandshakeProtocol::new(SECRET, Role::Responder, &b, &a, "bob", "ua"),
		)
	}

	#[test]
	fn initiator_and_responder_authenticate() {
		let (mut client, mut server) = pair();
		assert_eq!(server.start(), None);

		let hello = client.start().unwrap();
		assert_eq!(client.state(), HandshakeState::LocalSent);

		let reply = server.receive(&hello).unwrap().unwrap();
		assert!(server.is_authenticated());
		assert_eq!(reply.device_name, "bob");

		assert_eq!(client.receive(&reply), Ok(None));
		assert!(client.is_authenticated());
	}

	#[test]
	fn wrong_secret_is_rejected_without_reply() {
		let a = IdentityDigest([1; 32]);
		let b = IdentityDigest([2; 32]);
		let mut client = HandshakeProtocol::new(b"other secret", Role::Initiator, &a, &b, "mallory", "ua");
		let mut server = HandshakeProtocol::new(SECRET, Role::Responder, &b, &a, "bob", "ua");

		let hello = client.start().unwrap();
		assert_eq!(server.receive(&hello), Err(HandshakeFailure::InvalidToken));
		assert_eq!(server.state(), HandshakeState::Failed);
		assert!(!server.is_authenticated());
	}

	#[test]
	fn initiator_rejects_handshake_before_sending() {
		let (mut client, mut server) = pair();
		let mut other = client.clone();
		let hello = other.start().unwrap();
		let reply = server.receive(&hello).unwrap().unwrap();

		assert_eq!(client.receive(&reply), Err(HandshakeFailure::Ordering));
		assert_eq!(client.state(), HandshakeState::Failed);
	}

	#[test]
	fn second_handshake_is_unexpected() {
		let (mut client, mut server) = pair();
		let hello = client.start().unwrap();
		server.receive(&hello).unwrap();
		assert_eq!(server.receive(&hello), Err(HandshakeFailure::Unexpected));
	}
}
