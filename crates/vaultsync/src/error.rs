use crate::availability::AvailabilityError;
use crate::handshake::HandshakeFailure;
use crate::partial::BufferError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeFailure),
    #[error("decode error: {0}")]
    Decode(#[from] vaultsync_proto::DecodeError),
    #[error("availability: {0}")]
    Availability(#[from] AvailabilityError),
    #[error("chunk buffer: {0}")]
    Buffer(#[from] BufferError),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Errors that end the peer link rather than the folder.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Handshake(_) | Self::Decode(_))
    }
}
