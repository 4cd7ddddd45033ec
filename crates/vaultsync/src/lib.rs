pub mod availability;
pub mod config;
pub mod downloader;
pub mod error;
pub mod folder;
pub mod handshake;
pub mod interest;
pub mod ledger;
pub mod meta;
pub mod net;
pub mod partial;
pub mod peer;
pub mod store;
pub mod uploader;

pub use availability::{AvailabilityError, ByteRangeAvailability};
pub use config::SyncConfig;
pub use downloader::{BlockOutcome, Downloader, FirstReady, PeerSelector};
pub use error::SyncError;
pub use folder::{FolderEvent, FolderGroup};
pub use handshake::{HandshakeFailure, HandshakeProtocol, HandshakeState};
pub use interest::InterestGuard;
pub use ledger::{BlockRequest, RequestLedger};
pub use meta::MetaExchange;
pub use net::{spawn_connection, ChannelSink};
pub use partial::{BufferError, PartialChunkBuffer};
pub use peer::{FlowControlState, MessageSink, Peer, PeerId, Role};
pub use store::{ChunkStore, MemoryStore, MetaStore, StoreError};
pub use uploader::Uploader;
