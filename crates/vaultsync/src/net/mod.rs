// Byte-stream plumbing between a transport and a folder's event loop.
pub mod connection;
pub mod framing;

pub use connection::{spawn_connection, ChannelSink};
pub use framing::{dial, write_message, FrameReader, TransportStream};
