use crate::error::SyncError;
use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use vaultsync_proto::Message;

/// Any byte stream a link can run over (TCP, TLS, in-memory pipe).
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub async fn dial(addr: SocketAddr) -> io::Result<TcpStream> {
	let stream = TcpStream::connect(addr).await?;
	stream.set_nodelay(true)?;
	Ok(stream)
}

/// Reassembles length-prefixed frames from a byte stream.
pub struct FrameReader<R> {
	inner: R,
	buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
	pub fn new(inner: R) -> Self {
		Self { inner, buf: BytesMut::with_capacity(64 * 1024) }
	}

	/// Next complete message, or `None` on a clean end of stream.
	/// Cancel-safe: partially read frames stay buffered.
	pub async fn next_message(&mut self) -> Result<Option<Message>, SyncError> {
		loop {
			if let Some((message, consumed)) = Message::decode(&self.buf)? {
				self.buf.advance(consumed);
				return Ok(Some(message));
			}
			if self.inner.read_buf(&mut self.buf).await? == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a frame").into());
			}
		}
	}
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> io::Result<()> {
	writer.write_all(&message.encode()).await?;
	writer.flush().await
}
