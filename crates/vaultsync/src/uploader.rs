use crate::peer::{MessageSink, Peer};
use crate::store::ChunkStore;
use tracing::{debug, warn};
use vaultsync_proto::{ContentHash, Message, MAX_FRAME_LEN};

/// Serves block requests. Unchokes whoever is interested.
#[derive(Debug, Default)]
pub struct Uploader {
    blocks_served: u64,
    bytes_served: u64,
}

impl Uploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks_served(&self) -> u64 {
        self.blocks_served
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served
    }

    pub fn handle_interested<S: MessageSink>(&mut self, peer: &Peer<S>) {
        peer.handle_interested();
        peer.unchoke();
    }

    pub fn handle_not_interested<S: MessageSink>(&mut self, peer: &Peer<S>) {
        peer.handle_not_interested();
        peer.choke();
    }

    /// Reply with `[offset, offset + size)` of a stored chunk. Requests from a
    /// choked or uninterested peer, and requests for data we lack, are
    /// dropped without closing the link.
    pub fn handle_block_request<S: MessageSink, St: ChunkStore>(
        &mut self,
        peer: &Peer<S>,
        store: &St,
        ct_hash: &ContentHash,
        offset: u32,
        size: u32,
    ) {
        if peer.am_choking() || !peer.peer_interested() {
            debug!(peer = %peer.id(), ct_hash = %ct_hash, offset, size, "Ignoring block request from choked peer");
            return;
        }
        if size == 0 || size as usize > MAX_FRAME_LEN / 2 {
            warn!(peer = %peer.id(), ct_hash = %ct_hash, offset, size, "Ignoring block request with unreasonable size");
            return;
        }

        match store.read_block(ct_hash, offset, size) {
            Ok(data) => {
                debug!(peer = %peer.id(), ct_hash = %ct_hash, offset, size, "==> BLOCK_REPLY");
                self.blocks_served += 1;
                self.bytes_served += data.len() as u64;
                peer.send(Message::BlockReply { ct_hash: *ct_hash, offset, data });
            }
            Err(e) => {
                warn!(peer = %peer.id(), ct_hash = %ct_hash, offset, size, error = %e, "Cannot serve block");
            }
        }
    }
}
