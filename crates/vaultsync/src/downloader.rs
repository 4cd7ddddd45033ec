use crate::availability::ByteRangeAvailability;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::interest::InterestGuard;
use crate::ledger::{BlockRequest, RequestLedger};
use crate::partial::PartialChunkBuffer;
use crate::peer::{MessageSink, Peer, PeerId};
use crate::store::{ChunkStore, StoreError};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};
use vaultsync_proto::{Bitfield, ContentHash, Message, PathId, SignedMeta};

/// Chooses which eligible owner serves the next request for a chunk.
///
/// `candidates` is in owner registration order and holds only peers that are
/// ready, not choking us and below their pipeline cap.
pub trait PeerSelector {
    fn select(&self, ct_hash: &ContentHash, candidates: &[PeerId]) -> Option<PeerId>;
}

/// Take the earliest-registered eligible owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstReady;

impl PeerSelector for FirstReady {
    fn select(&self, _ct_hash: &ContentHash, candidates: &[PeerId]) -> Option<PeerId> {
        candidates.first().copied()
    }
}

/// What became of a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Written; the chunk still has gaps.
    Accepted,
    /// Last block of the chunk; it was verified and stored.
    Completed,
    /// Unrequested, misattributed, overlapping or corrupt; nothing kept.
    Rejected,
}

struct ChunkDownload<S: MessageSink> {
    buffer: PartialChunkBuffer,
    /// Paths whose current meta still references this chunk.
    referenced_by: HashSet<PathId>,
    /// Known owners in announcement order; each holds interest in its peer.
    owners: Vec<InterestGuard<S>>,
}

impl<S: MessageSink> ChunkDownload<S> {
    fn has_owner(&self, peer: PeerId) -> bool {
        self.owners.iter().any(|g| g.peer().id() == peer)
    }
}

/// Fetches missing chunks block by block from the peers that announce them.
pub struct Downloader<S: MessageSink> {
    config: SyncConfig,
    chunks: HashMap<ContentHash, ChunkDownload<S>>,
    /// FIFO of needed chunks; the first needed is served first.
    order: VecDeque<ContentHash>,
    /// Missing chunks per path, as of that path's latest local meta.
    by_path: HashMap<PathId, Vec<ContentHash>>,
    ledger: RequestLedger,
    selector: Box<dyn PeerSelector>,
}

impl<S: MessageSink> Downloader<S> {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_selector(config, Box::new(FirstReady))
    }

    pub fn with_selector(config: SyncConfig, selector: Box<dyn PeerSelector>) -> Self {
        Self {
            config,
            chunks: HashMap::new(),
            order: VecDeque::new(),
            by_path: HashMap::new(),
            ledger: RequestLedger::new(),
            selector,
        }
    }

    pub fn is_needed(&self, ct_hash: &ContentHash) -> bool {
        self.chunks.contains_key(ct_hash)
    }

    pub fn needed_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn owners(&self, ct_hash: &ContentHash) -> Vec<PeerId> {
        self.chunks
            .get(ct_hash)
            .map(|c| c.owners.iter().map(|g| g.peer().id()).collect())
            .unwrap_or_default()
    }

    /// A meta was accepted locally. Chunks whose bit is unset become needed;
    /// chunks with the bit set, or no longer referenced by this path, are
    /// dropped.
    ///
    /// Fails only if scratch storage for a new chunk cannot be allocated.
    pub fn notify_local_meta(&mut self, meta: &SignedMeta, bitfield: &Bitfield) -> Result<(), SyncError> {
        let path_id = meta.path_revision().path_id;
        let mut missing = Vec::new();

        for (idx, chunk) in meta.chunks().iter().enumerate() {
            if bitfield.get(idx) {
                self.notify_local_chunk(&chunk.ct_hash);
                continue;
            }
            if missing.contains(&chunk.ct_hash) {
                continue;
            }
            missing.push(chunk.ct_hash);

            match self.chunks.get_mut(&chunk.ct_hash) {
                Some(download) => {
                    download.referenced_by.insert(path_id);
                }
                None => {
                    let buffer = PartialChunkBuffer::new(chunk.ct_hash, chunk.size)?;
                    debug!(ct_hash = %chunk.ct_hash, size = chunk.size, "Chunk needed");
                    self.chunks.insert(
                        chunk.ct_hash,
                        ChunkDownload { buffer, referenced_by: HashSet::from([path_id]), owners: Vec::new() },
                    );
                    self.order.push_back(chunk.ct_hash);
                }
            }
        }

        let previous = self.by_path.insert(path_id, missing.clone()).unwrap_or_default();
        for ct_hash in previous.iter().filter(|h| !missing.contains(h)) {
            let orphaned = match self.chunks.get_mut(ct_hash) {
                Some(download) => {
                    download.referenced_by.remove(&path_id);
                    download.referenced_by.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.drop_chunk(ct_hash, "Chunk no longer referenced");
            }
        }
        Ok(())
    }

    /// The chunk is now stored locally; stop fetching it.
    pub fn notify_local_chunk(&mut self, ct_hash: &ContentHash) {
        if self.chunks.contains_key(ct_hash) {
            self.drop_chunk(ct_hash, "Chunk already downloaded");
        }
    }

    /// `peer` announced a meta we hold, with its bitfield for that meta.
    pub fn notify_remote_meta(&mut self, peer: &Peer<S>, meta: &SignedMeta, bitfield: &Bitfield) {
        for (idx, chunk) in meta.chunks().iter().enumerate() {
            if bitfield.get(idx) {
                self.notify_remote_chunk(peer, &chunk.ct_hash);
            }
        }
    }

    pub fn notify_remote_chunk(&mut self, peer: &Peer<S>, ct_hash: &ContentHash) {
        let Some(download) = self.chunks.get_mut(ct_hash) else {
            return;
        };
        if !download.has_owner(peer.id()) {
            debug!(ct_hash = %ct_hash, peer = %peer.id(), "Chunk owner registered");
            download.owners.push(InterestGuard::acquire(peer));
        }
    }

    pub fn handle_choke(&mut self, peer: PeerId) {
        self.ledger.peer_choked(peer);
    }

    /// Requests are issued on the next maintenance pass.
    pub fn handle_unchoke(&mut self, peer: PeerId) {
        debug!(peer = %peer, owned = self.chunks.values().filter(|c| c.has_owner(peer)).count(), "Owner unchoked");
    }

    /// Forget everything tied to `peer`: its requests and its ownership.
    pub fn erase_remote(&mut self, peer: PeerId) {
        self.ledger.peer_disconnected(peer);
        for download in self.chunks.values_mut() {
            download.owners.retain(|g| g.peer().id() != peer);
        }
    }

    /// Apply a block reply.
    ///
    /// The reply must match an outstanding request exactly, including the
    /// peer it was sent to. Returns `Err` only when scratch storage for a
    /// retry cannot be allocated.
    pub fn put_block<St: ChunkStore>(
        &mut self,
        store: &mut St,
        ct_hash: &ContentHash,
        offset: u32,
        data: Bytes,
        from: PeerId,
    ) -> Result<BlockOutcome, SyncError> {
        let Ok(size) = u32::try_from(data.len()) else {
            warn!(ct_hash = %ct_hash, peer = %from, "Block reply too large");
            return Ok(BlockOutcome::Rejected);
        };
        let Some(download) = self.chunks.get_mut(ct_hash) else {
            debug!(ct_hash = %ct_hash, offset, size, peer = %from, "Block for a chunk not needed");
            return Ok(BlockOutcome::Rejected);
        };
        if !self.ledger.complete(ct_hash, offset, size, from) {
            warn!(ct_hash = %ct_hash, offset, size, peer = %from, "Rejecting unrequested block");
            return Ok(BlockOutcome::Rejected);
        }
        if let Err(e) = download.buffer.write(offset, &data) {
            warn!(ct_hash = %ct_hash, offset, size, peer = %from, error = %e, "Rejecting block");
            return Ok(BlockOutcome::Rejected);
        }
        if !download.buffer.is_complete() {
            return Ok(BlockOutcome::Accepted);
        }

        let assembled = match download.buffer.finalize() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(ct_hash = %ct_hash, error = %e, "Could not read back chunk");
                self.reset_buffer(ct_hash)?;
                return Ok(BlockOutcome::Rejected);
            }
        };
        match store.put_chunk(ct_hash, assembled) {
            Ok(()) => {
                info!(ct_hash = %ct_hash, "Chunk downloaded");
                self.drop_chunk(ct_hash, "Chunk already downloaded");
                Ok(BlockOutcome::Completed)
            }
            Err(e @ StoreError::HashMismatch { .. }) => {
                warn!(ct_hash = %ct_hash, error = %e, "Assembled chunk failed verification");
                self.reset_buffer(ct_hash)?;
                Ok(BlockOutcome::Rejected)
            }
            Err(e) => {
                warn!(ct_hash = %ct_hash, error = %e, "Could not store chunk");
                self.reset_buffer(ct_hash)?;
                Ok(BlockOutcome::Rejected)
            }
        }
    }

    /// Drop expired requests, then fill free request slots.
    /// Returns how many requests were issued.
    pub fn maintain(&mut self, now: Instant) -> usize {
        self.ledger.remove_expired(now);

        let mut issued = 0;
        while self.ledger.count() < self.config.download_slots {
            let next = self.order.iter().find_map(|ct_hash| self.next_request(ct_hash));
            let Some((peer, ct_hash, offset, size)) = next else {
                break;
            };
            debug!(ct_hash = %ct_hash, offset, size, peer = %peer.id(), "==> BLOCK_REQUEST");
            peer.send(Message::BlockRequest { ct_hash, offset, size });
            self.ledger.add(BlockRequest::new(ct_hash, offset, size, peer.id(), now, self.config.request_timeout()));
            issued += 1;
        }
        issued
    }

    /// Lowest-offset range of `ct_hash` that is neither received nor
    /// requested, paired with the owner chosen to serve it.
    fn next_request(&self, ct_hash: &ContentHash) -> Option<(Peer<S>, ContentHash, u32, u32)> {
        let download = self.chunks.get(ct_hash)?;

        let candidates: Vec<PeerId> = download
            .owners
            .iter()
            .map(InterestGuard::peer)
            .filter(|p| p.ready() && !p.peer_choking())
            .filter(|p| {
                self.config.pipeline_max_requests == 0
                    || self.ledger.count_for_peer(p.id()) < self.config.pipeline_max_requests
            })
            .map(Peer::id)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut pending: ByteRangeAvailability = download.buffer.availability().clone();
        for request in self.ledger.requests_for_chunk(ct_hash) {
            if pending.insert(request.offset as u64, request.size as u64).is_err() {
                debug!(ct_hash = %ct_hash, offset = request.offset, size = request.size, "Outstanding request overlaps received data");
            }
        }
        let (offset, length) = pending.first_gap()?;
        let size = length.min(self.config.block_size as u64) as u32;

        let chosen = self.selector.select(ct_hash, &candidates)?;
        let peer = download.owners.iter().map(InterestGuard::peer).find(|p| p.id() == chosen)?.clone();
        Some((peer, *ct_hash, offset as u32, size))
    }

    fn reset_buffer(&mut self, ct_hash: &ContentHash) -> Result<(), SyncError> {
        if let Some(download) = self.chunks.get_mut(ct_hash) {
            let size = download.buffer.size() as u32;
            download.buffer = PartialChunkBuffer::new(*ct_hash, size)?;
            self.ledger.remove_where(|r| r.ct_hash == *ct_hash, "Chunk restarted");
        }
        Ok(())
    }

    fn drop_chunk(&mut self, ct_hash: &ContentHash, reason: &str) {
        self.ledger.remove_where(|r| r.ct_hash == *ct_hash, reason);
        self.chunks.remove(ct_hash);
        self.order.retain(|h| h != ct_hash);
        for missing in self.by_path.values_mut() {
            missing.retain(|h| h != ct_hash);
        }
    }
}
