use crate::peer::PeerId;
use std::time::{Duration, Instant};
use tracing::debug;
use vaultsync_proto::ContentHash;

/// One outstanding block request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub ct_hash: ContentHash,
    pub offset: u32,
    pub size: u32,
    pub peer: PeerId,
    pub started_at: Instant,
    pub expires_at: Instant,
}

impl BlockRequest {
    pub fn new(ct_hash: ContentHash, offset: u32, size: u32, peer: PeerId, now: Instant, timeout: Duration) -> Self {
        Self { ct_hash, offset, size, peer, started_at: now, expires_at: now + timeout }
    }

    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

/// Outstanding block requests across all peers of a folder.
///
/// Every removal goes through [`RequestLedger::remove_where`] so that each
/// dropped request is logged with the reason it went away.
#[derive(Debug, Default)]
pub struct RequestLedger {
    requests: Vec<BlockRequest>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: BlockRequest) {
        debug!(
            ct_hash = %request.ct_hash,
            offset = request.offset,
            size = request.size,
            peer = %request.peer,
            "Block request tracked"
        );
        self.requests.push(request);
    }

    pub fn remove_where<F>(&mut self, mut pred: F, reason: &str) -> Vec<BlockRequest>
    where
        F: FnMut(&BlockRequest) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.requests.len());
        for request in self.requests.drain(..) {
            if pred(&request) {
                removed.push(request);
            } else {
                kept.push(request);
            }
        }
        self.requests = kept;

        for request in &removed {
            debug!(
                ct_hash = %request.ct_hash,
                offset = request.offset,
                size = request.size,
                peer = %request.peer,
                reason,
                "Block request removed"
            );
        }
        removed
    }

    /// Remove the request exactly matching a received reply. `false` means the
    /// block was never asked of that peer.
    pub fn complete(&mut self, ct_hash: &ContentHash, offset: u32, size: u32, peer: PeerId) -> bool {
        let removed = self.remove_where(
            |r| r.ct_hash == *ct_hash && r.offset == offset && r.size == size && r.peer == peer,
            "Block downloaded",
        );
        !removed.is_empty()
    }

    pub fn remove_expired(&mut self, now: Instant) -> Vec<BlockRequest> {
        self.remove_where(|r| r.expires_at <= now, "Request timed out")
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) -> Vec<BlockRequest> {
        self.remove_where(|r| r.peer == peer, "Peer disconnected")
    }

    pub fn peer_choked(&mut self, peer: PeerId) -> Vec<BlockRequest> {
        self.remove_where(|r| r.peer == peer, "Peer choked")
    }

    pub fn requests_for_chunk<'a>(&'a self, ct_hash: &'a ContentHash) -> impl Iterator<Item = &'a BlockRequest> + 'a {
        self.requests.iter().filter(move |r| r.ct_hash == *ct_hash)
    }

    pub fn count_for_peer(&self, peer: PeerId) -> usize {
        self.requests.iter().filter(|r| r.peer == peer).count()
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockRequest> {
        self.requests.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn hash(n: u8) -> ContentHash {
        ContentHash::compute(&[n])
    }

    #[test]
    fn complete_requires_exact_match() {
        let now = Instant::now();
        let mut ledger = RequestLedger::new();
        ledger.add(BlockRequest::new(hash(1), 0, 40, PeerId(1), now, TIMEOUT));

        assert!(!ledger.complete(&hash(1), 0, 40, PeerId(2)));
        assert!(!ledger.complete(&hash(1), 0, 39, PeerId(1)));
        assert!(!ledger.complete(&hash(2), 0, 40, PeerId(1)));
        assert_eq!(ledger.count(), 1);

        assert!(ledger.complete(&hash(1), 0, 40, PeerId(1)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let now = Instant::now();
        let mut ledger = RequestLedger::new();
        ledger.add(BlockRequest::new(hash(1), 0, 10, PeerId(1), now, TIMEOUT));
        ledger.add(BlockRequest::new(hash(1), 10, 10, PeerId(1), now + Duration::from_secs(5), TIMEOUT));

        assert!(ledger.remove_expired(now + Duration::from_secs(9)).is_empty());
        let expired = ledger.remove_expired(now + TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].offset, 0);
        assert_eq!(ledger.count(), 1);
    }

    #[test]
    fn peer_and_chunk_removals() {
        let now = Instant::now();
        let mut ledger = RequestLedger::new();
        ledger.add(BlockRequest::new(hash(1), 0, 10, PeerId(1), now, TIMEOUT));
        ledger.add(BlockRequest::new(hash(1), 10, 10, PeerId(2), now, TIMEOUT));
        ledger.add(BlockRequest::new(hash(2), 0, 10, PeerId(1), now, TIMEOUT));

        assert_eq!(ledger.count_for_peer(PeerId(1)), 2);
        assert_eq!(ledger.peer_choked(PeerId(2)).len(), 1);
        assert_eq!(ledger.requests_for_chunk(&hash(1)).count(), 1);
        assert_eq!(ledger.remove_where(|r| r.ct_hash == hash(1), "Chunk already downloaded").len(), 1);
        assert_eq!(ledger.peer_disconnected(PeerId(1)).len(), 1);
        assert!(ledger.is_empty());
    }
}
