use crate::downloader::Downloader;
use crate::peer::{MessageSink, Peer, PeerId};
use crate::store::{ChunkStore, MetaStore, StoreError};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use vaultsync_proto::{Bitfield, Message, PathRevision, SignedMeta};

/// HaveMeta / MetaRequest / MetaReply handling.
///
/// Only strictly newer revisions are fetched or stored. A revision already
/// requested from some peer is not requested again until that peer answers
/// or goes away.
#[derive(Debug, Default)]
pub struct MetaExchange {
    requested: HashMap<PathRevision, PeerId>,
}

impl MetaExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self, revision: &PathRevision) -> bool {
        self.requested.contains_key(revision)
    }

    pub fn handle_have_meta<S, St>(
        &mut self,
        store: &St,
        downloader: &mut Downloader<S>,
        peer: &Peer<S>,
        revision: PathRevision,
        bitfield: &Bitfield,
    ) -> Result<(), StoreError>
    where
        S: MessageSink,
        St: MetaStore + ChunkStore,
    {
        if store.have_meta(&revision) {
            let meta = store.get_meta(&revision)?;
            apply_remote_bitfield(downloader, peer, &meta, bitfield);
        } else if store.put_allowed(&revision) {
            if self.requested.contains_key(&revision) {
                debug!(peer = %peer.id(), revision = %revision, "Meta already requested");
                return Ok(());
            }
            debug!(peer = %peer.id(), revision = %revision, "==> META_REQUEST");
            self.requested.insert(revision, peer.id());
            peer.send(Message::MetaRequest { revision });
        } else {
            debug!(peer = %peer.id(), revision = %revision, "Ignoring expired meta");
        }
        Ok(())
    }

    pub fn handle_meta_request<S, St>(&self, store: &St, peer: &Peer<S>, revision: PathRevision)
    where
        S: MessageSink,
        St: MetaStore + ChunkStore,
    {
        match store.get_meta(&revision) {
            Ok(signed_meta) => {
                let bitfield = store.make_bitfield(&signed_meta);
                debug!(peer = %peer.id(), revision = %revision, "==> META_REPLY");
                peer.send(Message::MetaReply { signed_meta, bitfield });
            }
            Err(e) => warn!(peer = %peer.id(), revision = %revision, error = %e, "Cannot answer meta request"),
        }
    }

    /// Store a replied meta if it advances its path. Returns the meta when it
    /// was stored; the caller then treats it as a new local meta.
    pub fn handle_meta_reply<S, St>(
        &mut self,
        store: &mut St,
        peer: &Peer<S>,
        signed_meta: SignedMeta,
    ) -> Result<Option<SignedMeta>, StoreError>
    where
        S: MessageSink,
        St: MetaStore,
    {
        let revision = signed_meta.path_revision();
        self.requested.remove(&revision);

        if !store.put_allowed(&revision) {
            debug!(peer = %peer.id(), revision = %revision, "Ignoring meta reply that is not newer");
            return Ok(None);
        }
        store.put_meta(signed_meta.clone())?;
        info!(peer = %peer.id(), revision = %revision, chunks = signed_meta.chunks().len(), "Meta accepted");
        Ok(Some(signed_meta))
    }

    pub fn erase_remote(&mut self, peer: PeerId) {
        self.requested.retain(|_, p| *p != peer);
    }
}

/// Register `peer` as owner of the chunks its bitfield marks. A bitfield
/// sized for a different chunk list is ignored.
pub fn apply_remote_bitfield<S: MessageSink>(
    downloader: &mut Downloader<S>,
    peer: &Peer<S>,
    meta: &SignedMeta,
    bitfield: &Bitfield,
) {
    if bitfield.len() != meta.chunks().len() {
        warn!(
            peer = %peer.id(),
            revision = %meta.path_revision(),
            bits = bitfield.len(),
            chunks = meta.chunks().len(),
            "Inconsistent bitfield"
        );
        return;
    }
    downloader.notify_remote_meta(peer, meta, bitfield);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::peer::test_support::{ready_peer, RecordingSink};
    use crate::store::test_support::{path, signed_meta};
    use crate::store::MemoryStore;

    fn downloader() -> Downloader<RecordingSink> {
        Downloader::new(SyncConfig::new())
    }

    #[test]
    fn newer_revision_is_requested_once() {
        let store = MemoryStore::new();
        let mut dl = downloader();
        let mut ex = MetaExchange::new();
        let (a, sa) = ready_peer(1);
        let (b, sb) = ready_peer(2);
        let rev = PathRevision::new(path(1), 3);

        ex.handle_have_meta(&store, &mut dl, &a, rev, &Bitfield::new(0)).unwrap();
        ex.handle_have_meta(&store, &mut dl, &b, rev, &Bitfield::new(0)).unwrap();
        assert_eq!(sa.take(), vec![Message::MetaRequest { revision: rev }]);
        assert!(sb.take().is_empty());

        ex.erase_remote(PeerId(1));
        ex.handle_have_meta(&store, &mut dl, &b, rev, &Bitfield::new(0)).unwrap();
        assert_eq!(sb.take(), vec![Message::MetaRequest { revision: rev }]);
    }

    #[test]
    fn stale_revision_never_touches_storage() {
        let mut store = MemoryStore::new();
        store.put_meta(signed_meta(path(1), 5, &[b"current"])).unwrap();
        let mut dl = downloader();
        let mut ex = MetaExchange::new();
        let (a, sa) = ready_peer(1);

        for revision in [3, 5] {
            let rev = PathRevision::new(path(1), revision);
            if revision != 5 {
                ex.handle_have_meta(&store, &mut dl, &a, rev, &Bitfield::new(1)).unwrap();
            }
            let stored = ex.handle_meta_reply(&mut store, &a, signed_meta(path(1), revision, &[b"stale"])).unwrap();
            assert_eq!(stored, None);
        }
        assert!(sa.take().is_empty());
        assert_eq!(store.revision_of(&path(1)), Some(5));
        let current = store.get_meta(&PathRevision::new(path(1), 5)).unwrap();
        assert_eq!(current, signed_meta(path(1), 5, &[b"current"]));
    }

    #[test]
    fn newer_reply_is_stored() {
        let mut store = MemoryStore::new();
        store.put_meta(signed_meta(path(1), 1, &[])).unwrap();
        let mut ex = MetaExchange::new();
        let (a, _sa) = ready_peer(1);

        let newer = signed_meta(path(1), 2, &[b"data"]);
        let stored = ex.handle_meta_reply(&mut store, &a, newer.clone()).unwrap();
        assert_eq!(stored, Some(newer));
        assert_eq!(store.revision_of(&path(1)), Some(2));
    }

    #[test]
    fn known_meta_registers_owner() {
        let mut store = MemoryStore::new();
        let meta = signed_meta(path(1), 1, &[b"x", b"y"]);
        store.put_meta(meta.clone()).unwrap();
        let mut dl = downloader();
        dl.notify_local_meta(&meta, &store.make_bitfield(&meta)).unwrap();
        let mut ex = MetaExchange::new();
        let (a, _sa) = ready_peer(1);

        // wrong length: ignored
        ex.handle_have_meta(&store, &mut dl, &a, meta.path_revision(), &Bitfield::full(3)).unwrap();
        assert!(dl.owners(&meta.chunks()[1].ct_hash).is_empty());

        let bits = Bitfield::from_bits(vec![false, true]);
        ex.handle_have_meta(&store, &mut dl, &a, meta.path_revision(), &bits).unwrap();
        assert!(dl.owners(&meta.chunks()[0].ct_hash).is_empty());
        assert_eq!(dl.owners(&meta.chunks()[1].ct_hash), vec![PeerId(1)]);
    }

    #[test]
    fn meta_request_answered_with_bitfield() {
        let mut store = MemoryStore::new();
        let meta = signed_meta(path(1), 1, &[b"x"]);
        store.put_meta(meta.clone()).unwrap();
        let ex = MetaExchange::new();
        let (a, sa) = ready_peer(1);

        ex.handle_meta_request(&store, &a, meta.path_revision());
        ex.handle_meta_request(&store, &a, PathRevision::new(path(2), 1));
        assert_eq!(sa.take(), vec![Message::MetaReply { signed_meta: meta, bitfield: Bitfield::new(1) }]);
    }
}
