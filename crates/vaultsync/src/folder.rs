use crate::config::SyncConfig;
use crate::downloader::{BlockOutcome, Downloader, PeerSelector};
use crate::error::SyncError;
use crate::handshake::{HandshakeFailure, HandshakeProtocol};
use crate::meta::{apply_remote_bitfield, MetaExchange};
use crate::peer::{MessageSink, Peer, PeerId, Role};
use crate::store::{ChunkStore, MetaStore};
use crate::uploader::Uploader;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vaultsync_proto::{ContentHash, IdentityDigest, Message, PathRevision, SignedMeta};

/// Input to a running [`FolderGroup`].
#[derive(Debug)]
pub enum FolderEvent<S> {
    Connected { id: PeerId, sink: S, role: Role, remote_identity: IdentityDigest },
    Message { id: PeerId, message: Message },
    Disconnected { id: PeerId },
    /// The indexer stored a new meta.
    LocalMeta(PathRevision),
    /// The indexer stored a chunk.
    LocalChunk(ContentHash),
    Shutdown,
}

/// All peers and transfer state of one shared folder.
///
/// Everything here is touched from a single task; peers are `Rc` handles, so
/// `run` must be driven on the current thread (e.g. inside a `LocalSet`).
pub struct FolderGroup<St, S: MessageSink> {
    config: SyncConfig,
    secret: Vec<u8>,
    identity: IdentityDigest,
    store: St,
    peers: BTreeMap<PeerId, Peer<S>>,
    downloader: Downloader<S>,
    uploader: Uploader,
    meta: MetaExchange,
    maintenance_due: bool,
}

impl<St, S> FolderGroup<St, S>
where
    St: MetaStore + ChunkStore,
    S: MessageSink,
{
    pub fn new(config: SyncConfig, secret: impl Into<Vec<u8>>, identity: IdentityDigest, store: St) -> Self {
        let downloader = Downloader::new(config.clone());
        Self::assemble(config, secret.into(), identity, store, downloader)
    }

    pub fn with_selector(
        config: SyncConfig,
        secret: impl Into<Vec<u8>>,
        identity: IdentityDigest,
        store: St,
        selector: Box<dyn PeerSelector>,
    ) -> Self {
        let downloader = Downloader::with_selector(config.clone(), selector);
        Self::assemble(config, secret.into(), identity, store, downloader)
    }

    fn assemble(
        config: SyncConfig,
        secret: Vec<u8>,
        identity: IdentityDigest,
        store: St,
        downloader: Downloader<S>,
    ) -> Self {
        Self {
            config,
            secret,
            identity,
            store,
            peers: BTreeMap::new(),
            downloader,
            uploader: Uploader::new(),
            meta: MetaExchange::new(),
            maintenance_due: false,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn downloader(&self) -> &Downloader<S> {
        &self.downloader
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer<S>> {
        self.peers.get(&id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn maintenance_due(&self) -> bool {
        self.maintenance_due
    }

    /// Register a new link and, as initiator, send our handshake.
    pub fn add_peer(&mut self, id: PeerId, sink: S, role: Role, remote_identity: IdentityDigest) -> Peer<S> {
        let handshake = HandshakeProtocol::new(
            &self.secret,
            role,
            &self.identity,
            &remote_identity,
            self.config.client_name.clone(),
            self.config.user_agent.clone(),
        );
        let peer = Peer::new(id, sink, handshake);
        if let Some(old) = self.peers.insert(id, peer.clone()) {
            warn!(peer = %id, "Replacing existing link");
            old.close();
            self.forget(id);
        }
        info!(peer = %id, role = ?role, "Peer connected");
        peer.start_handshake();
        peer
    }

    /// Drop a link and everything the engine tracks for it.
    pub fn remove_peer(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.remove(&id) {
            peer.close();
            self.forget(id);
            info!(peer = %id, "Peer disconnected");
        }
    }

    fn forget(&mut self, id: PeerId) {
        self.downloader.erase_remote(id);
        self.meta.erase_remote(id);
        self.maintenance_due = true;
    }

    /// Dispatch one message from `id`. Protocol errors mean the link must be
    /// closed; any other error is fatal to the folder.
    pub fn handle_message(&mut self, id: PeerId, message: Message) -> Result<(), SyncError> {
        let Some(peer) = self.peers.get(&id).cloned() else {
            debug!(peer = %id, message_type = message.type_id(), "Message from unknown peer");
            return Ok(());
        };

        if let Message::Handshake(hs) = &message {
            peer.receive_handshake(hs)?;
            self.announce_metas(&peer);
            self.maintenance_due = true;
            return Ok(());
        }
        if !peer.ready() {
            return Err(HandshakeFailure::Expected(message.type_id()).into());
        }

        match message {
            Message::Handshake(_) => {}
            Message::Choke => {
                if peer.handle_choke() {
                    self.downloader.handle_choke(id);
                }
            }
            Message::Unchoke => {
                if peer.handle_unchoke() {
                    self.downloader.handle_unchoke(id);
                    self.maintenance_due = true;
                }
            }
            Message::Interested => self.uploader.handle_interested(&peer),
            Message::NotInterested => self.uploader.handle_not_interested(&peer),
            Message::HaveMeta { revision, bitfield } => {
                if let Err(e) = self.meta.handle_have_meta(&self.store, &mut self.downloader, &peer, revision, &bitfield) {
                    warn!(peer = %id, revision = %revision, error = %e, "Cannot process meta announcement");
                }
                self.maintenance_due = true;
            }
            Message::HaveChunk { ct_hash } => {
                self.downloader.notify_remote_chunk(&peer, &ct_hash);
                self.maintenance_due = true;
            }
            Message::MetaRequest { revision } => self.meta.handle_meta_request(&self.store, &peer, revision),
            Message::MetaReply { signed_meta, bitfield } => {
                match self.meta.handle_meta_reply(&mut self.store, &peer, signed_meta) {
                    Ok(Some(accepted)) => {
                        self.accept_local_meta(&accepted)?;
                        apply_remote_bitfield(&mut self.downloader, &peer, &accepted, &bitfield);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(peer = %id, error = %e, "Cannot store meta"),
                }
                self.maintenance_due = true;
            }
            Message::BlockRequest { ct_hash, offset, size } => {
                self.uploader.handle_block_request(&peer, &self.store, &ct_hash, offset, size);
            }
            Message::BlockReply { ct_hash, offset, data } => {
                let outcome = self.downloader.put_block(&mut self.store, &ct_hash, offset, data, id)?;
                if outcome == BlockOutcome::Completed {
                    self.broadcast(Message::HaveChunk { ct_hash });
                }
                self.maintenance_due = true;
            }
        }
        Ok(())
    }

    /// The indexer stored `revision` locally.
    pub fn notify_local_meta(&mut self, revision: &PathRevision) -> Result<(), SyncError> {
        let meta = self.store.get_meta(revision)?;
        self.accept_local_meta(&meta)
    }

    /// The indexer stored `ct_hash` locally.
    pub fn notify_local_chunk(&mut self, ct_hash: &ContentHash) {
        self.downloader.notify_local_chunk(ct_hash);
        self.broadcast(Message::HaveChunk { ct_hash: *ct_hash });
    }

    fn accept_local_meta(&mut self, meta: &SignedMeta) -> Result<(), SyncError> {
        let bitfield = self.store.make_bitfield(meta);
        self.downloader.notify_local_meta(meta, &bitfield)?;
        self.broadcast(Message::HaveMeta { revision: meta.path_revision(), bitfield });
        self.maintenance_due = true;
        Ok(())
    }

    fn announce_metas(&self, peer: &Peer<S>) {
        let metas = self.store.all_metas();
        debug!(peer = %peer.id(), count = metas.len(), "Announcing metas");
        for meta in metas {
            let bitfield = self.store.make_bitfield(&meta);
            peer.send(Message::HaveMeta { revision: meta.path_revision(), bitfield });
        }
    }

    /// Send to every authenticated peer.
    fn broadcast(&self, message: Message) {
        for peer in self.peers.values().filter(|p| p.ready()) {
            peer.send(message.clone());
        }
    }

    /// Expire stale requests and issue new ones.
    pub fn maintain(&mut self, now: Instant) -> usize {
        self.maintenance_due = false;
        self.downloader.maintain(now)
    }

    fn handle_event(&mut self, event: FolderEvent<S>) -> Result<(), SyncError> {
        match event {
            FolderEvent::Connected { id, sink, role, remote_identity } => {
                self.add_peer(id, sink, role, remote_identity);
            }
            FolderEvent::Message { id, message } => {
                if let Err(e) = self.handle_message(id, message) {
                    if !e.is_protocol() {
                        return Err(e);
                    }
                    warn!(peer = %id, error = %e, "Closing link after protocol error");
                    self.remove_peer(id);
                }
            }
            FolderEvent::Disconnected { id } => self.remove_peer(id),
            FolderEvent::LocalMeta(revision) => match self.notify_local_meta(&revision) {
                Err(SyncError::Store(e)) if e.is_not_found() => {
                    warn!(revision = %revision, "Local meta vanished before it was announced");
                }
                other => other?,
            },
            FolderEvent::LocalChunk(ct_hash) => self.notify_local_chunk(&ct_hash),
            FolderEvent::Shutdown => {}
        }
        Ok(())
    }

    /// Drive the folder until `Shutdown` or until every sender is gone, then
    /// hand the store back.
    pub async fn run(mut self, mut events: mpsc::Receiver<FolderEvent<S>>) -> Result<St, SyncError> {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    None | Some(FolderEvent::Shutdown) => break,
                    Some(event) => self.handle_event(event)?,
                },
                _ = ticker.tick() => self.maintenance_due = true,
            }
            if self.maintenance_due {
                self.maintain(Instant::now());
            }
        }

        info!(peers = self.peers.len(), pending_chunks = self.downloader.needed_count(), "Folder shutting down");
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.remove_peer(id);
        }
        Ok(self.store)
    }
}
