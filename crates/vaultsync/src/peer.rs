use crate::handshake::{HandshakeFailure, HandshakeProtocol};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, warn};
use vaultsync_proto::{Handshake, Message};

/// Engine-side identity of one peer link, assigned by whoever accepted or
/// dialed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Which side speaks first in the handshake. Fixed by connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection; sends its handshake first.
    Initiator,
    /// Accepted the connection; answers a valid handshake.
    Responder,
}

/// Choke/interest flags of one link, BitTorrent style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for FlowControlState {
    fn default() -> Self {
        Self { am_choking: true, am_interested: false, peer_choking: true, peer_interested: false }
    }
}

/// Set `flag` to `value`; true if it changed.
fn flip(flag: &mut bool, value: bool) -> bool {
    std::mem::replace(flag, value) != value
}

/// Outbound half of a connection, provided by the transport collaborator.
pub trait MessageSink {
    fn send(&self, message: Message);
}

/// Handle to one authenticated-or-authenticating peer link.
///
/// Cloning is cheap and shares state; every clone lives on the owning
/// folder's loop.
pub struct Peer<S: MessageSink> {
    inner: Rc<PeerInner<S>>,
}

struct PeerInner<S> {
    id: PeerId,
    sink: S,
    flow: Cell<FlowControlState>,
    handshake: RefCell<HandshakeProtocol>,
    interest_refs: Cell<u32>,
    closed: Cell<bool>,
    remote_name: RefCell<Option<String>>,
}

impl<S: MessageSink> Clone for Peer<S> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<S: MessageSink> fmt::Debug for Peer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("flow", &self.inner.flow.get())
            .field("ready", &self.ready())
            .finish()
    }
}

impl<S: MessageSink> Peer<S> {
    pub fn new(id: PeerId, sink: S, handshake: HandshakeProtocol) -> Self {
        Self {
            inner: Rc::new(PeerInner {
                id,
                sink,
                flow: Cell::new(FlowControlState::default()),
                handshake: RefCell::new(handshake),
                interest_refs: Cell::new(0),
                closed: Cell::new(false),
                remote_name: RefCell::new(None),
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn flow(&self) -> FlowControlState {
        self.inner.flow.get()
    }

    /// Handshake complete in both directions and link still open.
    pub fn ready(&self) -> bool {
        !self.inner.closed.get() && self.inner.handshake.borrow().is_authenticated()
    }

    pub fn peer_choking(&self) -> bool {
        self.flow().peer_choking
    }

    pub fn am_choking(&self) -> bool {
        self.flow().am_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.flow().peer_interested
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn remote_name(&self) -> Option<String> {
        self.inner.remote_name.borrow().clone()
    }

    pub fn send(&self, message: Message) {
        if self.inner.closed.get() {
            debug!(peer = %self.id(), message_type = message.type_id(), "Dropping message to closed link");
            return;
        }
        self.inner.sink.send(message);
    }

    /// Stop sending; later guard releases and replies become no-ops.
    pub fn close(&self) {
        self.inner.closed.set(true);
    }

    /// Send our handshake if this side speaks first.
    pub fn start_handshake(&self) {
        let outgoing = self.inner.handshake.borrow_mut().start();
        if let Some(hs) = outgoing {
            debug!(peer = %self.id(), "==> HANDSHAKE");
            self.send(Message::Handshake(hs));
        }
    }

    pub fn receive_handshake(&self, hs: &Handshake) -> Result<(), HandshakeFailure> {
        let reply = self.inner.handshake.borrow_mut().receive(hs);
        match reply {
            Ok(reply) => {
                *self.inner.remote_name.borrow_mut() = Some(hs.device_name.clone());
                if let Some(reply) = reply {
                    debug!(peer = %self.id(), "==> HANDSHAKE");
                    self.send(Message::Handshake(reply));
                }
                info!(peer = %self.id(), device = %hs.device_name, user_agent = %hs.user_agent, "Handshake completed");
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.id(), error = %e, "Handshake failed");
                Err(e)
            }
        }
    }

    fn update_flow(&self, f: impl FnOnce(&mut FlowControlState) -> bool) -> bool {
        let mut flow = self.inner.flow.get();
        let changed = f(&mut flow);
        self.inner.flow.set(flow);
        changed
    }

    /* Local actions: a message goes out only on an actual transition */

    pub fn choke(&self) {
        if self.update_flow(|s| flip(&mut s.am_choking, true)) {
            debug!(peer = %self.id(), "==> CHOKE");
            self.send(Message::Choke);
        }
    }

    pub fn unchoke(&self) {
        if self.update_flow(|s| flip(&mut s.am_choking, false)) {
            debug!(peer = %self.id(), "==> UNCHOKE");
            self.send(Message::Unchoke);
        }
    }

    pub fn interest(&self) {
        if self.update_flow(|s| flip(&mut s.am_interested, true)) {
            debug!(peer = %self.id(), "==> INTERESTED");
            self.send(Message::Interested);
        }
    }

    pub fn uninterest(&self) {
        if self.update_flow(|s| flip(&mut s.am_interested, false)) {
            debug!(peer = %self.id(), "==> NOT_INTERESTED");
            self.send(Message::NotInterested);
        }
    }

    /* Remote signals: return whether the flag flipped */

    pub fn handle_choke(&self) -> bool {
        debug!(peer = %self.id(), "<== CHOKE");
        self.update_flow(|s| flip(&mut s.peer_choking, true))
    }

    pub fn handle_unchoke(&self) -> bool {
        debug!(peer = %self.id(), "<== UNCHOKE");
        self.update_flow(|s| flip(&mut s.peer_choking, false))
    }

    pub fn handle_interested(&self) -> bool {
        debug!(peer = %self.id(), "<== INTERESTED");
        self.update_flow(|s| flip(&mut s.peer_interested, true))
    }

    pub fn handle_not_interested(&self) -> bool {
        debug!(peer = %self.id(), "<== NOT_INTERESTED");
        self.update_flow(|s| flip(&mut s.peer_interested, false))
    }

    /* Interest reference counting, driven by InterestGuard */

    pub(crate) fn acquire_interest(&self) {
        let refs = self.inner.interest_refs.get();
        self.inner.interest_refs.set(refs + 1);
        if refs == 0 {
            self.interest();
        }
    }

    pub(crate) fn release_interest(&self) {
        let refs = self.inner.interest_refs.get();
        debug_assert!(refs > 0, "interest released more often than acquired");
        let refs = refs.saturating_sub(1);
        self.inner.interest_refs.set(refs);
        if refs == 0 {
            self.uninterest();
        }
    }

    pub fn interest_refs(&self) -> u32 {
        self.inner.interest_refs.get()
    }
}
