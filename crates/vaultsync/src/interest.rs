use crate::peer::{MessageSink, Peer};

/// Scoped "we want something from this peer".
///
/// The first live guard for a peer sends INTERESTED; dropping the last one
/// sends NOT_INTERESTED. Counting is per peer, not per guard holder.
pub struct InterestGuard<S: MessageSink> {
    peer: Peer<S>,
}

impl<S: MessageSink> InterestGuard<S> {
    pub fn acquire(peer: &Peer<S>) -> Self {
        peer.acquire_interest();
        Self { peer: peer.clone() }
    }

    pub fn peer(&self) -> &Peer<S> {
        &self.peer
    }
}

impl<S: MessageSink> Clone for InterestGuard<S> {
    fn clone(&self) -> Self {
        Self::acquire(&self.peer)
    }
}

impl<S: MessageSink> Drop for InterestGuard<S> {
    fn drop(&mut self) {
        self.peer.release_interest();
    }
}

impl<S: MessageSink> std::fmt::Debug for InterestGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InterestGuard").field(&self.peer.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::test_support::ready_peer;
    use vaultsync_proto::Message;

    #[test]
    fn first_and_last_guard_drive_messages() {
        let (peer, sink) = ready_peer(7);

        let a = InterestGuard::acquire(&peer);
        let b = a.clone();
        let c = InterestGuard::acquire(&peer);
        assert_eq!(peer.interest_refs(), 3);
        assert_eq!(sink.take(), vec![Message::Interested]);

        drop(a);
        drop(c);
        assert!(sink.take().is_empty());
        assert!(peer.flow().am_interested);

        drop(b);
        assert_eq!(sink.take(), vec![Message::NotInterested]);
        assert_eq!(peer.interest_refs(), 0);

        let _again = InterestGuard::acquire(&peer);
        assert_eq!(sink.take(), vec![Message::Interested]);
    }
}
