use crate::error::SyncError;
use crate::folder::FolderEvent;
use crate::net::framing::{write_message, FrameReader, TransportStream};
use crate::peer::{MessageSink, PeerId, Role};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vaultsync_proto::{IdentityDigest, Message};

/// Outbound queue of one connection task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    id: PeerId,
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSink for ChannelSink {
    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!(peer = %self.id, "Outbound queue closed");
        }
    }
}

/// Run one link on its own task: frames read from `transport` become
/// `FolderEvent::Message`s, and messages sent through the folder's
/// [`ChannelSink`] are written out. The folder sees `Connected` first and
/// `Disconnected` last.
///
/// The task ends when the stream closes or fails, when the folder drops the
/// link (its sink goes away), or when the folder stops listening.
pub fn spawn_connection<T: TransportStream>(
    transport: T,
    id: PeerId,
    role: Role,
    remote_identity: IdentityDigest,
    events: mpsc::Sender<FolderEvent<ChannelSink>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChannelSink { id, tx };
        if events.send(FolderEvent::Connected { id, sink, role, remote_identity }).await.is_err() {
            return;
        }

        match pump(transport, id, rx, &events).await {
            Ok(()) => debug!(peer = %id, "Connection closed"),
            Err(e) => warn!(peer = %id, error = %e, "Connection failed"),
        }
        let _ = events.send(FolderEvent::Disconnected { id }).await;
    })
}

async fn pump<T: TransportStream>(
    transport: T,
    id: PeerId,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: &mpsc::Sender<FolderEvent<ChannelSink>>,
) -> Result<(), SyncError> {
    let (reader, mut writer) = tokio::io::split(transport);
    let mut frames = FrameReader::new(reader);

    loop {
        tokio::select! {
            incoming = frames.next_message() => match incoming? {
                Some(message) => {
                    if events.send(FolderEvent::Message { id, message }).await.is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            outgoing = outbound.recv() => match outgoing {
                Some(message) => write_message(&mut writer, &message).await?,
                None => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            },
        }
    }
}
