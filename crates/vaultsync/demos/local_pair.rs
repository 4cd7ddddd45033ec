use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use vaultsync::{spawn_connection, ChunkStore, FolderEvent, FolderGroup, MemoryStore, MetaStore, PeerId, Role, SyncConfig};
use vaultsync_proto::{ChunkDescriptor, ContentHash, IdentityDigest, Meta, MetaKind, PathId, PathRevision, SignedMeta};

fn init_tracing() {
    if tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .finish(),
    )
    .is_err()
    {
        // tracing already initialized
    }
}

/// One file of `chunks` pseudo-random chunks, stored in a fresh seeder store.
fn seeded_store(chunks: usize, chunk_len: usize) -> Result<(MemoryStore, SignedMeta), Box<dyn std::error::Error>> {
    let mut store = MemoryStore::new();
    let mut descriptors = Vec::with_capacity(chunks);
    for idx in 0..chunks {
        let data: Vec<u8> = (0..chunk_len).map(|i| (i * 31 + idx * 7) as u8).collect();
        let ct_hash = ContentHash::compute(&data);
        store.put_chunk(&ct_hash, Bytes::from(data))?;
        descriptors.push(ChunkDescriptor { ct_hash, size: chunk_len as u32, iv: [idx as u8; 16] });
    }
    let meta = SignedMeta::new(
        Meta {
            path_revision: PathRevision::new(PathId([0x42; 28]), 1),
            kind: MetaKind::File,
            chunks: descriptors,
        },
        Bytes::from_static(b"demo-signature"),
    );
    store.put_meta(meta.clone())?;
    Ok((store, meta))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let chunk_count = std::env::var("VS_CHUNKS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(4);

    let (seeded, meta) = seeded_store(chunk_count, 200_000)?;
    let secret = b"demo folder secret".to_vec();
    let (id_seed, id_leech) = (IdentityDigest::random(), IdentityDigest::random());

    let seeder = FolderGroup::new(SyncConfig::new().with_client_name("seeder"), secret.clone(), id_seed, seeded);
    let leecher = FolderGroup::new(SyncConfig::new().with_client_name("leecher"), secret, id_leech, MemoryStore::new());

    let (tx_seed, rx_seed) = mpsc::channel(256);
    let (tx_leech, rx_leech) = mpsc::channel(256);
    let (pipe_seed, pipe_leech) = tokio::io::duplex(64 * 1024);
    spawn_connection(pipe_seed, PeerId(1), Role::Initiator, id_leech, tx_seed.clone());
    spawn_connection(pipe_leech, PeerId(1), Role::Responder, id_seed, tx_leech.clone());

    info!(chunks = chunk_count, "syncing one file between two local folders");
    let local = LocalSet::new();
    let seeder_task = local.spawn_local(seeder.run(rx_seed));
    let leecher_task = local.spawn_local(leecher.run(rx_leech));

    let store = local
        .run_until(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx_seed.send(FolderEvent::Shutdown).await;
            let _ = tx_leech.send(FolderEvent::Shutdown).await;
            seeder_task.await??;
            let store = leecher_task.await??;
            Ok::<_, Box<dyn std::error::Error>>(store)
        })
        .await?;

    let have = meta.chunks().iter().filter(|c| store.have_chunk(&c.ct_hash)).count();
    info!(
        revision = %meta.path_revision(),
        have,
        total = meta.chunks().len(),
        "leecher finished"
    );
    Ok(())
}
