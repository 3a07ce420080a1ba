//! Download a torrent from simulated in-process peers.
//!
//! Everything external to the engine is stubbed right here: four peer
//! "sessions" that serve a shared content buffer, and a disk collaborator
//! that stores blocks in memory and verifies pieces by comparing against
//! the original bytes.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use swarm::{
    BitField, Client, ClientConfig, DataBlock, DownloadHandle, DownloadProgress, NewPeer,
    PeerMessage, StorageFeedback, StorageHandle, StorageMessage, SwarmEvent, TorrentInfo,
    TorrentParams, BLOCK_LENGTH, PEER_CHANNEL_CAPACITY,
};

const NPIECES: usize = 64;
const PIECE_LENGTH: u32 = 4 * BLOCK_LENGTH;
const PEERS: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let total_length = NPIECES as u64 * PIECE_LENGTH as u64;
    let content: Vec<u8> = (0..total_length).map(|i| (i % 251) as u8).collect();

    let info = TorrentInfo {
        info_hash: [0x5a; 20],
        name: "simulated swarm".to_string(),
        piece_length: PIECE_LENGTH,
        total_length,
        piece_hashes: vec![[0; 20]; NPIECES],
    };

    let directory = std::env::temp_dir().join(format!("swarm-demo-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&directory)?;

    let (storage_tx, storage_rx) = mpsc::channel(1024);
    let (feedback_tx, feedback_rx) = mpsc::channel(1024);
    tokio::spawn(run_storage(storage_rx, feedback_tx, content.clone()));

    let mut client = Client::new(ClientConfig {
        seed: Some(42),
        cancellation_token: Some(CancellationToken::new()),
    });
    let (progress_tx, mut progress_rx) = mpsc::channel::<DownloadProgress>(64);
    let handle = client.open(
        TorrentParams {
            info: info.clone(),
            directory: directory.clone(),
            storage: StorageHandle::new(storage_tx),
            storage_rx: feedback_rx,
            trackers: Vec::new(),
        },
        progress_tx,
    )?;

    for i in 0..PEERS {
        spawn_peer(handle.clone(), content.clone(), i).await;
    }

    while let Some(progress) = progress_rx.recv().await {
        println!(
            "tick {:>3} {:>5.1}% {:>8} B/s over {} peers",
            progress.tick_num,
            progress.percent,
            progress.download_speed(),
            progress.peers.len(),
        );
        if progress.percent >= 100.0 {
            println!("done");
            break;
        }
    }

    client.shutdown().await;
    std::fs::remove_dir_all(&directory)?;
    Ok(())
}

/// The disk collaborator: blocks land in a map, verification compares the
/// assembled piece against the source bytes.
async fn run_storage(
    mut storage_rx: mpsc::Receiver<StorageMessage>,
    feedback_tx: mpsc::Sender<StorageFeedback>,
    content: Vec<u8>,
) {
    let mut blocks: HashMap<(u32, u32), Bytes> = HashMap::new();
    while let Some(message) = storage_rx.recv().await {
        match message {
            StorageMessage::WriteBlock(data) => {
                blocks.insert((data.piece, data.offset), data.bytes);
            }
            StorageMessage::VerifyPiece { piece } => {
                let start = piece as usize * PIECE_LENGTH as usize;
                let expected = &content[start..start + PIECE_LENGTH as usize];
                let mut assembled = Vec::with_capacity(PIECE_LENGTH as usize);
                let mut offset = 0;
                while let Some(block) = blocks.get(&(piece, offset)) {
                    assembled.extend_from_slice(block);
                    offset += block.len() as u32;
                }
                let ok = assembled == expected;
                let _ = feedback_tx
                    .send(StorageFeedback::Verified { piece, ok })
                    .await;
            }
            StorageMessage::ReadBlock { peer, block } => {
                let start = block.piece as usize * PIECE_LENGTH as usize + block.offset as usize;
                let bytes = Bytes::copy_from_slice(&content[start..start + block.length as usize]);
                let _ = feedback_tx
                    .send(StorageFeedback::BlockData {
                        peer,
                        block,
                        bytes: Some(bytes),
                    })
                    .await;
            }
        }
    }
}

/// One simulated peer session: it has every piece, unchokes us right away
/// and answers each REQUEST from the content buffer.
async fn spawn_peer(handle: DownloadHandle, content: Vec<u8>, index: usize) {
    let id = Uuid::new_v4();
    let mut peer_id = [0u8; 20];
    peer_id[..16].copy_from_slice(id.as_bytes());
    let (message_tx, message_rx) = flume::bounded(PEER_CHANNEL_CAPACITY);
    let cancellation_token = CancellationToken::new();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000 + index as u16);

    let _ = handle
        .events_tx
        .send(SwarmEvent::PeerConnected(NewPeer {
            id,
            peer_id,
            addr,
            message_tx,
            cancellation_token: cancellation_token.clone(),
        }))
        .await;

    let mut field = BitField::empty(NPIECES);
    for piece in 0..NPIECES {
        field.add(piece).unwrap();
    }
    let _ = handle
        .events_tx
        .send(SwarmEvent::Message {
            peer: id,
            message: PeerMessage::Bitfield { payload: field },
        })
        .await;
    let _ = handle
        .events_tx
        .send(SwarmEvent::Message {
            peer: id,
            message: PeerMessage::Unchoke,
        })
        .await;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    let _ = handle
                        .events_tx
                        .send(SwarmEvent::PeerDisconnected { peer: id })
                        .await;
                    return;
                }
                message = message_rx.recv_async() => {
                    let Ok(message) = message else { return };
                    if let PeerMessage::Request(block) = message {
                        let start =
                            block.piece as usize * PIECE_LENGTH as usize + block.offset as usize;
                        let bytes =
                            Bytes::copy_from_slice(&content[start..start + block.length as usize]);
                        let _ = handle
                            .events_tx
                            .send(SwarmEvent::Message {
                                peer: id,
                                message: PeerMessage::Piece(DataBlock::new(
                                    block.piece,
                                    block.offset,
                                    bytes,
                                )),
                            })
                            .await;
                    }
                }
            }
        }
    });
}
