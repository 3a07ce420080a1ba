//! BitTorrent download scheduler and peer-exchange engine.
//!
//! The crate owns the hard part of a BitTorrent client: deciding which
//! blocks to request from which peers, which peers deserve upload slots,
//! and keeping both consistent across chokes, disconnects and bad data.
//! Everything else (metainfo parsing, tracker clients, disk I/O and
//! hashing, the wire codec) lives outside and talks to the engine over
//! channels.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

mod bitfield;
mod choke;
mod download;
mod error;
mod picker;
mod piece;
mod protocol;
mod resume;
mod scheduler;
mod storage;
mod tracker;

pub use bitfield::BitField;
pub use choke::{CHOKE_INTERVAL, MAX_UPLOADS};
pub use download::peer::Status;
pub use download::{
    Download, DownloadHandle, DownloadMessage, DownloadProgress, DownloadState, FullState,
    FullStatePeer, NewPeer, PeerProgress, ProgressConsumer, StateChange, SwarmEvent,
    EVENTS_CHANNEL_CAPACITY, PEER_CHANNEL_CAPACITY,
};
pub use error::Error;
pub use protocol::{Block, DataBlock, PeerMessage, BLOCK_LENGTH};
pub use resume::ResumeFile;
pub use scheduler::{REQUEST_QUEUE_DEPTH, SNUB_TIMEOUT};
pub use storage::{StorageFeedback, StorageHandle, StorageMessage};
pub use tracker::{Announce, DownloadStat, TrackerEvent, TrackerHandle};

/// Immutable metainfo snapshot the engine plans against.
///
/// Parsing `.torrent` files into this is the loader's job; the per-piece
/// digests are carried for the disk collaborator, which does the hashing.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl TorrentInfo {
    pub fn npieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of `piece`, short only for the last one.
    pub fn piece_size(&self, piece: u32) -> u32 {
        let npieces = self.npieces() as u64;
        if (piece as u64) + 1 < npieces {
            self.piece_length
        } else {
            (self.total_length - (npieces - 1) * self.piece_length as u64) as u32
        }
    }
}

/// Everything a single torrent needs to run.
#[derive(Debug)]
pub struct TorrentParams {
    pub info: TorrentInfo,
    /// Torrent directory; the resume file lives at `<directory>/resume`.
    pub directory: PathBuf,
    pub storage: StorageHandle,
    pub storage_rx: mpsc::Receiver<StorageFeedback>,
    pub trackers: Vec<TrackerHandle>,
}

#[derive(Debug)]
pub struct ClientConfig {
    /// Seed for the engine's PRNG; pass one to make piece tiebreaks and
    /// optimistic unchokes reproducible.
    pub seed: Option<u64>,
    pub cancellation_token: Option<CancellationToken>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seed: None,
            cancellation_token: Some(CancellationToken::new()),
        }
    }
}

/// Process-wide torrent registry and lifecycle manager.
///
/// Owns one [`Download`] task per loaded torrent, keyed by info hash.
#[derive(Debug)]
pub struct Client {
    torrents: HashMap<[u8; 20], DownloadHandle>,
    seed: Option<u64>,
    cancellation_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            torrents: HashMap::new(),
            seed: config.seed,
            cancellation_token: config.cancellation_token.unwrap_or_default(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Load a torrent and start its download task. Fails without touching
    /// the registry when the info hash is already loaded or the resume
    /// file does not match the metainfo.
    pub fn open(
        &mut self,
        params: TorrentParams,
        progress: impl ProgressConsumer,
    ) -> Result<DownloadHandle, Error> {
        let info_hash = params.info.info_hash;
        if self.torrents.contains_key(&info_hash) {
            return Err(Error::Duplicate);
        }
        let resume_path = params.directory.join("resume");
        let resume = ResumeFile::load_or_create(
            &resume_path,
            params.info.npieces(),
            params.info.piece_length,
        )?;
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let (download_tx, download_rx) = mpsc::channel(64);
        let cancellation_token = self.cancellation_token.child_token();
        let download = Download::new(
            params.info,
            resume,
            params.storage,
            params.storage_rx,
            params.trackers,
            events_rx,
            cancellation_token.clone(),
            self.seed,
        );
        let handle = DownloadHandle {
            events_tx,
            download_tx,
            cancellation_token,
        };
        download.start(progress, &self.task_tracker, download_rx);
        self.torrents.insert(info_hash, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, info_hash: &[u8; 20]) -> Option<&DownloadHandle> {
        self.torrents.get(info_hash)
    }

    /// Unload a torrent: final tracker STOPPED, resume flush, peers torn
    /// down. The rest of the client keeps running.
    pub fn unload(&mut self, info_hash: &[u8; 20]) -> Result<(), Error> {
        let handle = self
            .torrents
            .remove(info_hash)
            .ok_or_else(|| Error::Config("torrent is not loaded".to_string()))?;
        handle.abort();
        Ok(())
    }

    /// Cancel every torrent and wait for their tasks to finish.
    pub async fn shutdown(&mut self) {
        self.torrents.clear();
        self.task_tracker.close();
        self.cancellation_token.cancel();
        self.task_tracker.wait().await;
    }
}
