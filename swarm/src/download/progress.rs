//! Torrent download progress types.

use std::net::SocketAddr;

use super::DownloadState;
use crate::tracker::TrackerEvent;

/// Per-tick snapshot pushed to the progress consumer.
#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    pub tick_num: u64,
    pub percent: f32,
    pub peers: Vec<PeerProgress>,
    pub changes: Vec<StateChange>,
}

impl DownloadProgress {
    pub fn download_speed(&self) -> u64 {
        self.peers.iter().map(|p| p.download_speed).sum()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerProgress {
    pub addr: SocketAddr,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub pending_blocks: usize,
    pub snubbed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    FinishedPiece(u32),
    DownloadStateChange(DownloadState),
    TrackerAnnounce(TrackerEvent),
    PeerConnect(SocketAddr),
    PeerDisconnect(SocketAddr),
}

pub trait ProgressConsumer: Send + 'static {
    fn consume_progress(&mut self, progress: DownloadProgress);
}

impl<F> ProgressConsumer for F
where
    F: FnMut(DownloadProgress) + Send + 'static,
{
    fn consume_progress(&mut self, progress: DownloadProgress) {
        self(progress);
    }
}

impl ProgressConsumer for tokio::sync::mpsc::Sender<DownloadProgress> {
    fn consume_progress(&mut self, progress: DownloadProgress) {
        let _ = self.try_send(progress);
    }
}

impl ProgressConsumer for tokio::sync::watch::Sender<DownloadProgress> {
    fn consume_progress(&mut self, progress: DownloadProgress) {
        let _ = self.send(progress);
    }
}

impl ProgressConsumer for flume::Sender<DownloadProgress> {
    fn consume_progress(&mut self, progress: DownloadProgress) {
        let _ = self.send(progress);
    }
}

impl ProgressConsumer for () {
    fn consume_progress(&mut self, _progress: DownloadProgress) {}
}
