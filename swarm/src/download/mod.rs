use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bitfield::BitField;
use crate::choke::{Choker, CHOKE_INTERVAL};
use crate::download::peer::{ActivePeer, Status};
use crate::protocol::PeerMessage;
use crate::resume::ResumeFile;
use crate::scheduler::Scheduler;
use crate::storage::{StorageFeedback, StorageHandle};
use crate::tracker::{TrackerEvent, TrackerHandle};
use crate::TorrentInfo;

pub mod peer;
/// Torrent download progress types
pub mod progress;

pub use progress::{DownloadProgress, PeerProgress, ProgressConsumer, StateChange};

const TICK_DURATION: Duration = Duration::from_secs(1);
pub const EVENTS_CHANNEL_CAPACITY: usize = 1024;
/// Capacity the wire layer should give each peer's outgoing queue.
pub const PEER_CHANNEL_CAPACITY: usize = 1024;

/// A peer session the wire layer finished handshaking.
///
/// The engine owns the sending half of the session; frames the session
/// reads off the socket come back as [`SwarmEvent::Message`].
#[derive(Debug)]
pub struct NewPeer {
    pub id: Uuid,
    pub peer_id: [u8; 20],
    pub addr: SocketAddr,
    pub message_tx: flume::Sender<PeerMessage>,
    pub cancellation_token: CancellationToken,
}

/// Everything that can happen to a torrent, in one place. The dispatcher
/// consuming these is the only writer of torrent and peer state, which
/// keeps every state transition atomic and replayable.
#[derive(Debug)]
pub enum SwarmEvent {
    PeerConnected(NewPeer),
    PeerDisconnected { peer: Uuid },
    Message { peer: Uuid, message: PeerMessage },
}

#[derive(Debug)]
pub enum DownloadMessage {
    Pause,
    Resume,
    Abort,
    PostFullState {
        tx: tokio::sync::oneshot::Sender<FullState>,
    },
}

#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub events_tx: mpsc::Sender<SwarmEvent>,
    pub download_tx: mpsc::Sender<DownloadMessage>,
    pub cancellation_token: CancellationToken,
}

impl DownloadHandle {
    /// Abort the download
    pub fn abort(&self) {
        self.cancellation_token.cancel();
    }

    /// Pause the download
    pub async fn pause(&self) -> anyhow::Result<()> {
        self.download_tx.send(DownloadMessage::Pause).await?;
        Ok(())
    }

    /// Resume the download
    pub async fn resume(&self) -> anyhow::Result<()> {
        self.download_tx.send(DownloadMessage::Resume).await?;
        Ok(())
    }

    pub async fn full_state(&self) -> anyhow::Result<FullState> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.download_tx
            .send(DownloadMessage::PostFullState { tx })
            .await?;
        Ok(rx.await?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownloadState {
    Paused,
    #[default]
    Pending,
    Seeding,
    /// A content write failed; the torrent is being unloaded.
    Error,
}

impl DownloadState {
    /// While paused no peers are accepted and nothing is scheduled.
    pub fn is_paused(&self) -> bool {
        match self {
            DownloadState::Paused | DownloadState::Error => true,
            DownloadState::Pending | DownloadState::Seeding => false,
        }
    }
}

impl Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadState::Paused => write!(f, "Paused"),
            DownloadState::Pending => write!(f, "Pending"),
            DownloadState::Seeding => write!(f, "Seeding"),
            DownloadState::Error => write!(f, "Error"),
        }
    }
}

#[derive(Debug)]
pub struct FullStatePeer {
    pub addr: SocketAddr,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub in_status: Status,
    pub out_status: Status,
    pub pending_blocks: usize,
    pub snubbed: bool,
}

#[derive(Debug)]
pub struct FullState {
    pub name: String,
    pub info_hash: [u8; 20],
    pub total_pieces: usize,
    pub percent: f32,
    pub state: DownloadState,
    pub endgame: bool,
    pub bitfield: BitField,
    pub peers: Vec<FullStatePeer>,
    pub pending_pieces: Vec<u32>,
    pub tick_num: u64,
}

/// Glue between the peer sessions, the planner, the choker and the
/// external collaborators. One instance runs per torrent and is the sole
/// owner of all of its scheduling state.
#[derive(Debug)]
pub struct Download {
    scheduler: Scheduler,
    choker: Choker,
    rng: StdRng,
    state: DownloadState,
    events_rx: mpsc::Receiver<SwarmEvent>,
    storage_rx: mpsc::Receiver<StorageFeedback>,
    trackers: Vec<TrackerHandle>,
    cancellation_token: CancellationToken,
    completed_sent: bool,
    changes: Vec<StateChange>,
}

impl Download {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: TorrentInfo,
        resume: ResumeFile,
        storage: StorageHandle,
        storage_rx: mpsc::Receiver<StorageFeedback>,
        mut trackers: Vec<TrackerHandle>,
        events_rx: mpsc::Receiver<SwarmEvent>,
        cancellation_token: CancellationToken,
        seed: Option<u64>,
    ) -> Self {
        let scheduler = Scheduler::new(info, resume, storage);
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let state = if scheduler.is_finished() {
            DownloadState::Seeding
        } else {
            DownloadState::Pending
        };
        let completed_sent = scheduler.is_finished();
        let stat = scheduler.stat;
        for tracker in &mut trackers {
            tracker.announce(TrackerEvent::Started, stat, 0);
        }
        Self {
            scheduler,
            choker: Choker::new(),
            rng,
            state,
            events_rx,
            storage_rx,
            trackers,
            cancellation_token,
            completed_sent,
            changes: Vec::new(),
        }
    }

    pub fn start(
        self,
        progress: impl ProgressConsumer,
        task_tracker: &tokio_util::task::TaskTracker,
        download_rx: mpsc::Receiver<DownloadMessage>,
    ) {
        task_tracker.spawn(async move {
            if let Err(e) = self.work(progress, download_rx).await {
                tracing::error!("Torrent download quit with error: {e}");
            }
        });
    }

    async fn work(
        mut self,
        mut progress: impl ProgressConsumer,
        mut commands_rx: mpsc::Receiver<DownloadMessage>,
    ) -> anyhow::Result<()> {
        tracing::info!(name = %self.scheduler.info.name, "Starting download");
        let mut tick_interval = tokio::time::interval(TICK_DURATION);
        tick_interval.tick().await;
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(feedback) = self.storage_rx.recv() => self.handle_storage_feedback(feedback),
                Some(command) = commands_rx.recv() => self.handle_command(command),
                _ = tick_interval.tick() => {
                    self.handle_tick();
                    self.dispatch_progress(&mut progress);
                }
                _ = self.cancellation_token.cancelled() => {
                    self.handle_shutdown();
                    return Ok(());
                }
            }
        }
    }

    /// The dispatcher: every state mutation starts here.
    pub fn handle_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::PeerConnected(new_peer) => self.handle_new_peer(new_peer),
            SwarmEvent::PeerDisconnected { peer } => self.handle_lost_peer(peer),
            SwarmEvent::Message { peer, message } => {
                let Some(idx) = self.scheduler.peer_idx(&peer) else {
                    tracing::trace!("Message from a detached peer");
                    return;
                };
                if let Err(e) = self.handle_peer_message(idx, message) {
                    let error = crate::Error::Protocol(e.to_string());
                    tracing::warn!(
                        addr = %self.scheduler.peers[idx].addr,
                        "Disconnecting misbehaving peer: {error}"
                    );
                    let peer = self.scheduler.remove_peer(idx, &mut self.rng);
                    peer.cancel();
                    self.changes.push(StateChange::PeerDisconnect(peer.addr));
                }
            }
        }
    }

    fn handle_peer_message(&mut self, idx: usize, message: PeerMessage) -> anyhow::Result<()> {
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.scheduler.handle_peer_choke(idx, &mut self.rng),
            PeerMessage::Unchoke => self.scheduler.handle_peer_unchoke(idx, &mut self.rng),
            PeerMessage::Interested => self.scheduler.handle_peer_interest(idx),
            PeerMessage::NotInterested => self.scheduler.handle_peer_uninterest(idx),
            PeerMessage::Have { index } => {
                self.scheduler.handle_peer_have(idx, index, &mut self.rng)?
            }
            PeerMessage::Bitfield { payload } => {
                self.scheduler.handle_peer_bitfield(idx, payload)?
            }
            PeerMessage::Request(block) => self.scheduler.handle_peer_request(idx, block)?,
            PeerMessage::Piece(data) => self.scheduler.save_block(idx, data, &mut self.rng)?,
            PeerMessage::Cancel(block) => self.scheduler.handle_peer_cancel(idx, block),
        }
        Ok(())
    }

    fn handle_new_peer(&mut self, new_peer: NewPeer) {
        if self.state.is_paused() {
            new_peer.cancellation_token.cancel();
            return;
        }
        if self.scheduler.has_peer_id(&new_peer.peer_id) {
            tracing::debug!(addr = %new_peer.addr, "Dropping duplicate peer session");
            new_peer.cancellation_token.cancel();
            return;
        }
        tracing::debug!(addr = %new_peer.addr, "Peer attached");
        let addr = new_peer.addr;
        let peer = ActivePeer::new(
            new_peer,
            self.scheduler.info.npieces(),
            self.scheduler.clock(),
        );
        self.scheduler.add_peer(peer);
        self.changes.push(StateChange::PeerConnect(addr));
    }

    fn handle_lost_peer(&mut self, peer: Uuid) {
        let Some(idx) = self.scheduler.peer_idx(&peer) else {
            // already killed for a protocol violation
            return;
        };
        let peer = self.scheduler.remove_peer(idx, &mut self.rng);
        peer.cancel();
        self.changes.push(StateChange::PeerDisconnect(peer.addr));
    }

    pub fn handle_storage_feedback(&mut self, feedback: StorageFeedback) {
        match feedback {
            StorageFeedback::Verified { piece, ok } => {
                self.scheduler
                    .handle_piece_verified(piece, ok, &mut self.rng);
                if !ok {
                    return;
                }
                self.changes.push(StateChange::FinishedPiece(piece));
                if self.scheduler.is_finished() {
                    if self.state != DownloadState::Seeding {
                        self.set_state(DownloadState::Seeding);
                    }
                    if !self.completed_sent {
                        self.completed_sent = true;
                        let stat = self.scheduler.stat;
                        let clock = self.scheduler.clock();
                        for tracker in &mut self.trackers {
                            tracker.announce(TrackerEvent::Completed, stat, clock);
                        }
                        self.changes
                            .push(StateChange::TrackerAnnounce(TrackerEvent::Completed));
                    }
                }
            }
            StorageFeedback::BlockData { peer, block, bytes } => {
                self.scheduler.handle_block_read(peer, block, bytes);
            }
            StorageFeedback::WriteFailed { piece } => {
                tracing::error!(piece, "Content write failed, unloading the torrent");
                self.set_state(DownloadState::Error);
                self.cancellation_token.cancel();
            }
        }
    }

    /// One second of wall clock.
    pub fn handle_tick(&mut self) {
        if !self.state.is_paused() {
            self.scheduler.tick(&mut self.rng);
            if self.scheduler.clock() % CHOKE_INTERVAL == 0 {
                self.choker.rechoke(
                    &mut self.scheduler,
                    self.state == DownloadState::Seeding,
                    &mut self.rng,
                );
            }
        }
        let stat = self.scheduler.stat;
        let clock = self.scheduler.clock();
        for tracker in &mut self.trackers {
            if tracker.due(clock) {
                tracker.announce(TrackerEvent::Empty, stat, clock);
                self.changes
                    .push(StateChange::TrackerAnnounce(TrackerEvent::Empty));
            }
        }
    }

    pub fn handle_command(&mut self, command: DownloadMessage) {
        match command {
            DownloadMessage::Pause => self.set_state(DownloadState::Paused),
            DownloadMessage::Resume => {
                if self.scheduler.is_finished() {
                    self.set_state(DownloadState::Seeding);
                } else {
                    self.set_state(DownloadState::Pending);
                }
            }
            DownloadMessage::Abort => {
                tracing::debug!("Aborting torrent download");
                self.cancellation_token.cancel();
            }
            DownloadMessage::PostFullState { tx } => {
                let _ = tx.send(self.full_state());
            }
        }
    }

    fn set_state(&mut self, new_state: DownloadState) {
        if new_state == self.state {
            tracing::warn!(%new_state, "Redundant state change");
            return;
        }
        tracing::info!(from = %self.state, to = %new_state, "Download state change");
        if !self.state.is_paused() && new_state.is_paused() {
            // peers will come back as disconnect events
            for peer in &self.scheduler.peers {
                peer.cancel();
            }
        }
        self.state = new_state;
        self.changes
            .push(StateChange::DownloadStateChange(new_state));
    }

    fn dispatch_progress(&mut self, consumer: &mut impl ProgressConsumer) {
        let peers = self
            .scheduler
            .peers
            .iter()
            .map(|p| PeerProgress {
                addr: p.addr,
                downloaded: p.downloaded,
                uploaded: p.uploaded,
                download_speed: p.rate_down.bytes_per_second(),
                upload_speed: p.rate_up.bytes_per_second(),
                pending_blocks: p.requests_out.len(),
                snubbed: p.snubbed,
            })
            .collect();
        let mut changes = Vec::new();
        changes.append(&mut self.changes);
        consumer.consume_progress(DownloadProgress {
            tick_num: self.scheduler.clock(),
            percent: self.scheduler.downloaded_percent(),
            peers,
            changes,
        });
    }

    pub fn full_state(&self) -> FullState {
        let peers = self
            .scheduler
            .peers
            .iter()
            .map(|p| FullStatePeer {
                addr: p.addr,
                downloaded: p.downloaded,
                uploaded: p.uploaded,
                download_speed: p.rate_down.bytes_per_second(),
                upload_speed: p.rate_up.bytes_per_second(),
                in_status: p.in_status,
                out_status: p.out_status,
                pending_blocks: p.requests_out.len(),
                snubbed: p.snubbed,
            })
            .collect();
        FullState {
            name: self.scheduler.info.name.clone(),
            info_hash: self.scheduler.info.info_hash,
            total_pieces: self.scheduler.info.npieces(),
            percent: self.scheduler.downloaded_percent(),
            state: self.state,
            endgame: self.scheduler.endgame,
            bitfield: self.scheduler.have.clone(),
            peers,
            pending_pieces: self.scheduler.downloads.iter().map(|pc| pc.index).collect(),
            tick_num: self.scheduler.clock(),
        }
    }

    fn handle_shutdown(&mut self) {
        tracing::info!("Shutting down download");
        let stat = self.scheduler.stat;
        let clock = self.scheduler.clock();
        for tracker in &mut self.trackers {
            tracker.announce(TrackerEvent::Stopped, stat, clock);
        }
        if let Err(e) = self.scheduler.resume.flush() {
            tracing::error!("Failed to flush the resume file: {e}");
        }
        for peer in &self.scheduler.peers {
            peer.cancel();
        }
    }
}
