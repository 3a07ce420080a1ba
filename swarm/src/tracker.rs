//! Channel interface to the external tracker client.

use tokio::sync::mpsc;

pub const DEFAULT_ANNOUNCE_INTERVAL: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum TrackerEvent {
    #[default]
    Empty,
    Started,
    Stopped,
    Completed,
}

/// Byte counters shipped with every announce.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DownloadStat {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

impl DownloadStat {
    pub fn new(left: u64) -> Self {
        Self {
            downloaded: 0,
            uploaded: 0,
            left,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Announce {
    pub event: TrackerEvent,
    pub stat: DownloadStat,
}

/// One tracker the torrent reports to. The actual HTTP/UDP client runs
/// elsewhere and owns the other end of `announce_tx`; discovered peers
/// come back through the wire layer, not through the engine.
#[derive(Debug)]
pub struct TrackerHandle {
    pub announce_tx: mpsc::Sender<Announce>,
    /// Seconds between periodic refreshes.
    pub announce_interval: u64,
    pub last_announce_tick: u64,
}

impl TrackerHandle {
    pub fn new(announce_tx: mpsc::Sender<Announce>) -> Self {
        Self {
            announce_tx,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            last_announce_tick: 0,
        }
    }

    pub fn announce(&mut self, event: TrackerEvent, stat: DownloadStat, tick: u64) {
        if let Err(e) = self.announce_tx.try_send(Announce { event, stat }) {
            tracing::warn!("Dropping tracker announce: {e}");
        }
        self.last_announce_tick = tick;
    }

    /// Time for a periodic refresh?
    pub fn due(&self, tick: u64) -> bool {
        tick.saturating_sub(self.last_announce_tick) >= self.announce_interval
    }
}
