use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bitfield::BitField;
use crate::download::NewPeer;
use crate::protocol::{Block, PeerMessage};
use crate::scheduler::REQUEST_QUEUE_DEPTH;

/// Choke/interest stance of one side of a connection.
///
/// Every connection starts choked and not interested in both directions.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    choked: bool,
    interested: bool,
    last_choke_change: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            choked: true,
            interested: false,
            last_choke_change: 0,
        }
    }
}

impl Status {
    pub fn set_choke(&mut self, force: bool, tick: u64) {
        self.choked = force;
        self.last_choke_change = tick;
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_interest(&mut self, force: bool) {
        self.interested = force;
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }

    /// Tick of the most recent choke flip, used as a rechoke tiebreaker.
    pub fn last_choke_change(&self) -> u64 {
        self.last_choke_change
    }
}

/// Byte-rate estimate with a 20 second half-life.
///
/// Bytes are accumulated as transfers land and folded into the estimate on
/// the 1 Hz tick, so the value decays smoothly while a peer stays silent.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateEstimate {
    rate: f64,
    accumulated: u64,
}

// 0.5^(1/20), the per-second decay that halves the estimate in 20 s
const RATE_DECAY: f64 = 0.965_936_3;

impl RateEstimate {
    pub fn record(&mut self, bytes: u64) {
        self.accumulated += bytes;
    }

    pub fn tick(&mut self) {
        self.rate = self.rate * RATE_DECAY + self.accumulated as f64 * (1.0 - RATE_DECAY);
        self.accumulated = 0;
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.rate as u64
    }
}

/// Engine-side state of one live peer session.
///
/// The wire session itself runs elsewhere; this struct is what the
/// dispatcher owns and mutates. Outgoing messages leave through
/// `message_tx`, and the cancellation token tears the session down.
#[derive(Debug)]
pub struct ActivePeer {
    pub id: Uuid,
    /// Peer id from the wire handshake, used to reject duplicate sessions.
    pub peer_id: [u8; 20],
    pub addr: SocketAddr,
    pub message_tx: flume::Sender<PeerMessage>,
    pub bitfield: BitField,
    /// Set bits in `bitfield`, kept so the choker never recounts.
    pub npieces: usize,
    /// The peer's stance towards us.
    pub in_status: Status,
    /// Our stance towards the peer.
    pub out_status: Status,
    /// Blocks the peer owes us, in request order.
    pub requests_out: VecDeque<Block>,
    /// Blocks we owe the peer, awaiting disk reads.
    pub requests_in: VecDeque<Block>,
    /// Pieces the peer has that we still lack.
    pub wanted: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub rate_down: RateEstimate,
    pub rate_up: RateEstimate,
    pub connected_tick: u64,
    pub last_block_tick: u64,
    pub snubbed: bool,
    pub bitfield_sent: bool,
    pub bitfield_received: bool,
    pub cancellation_token: CancellationToken,
}

impl ActivePeer {
    pub fn new(peer: NewPeer, npieces: usize, tick: u64) -> Self {
        Self {
            id: peer.id,
            peer_id: peer.peer_id,
            addr: peer.addr,
            message_tx: peer.message_tx,
            bitfield: BitField::empty(npieces),
            npieces: 0,
            in_status: Status::default(),
            out_status: Status::default(),
            requests_out: VecDeque::new(),
            requests_in: VecDeque::new(),
            wanted: 0,
            downloaded: 0,
            uploaded: 0,
            rate_down: RateEstimate::default(),
            rate_up: RateEstimate::default(),
            connected_tick: tick,
            last_block_tick: tick,
            snubbed: false,
            bitfield_sent: false,
            bitfield_received: false,
            cancellation_token: peer.cancellation_token,
        }
    }

    /// Queue an outgoing wire message. A full queue means the session is
    /// wedged; the stall timeout will deal with the peer, so the message
    /// is dropped with a note rather than blocking the loop.
    pub fn send(&self, message: PeerMessage) {
        if let Err(e) = self.message_tx.try_send(message) {
            tracing::warn!(addr = %self.addr, "Dropping outgoing message: {e}");
        }
    }

    pub fn set_out_choke(&mut self, force: bool, tick: u64) {
        debug_assert_ne!(self.out_status.is_choked(), force);
        tracing::debug!(addr = %self.addr, "Setting out choke status to {force}");
        match force {
            true => self.send(PeerMessage::Choke),
            false => self.send(PeerMessage::Unchoke),
        }
        self.out_status.set_choke(force, tick);
    }

    pub fn set_out_interest(&mut self, force: bool) {
        debug_assert_ne!(self.out_status.is_interested(), force);
        tracing::debug!(addr = %self.addr, "Setting out interest status to {force}");
        match force {
            true => self.send(PeerMessage::Interested),
            false => self.send(PeerMessage::NotInterested),
        }
        self.out_status.set_interest(force);
    }

    /// How many requests we keep outstanding with this peer. Snubbed peers
    /// are pinned to a single probe request until a block arrives.
    pub fn request_depth(&self) -> usize {
        if self.snubbed {
            1
        } else {
            REQUEST_QUEUE_DEPTH
        }
    }

    pub fn find_request(&self, piece: u32, offset: u32) -> Option<usize> {
        self.requests_out
            .iter()
            .position(|r| r.piece == piece && r.offset == offset)
    }

    pub fn has_request(&self, piece: u32, offset: u32) -> bool {
        self.find_request(piece, offset).is_some()
    }

    /// Tear the wire session down; the disconnect comes back as an event.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }
}
