use bytes::Bytes;
use rand::rngs::StdRng;
use uuid::Uuid;

use crate::bitfield::BitField;
use crate::download::peer::ActivePeer;
use crate::error::Error;
use crate::picker::PiecePicker;
use crate::piece::PieceDownload;
use crate::protocol::{Block, DataBlock, PeerMessage, BLOCK_LENGTH};
use crate::resume::ResumeFile;
use crate::storage::StorageHandle;
use crate::tracker::DownloadStat;
use crate::TorrentInfo;

/// Outstanding requests we keep queued with every able peer.
pub const REQUEST_QUEUE_DEPTH: usize = 5;
/// Ticks without a delivered block before a non-choking peer is snubbed.
pub const SNUB_TIMEOUT: u64 = 60;

/// Per-torrent planner state: the have/busy fields, the rarity index, the
/// pieces in flight and every live peer session.
///
/// All mutation funnels through the event dispatcher, so the planner's
/// bookkeeping is consistent again by the time any method returns.
#[derive(Debug)]
pub struct Scheduler {
    pub info: TorrentInfo,
    pub have: BitField,
    pub have_count: usize,
    /// Pieces currently being downloaded.
    pub busy: BitField,
    pub picker: PiecePicker,
    /// In-flight pieces, insertion order.
    pub downloads: Vec<PieceDownload>,
    pub peers: Vec<ActivePeer>,
    pub endgame: bool,
    pub resume: ResumeFile,
    pub storage: StorageHandle,
    pub stat: DownloadStat,
    pub hash_failures: u64,
    clock: u64,
}

impl Scheduler {
    pub fn new(info: TorrentInfo, resume: ResumeFile, storage: StorageHandle) -> Self {
        let npieces = info.npieces();
        let have = resume.have_field();
        let have_count = have.count_ones();
        let mut scheduler = Self {
            have,
            have_count,
            busy: BitField::empty(npieces),
            picker: PiecePicker::new(npieces),
            downloads: Vec::new(),
            peers: Vec::new(),
            endgame: false,
            resume,
            storage,
            stat: DownloadStat::default(),
            hash_failures: 0,
            clock: 0,
            info,
        };
        scheduler.stat.left = scheduler.bytes_left();
        scheduler
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn peer_idx(&self, id: &Uuid) -> Option<usize> {
        self.peers.iter().position(|p| p.id == *id)
    }

    pub fn has_peer_id(&self, peer_id: &[u8; 20]) -> bool {
        self.peers.iter().any(|p| p.peer_id == *peer_id)
    }

    pub fn is_finished(&self) -> bool {
        self.have_count == self.info.npieces()
    }

    pub fn downloaded_percent(&self) -> f32 {
        self.have_count as f32 / self.info.npieces() as f32 * 100.
    }

    pub fn bytes_left(&self) -> u64 {
        (0..self.info.npieces())
            .filter(|&piece| !self.have.has(piece))
            .map(|piece| self.info.piece_size(piece as u32) as u64)
            .sum()
    }

    pub fn add_peer(&mut self, mut peer: ActivePeer) {
        if self.have_count > 0 {
            peer.send(PeerMessage::Bitfield {
                payload: self.have.clone(),
            });
            peer.bitfield_sent = true;
        }
        self.peers.push(peer);
    }

    /// Detach a peer and clean every piece of its traces synchronously.
    pub fn remove_peer(&mut self, idx: usize, rng: &mut StdRng) -> ActivePeer {
        let mut peer = self.peers.remove(idx);
        tracing::debug!(addr = %peer.addr, "Detaching peer");
        self.picker.peer_lost(&peer.bitfield);
        let requests: Vec<Block> = peer.requests_out.drain(..).collect();
        self.release_requests(peer.id, requests, rng);
        peer
    }

    pub fn handle_peer_choke(&mut self, idx: usize, rng: &mut StdRng) {
        let clock = self.clock;
        self.peers[idx].in_status.set_choke(true, clock);
        self.unassign_requests(idx, rng);
    }

    pub fn handle_peer_unchoke(&mut self, idx: usize, rng: &mut StdRng) {
        let clock = self.clock;
        self.peers[idx].in_status.set_choke(false, clock);
        if self.peers[idx].out_status.is_interested() {
            self.assign_requests(idx, rng);
        }
    }

    pub fn handle_peer_interest(&mut self, idx: usize) {
        self.peers[idx].in_status.set_interest(true);
    }

    /// Upload slots are re-evaluated at the next choke boundary, not here.
    pub fn handle_peer_uninterest(&mut self, idx: usize) {
        self.peers[idx].in_status.set_interest(false);
    }

    pub fn handle_peer_have(
        &mut self,
        idx: usize,
        index: u32,
        rng: &mut StdRng,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            (index as usize) < self.info.npieces(),
            "have index {index} out of range"
        );
        if self.peers[idx].bitfield.has(index as usize) {
            return Ok(());
        }
        self.peers[idx].bitfield.add(index as usize)?;
        self.peers[idx].npieces += 1;
        self.picker.piece_seen(index as usize);
        if self.have.has(index as usize) {
            return Ok(());
        }
        let peer = &mut self.peers[idx];
        peer.wanted += 1;
        if !peer.out_status.is_interested() {
            peer.set_out_interest(true);
        }
        let peer = &self.peers[idx];
        if !peer.in_status.is_choked() && peer.requests_out.len() < peer.request_depth() {
            self.assign_requests(idx, rng);
        }
        Ok(())
    }

    pub fn handle_peer_bitfield(&mut self, idx: usize, payload: BitField) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.peers[idx].bitfield_received && self.peers[idx].npieces == 0,
            "bitfield must be the first message"
        );
        payload.validate(self.info.npieces())?;
        let wanted = payload.pieces().filter(|&i| !self.have.has(i)).count();
        self.picker.peer_joined(&payload);
        let npieces = payload.count_ones();
        let peer = &mut self.peers[idx];
        peer.bitfield_received = true;
        peer.npieces = npieces;
        peer.wanted = wanted;
        peer.bitfield = payload;
        if wanted > 0 && !peer.out_status.is_interested() {
            peer.set_out_interest(true);
        }
        Ok(())
    }

    pub fn handle_peer_request(&mut self, idx: usize, block: Block) -> anyhow::Result<()> {
        anyhow::ensure!(
            block.length <= BLOCK_LENGTH,
            "oversize request for {} bytes",
            block.length
        );
        anyhow::ensure!(block.length > 0, "empty request");
        anyhow::ensure!(
            (block.piece as usize) < self.info.npieces(),
            "request for piece {} out of range",
            block.piece
        );
        let piece_size = self.info.piece_size(block.piece);
        anyhow::ensure!(
            block
                .offset
                .checked_add(block.length)
                .is_some_and(|end| end <= piece_size),
            "request past the end of piece {}",
            block.piece
        );
        anyhow::ensure!(
            self.have.has(block.piece as usize),
            "request for piece {} we do not have",
            block.piece
        );
        let peer = &self.peers[idx];
        if peer.out_status.is_choked() || !peer.in_status.is_interested() {
            tracing::trace!(addr = %peer.addr, "Ignoring request from a choked peer");
            return Ok(());
        }
        if self.storage.try_read_block(peer.id, block).is_ok() {
            self.peers[idx].requests_in.push_back(block);
        } else {
            tracing::warn!("Dropping peer request, disk queue is full");
        }
        Ok(())
    }

    pub fn handle_peer_cancel(&mut self, idx: usize, block: Block) {
        let peer = &mut self.peers[idx];
        if let Some(pos) = peer.requests_in.iter().position(|r| *r == block) {
            let _ = peer.requests_in.remove(pos);
        }
    }

    /// A disk read came back; forward the block unless the peer cancelled
    /// or got choked in the meantime.
    pub fn handle_block_read(&mut self, peer_id: Uuid, block: Block, bytes: Option<Bytes>) {
        let Some(idx) = self.peer_idx(&peer_id) else {
            return;
        };
        let Some(pos) = self.peers[idx].requests_in.iter().position(|r| *r == block) else {
            return;
        };
        let _ = self.peers[idx].requests_in.remove(pos);
        let Some(bytes) = bytes else {
            tracing::warn!("Disk read for {block} failed, dropping the send");
            return;
        };
        let peer = &mut self.peers[idx];
        if peer.out_status.is_choked() {
            return;
        }
        peer.uploaded += bytes.len() as u64;
        peer.rate_up.record(bytes.len() as u64);
        peer.send(PeerMessage::Piece(DataBlock::new(
            block.piece,
            block.offset,
            bytes,
        )));
        self.stat.uploaded += block.length as u64;
    }

    /// PIECE receipt: the heart of the download path.
    pub fn save_block(
        &mut self,
        idx: usize,
        data: DataBlock,
        rng: &mut StdRng,
    ) -> anyhow::Result<()> {
        let block = data.block();
        anyhow::ensure!(
            (block.piece as usize) < self.info.npieces(),
            "piece index {} out of range",
            block.piece
        );
        anyhow::ensure!(
            block.offset % BLOCK_LENGTH == 0,
            "misaligned block offset {}",
            block.offset
        );

        let Some(pos) = self.peers[idx].find_request(block.piece, block.offset) else {
            // stale delivery racing a choke or an end game cancel
            tracing::trace!(addr = %self.peers[idx].addr, "Dropping unsolicited {block}");
            return Ok(());
        };
        let expected = self.peers[idx].requests_out[pos].length;
        anyhow::ensure!(
            block.length == expected,
            "block length {} does not match the requested {expected}",
            block.length
        );

        let _ = self.peers[idx].requests_out.remove(pos);
        let peer_id = self.peers[idx].id;
        {
            let peer = &mut self.peers[idx];
            peer.downloaded += block.length as u64;
            peer.rate_down.record(block.length as u64);
            peer.last_block_tick = self.clock;
            peer.snubbed = false;
        }
        self.stat.downloaded += block.length as u64;

        let Some(pc_idx) = self.downloads.iter().position(|pc| pc.index == block.piece) else {
            debug_assert!(false, "request matched a piece not in progress");
            return Ok(());
        };

        if let Err(e) = self.storage.try_write_block(data) {
            // disk queue saturated; hand the block back to the planner
            tracing::warn!("Dropping {block}, disk queue is full: {e}");
            self.release_requests(peer_id, vec![block], rng);
            return Ok(());
        }
        self.resume.set_block(block.piece, block.index());

        // duplicates are cancelled before the planner learns the block is ours
        if self.downloads[pc_idx].endgame && self.downloads[pc_idx].nreqs(block.index()) > 1 {
            self.cancel_duplicates(pc_idx, block, peer_id);
        }
        self.downloads[pc_idx].record_block(block.index());
        if !self.peers[idx]
            .requests_out
            .iter()
            .any(|r| r.piece == block.piece)
        {
            self.downloads[pc_idx].unassign_peer(&peer_id);
        }

        if self.downloads[pc_idx].is_complete() {
            tracing::debug!(piece = block.piece, "All blocks received, queueing verification");
            if let Err(e) = self.storage.try_verify_piece(block.piece) {
                tracing::warn!("Failed to queue piece verification: {e}");
            }
        }

        let peer = &self.peers[idx];
        if !peer.in_status.is_choked()
            && peer.out_status.is_interested()
            && peer.requests_out.len() < peer.request_depth()
        {
            self.assign_requests(idx, rng);
        }
        Ok(())
    }

    fn cancel_duplicates(&mut self, pc_idx: usize, block: Block, receiver: Uuid) {
        for p_idx in 0..self.peers.len() {
            if self.peers[p_idx].id == receiver {
                continue;
            }
            let Some(pos) = self.peers[p_idx].find_request(block.piece, block.offset) else {
                continue;
            };
            if let Some(request) = self.peers[p_idx].requests_out.remove(pos) {
                self.peers[p_idx].send(PeerMessage::Cancel(request));
            }
            self.downloads[pc_idx].remove_request(block.index());
            let peer_id = self.peers[p_idx].id;
            if !self.peers[p_idx]
                .requests_out
                .iter()
                .any(|r| r.piece == block.piece)
            {
                self.downloads[pc_idx].unassign_peer(&peer_id);
            }
        }
    }

    pub fn handle_piece_verified(&mut self, piece: u32, ok: bool, rng: &mut StdRng) {
        let Some(pc_idx) = self.downloads.iter().position(|pc| pc.index == piece) else {
            tracing::warn!(piece, "Verification result for a piece not in progress");
            return;
        };
        if ok {
            self.on_ok_piece(pc_idx);
        } else {
            self.on_bad_piece(pc_idx, rng);
        }
    }

    fn on_ok_piece(&mut self, pc_idx: usize) {
        let pc = self.downloads.remove(pc_idx);
        let piece = pc.index;
        debug_assert!(pc.is_complete());
        debug_assert_eq!(pc.nreqs_total, 0);
        self.busy.remove(piece as usize).unwrap();
        self.have.add(piece as usize).unwrap();
        self.have_count += 1;
        self.stat.left -= self.info.piece_size(piece) as u64;
        self.resume.set_have(piece);
        if let Err(e) = self.resume.flush() {
            tracing::error!("Failed to flush the resume file: {e}");
        }
        tracing::debug!(piece, have = self.have_count, "Piece verified and stored");

        // every attached peer hears about the piece before any further
        // planning can touch it
        for peer in &mut self.peers {
            peer.send(PeerMessage::Have { index: piece });
            if peer.bitfield.has(piece as usize) {
                debug_assert!(peer.wanted > 0);
                peer.wanted -= 1;
                if peer.wanted == 0
                    && peer.out_status.is_interested()
                    && peer.requests_out.is_empty()
                {
                    peer.set_out_interest(false);
                }
            }
        }

        if self.is_finished() {
            self.endgame = false;
            debug_assert!(self.downloads.is_empty());
            tracing::info!("Torrent complete, switching to seeding");
            for peer in &mut self.peers {
                if peer.out_status.is_interested() {
                    peer.set_out_interest(false);
                }
            }
        }
    }

    fn on_bad_piece(&mut self, pc_idx: usize, rng: &mut StdRng) {
        let piece = self.downloads[pc_idx].index;
        self.hash_failures += 1;
        tracing::warn!(
            failures = self.hash_failures,
            "{}",
            Error::HashMismatch { piece }
        );
        self.downloads[pc_idx].reset();
        self.resume.clear_blocks(piece);
        // the piece stays busy; capable peers pick its blocks up again
        self.on_piece_unfull(piece, rng);
    }

    /// Keep `peer` at its target queue depth. Returns how many new
    /// requests went out.
    pub fn assign_requests(&mut self, idx: usize, rng: &mut StdRng) -> usize {
        if self.endgame {
            let mut assigned = self.assign_requests_endgame(idx);
            // a late peer can still bring pieces nobody else offered
            loop {
                if self.peers[idx].requests_out.len() >= self.peers[idx].request_depth() {
                    break;
                }
                let started = {
                    let peer = &self.peers[idx];
                    self.picker
                        .pick_rarest(&peer.bitfield, &self.have, &self.busy, rng)
                };
                match started {
                    Some(piece) => {
                        self.start_piece(piece);
                        assigned += self.assign_requests_endgame(idx);
                    }
                    None => break,
                }
            }
            return assigned;
        }
        debug_assert!(!self.peers[idx].in_status.is_choked());
        debug_assert!(self.peers[idx].out_status.is_interested());
        let mut assigned = 0;
        loop {
            let depth = self.peers[idx].request_depth();
            if self.peers[idx].requests_out.len() >= depth {
                break;
            }
            // prefer pieces already in flight, fewest downloaders first,
            // insertion order on ties
            let pick = {
                let peer = &self.peers[idx];
                self.downloads
                    .iter()
                    .enumerate()
                    .filter(|(_, pc)| !pc.is_full() && peer.bitfield.has(pc.index as usize))
                    .min_by_key(|(_, pc)| pc.assigned.len())
                    .map(|(pc_idx, _)| pc_idx)
            };
            let Some(pc_idx) = pick else {
                let started = {
                    let peer = &self.peers[idx];
                    self.picker
                        .pick_rarest(&peer.bitfield, &self.have, &self.busy, rng)
                };
                match started {
                    Some(piece) => {
                        self.start_piece(piece);
                        continue;
                    }
                    None => {
                        // this peer has nothing left to give us
                        if assigned == 0
                            && self.peers[idx].requests_out.is_empty()
                            && self.peers[idx].out_status.is_interested()
                        {
                            self.peers[idx].set_out_interest(false);
                        }
                        self.check_endgame();
                        return assigned;
                    }
                }
            };
            loop {
                let depth = self.peers[idx].request_depth();
                if self.peers[idx].requests_out.len() >= depth {
                    break;
                }
                let Some(block) = self.downloads[pc_idx].next_unrequested() else {
                    break;
                };
                let peer_id = self.peers[idx].id;
                self.downloads[pc_idx].add_request(block, peer_id);
                let request = self.downloads[pc_idx].block_at(block);
                let peer = &mut self.peers[idx];
                peer.requests_out.push_back(request);
                peer.send(PeerMessage::Request(request));
                assigned += 1;
            }
        }
        assigned
    }

    /// End game: request every missing block of every in-flight piece the
    /// peer offers, duplicates included, up to the queue depth.
    fn assign_requests_endgame(&mut self, idx: usize) -> usize {
        let mut assigned = 0;
        'pieces: for pc_idx in 0..self.downloads.len() {
            let piece = self.downloads[pc_idx].index;
            if !self.peers[idx].bitfield.has(piece as usize) {
                continue;
            }
            for block in 0..self.downloads[pc_idx].nblocks {
                let depth = self.peers[idx].request_depth();
                if self.peers[idx].requests_out.len() >= depth {
                    break 'pieces;
                }
                if self.downloads[pc_idx].has_block(block) {
                    continue;
                }
                let request = self.downloads[pc_idx].block_at(block);
                if self.peers[idx].has_request(request.piece, request.offset) {
                    continue;
                }
                let peer_id = self.peers[idx].id;
                self.downloads[pc_idx].add_request(block, peer_id);
                let peer = &mut self.peers[idx];
                peer.requests_out.push_back(request);
                peer.send(PeerMessage::Request(request));
                assigned += 1;
            }
        }
        assigned
    }

    /// Take back everything `peer` owes us, e.g. after a CHOKE.
    pub fn unassign_requests(&mut self, idx: usize, rng: &mut StdRng) {
        let peer_id = self.peers[idx].id;
        let requests: Vec<Block> = self.peers[idx].requests_out.drain(..).collect();
        if !requests.is_empty() {
            self.release_requests(peer_id, requests, rng);
        }
    }

    fn release_requests(&mut self, peer_id: Uuid, requests: Vec<Block>, rng: &mut StdRng) {
        let mut unfull: Vec<u32> = Vec::new();
        let mut touched: Vec<u32> = Vec::new();
        for block in requests {
            let Some(pc) = self
                .downloads
                .iter_mut()
                .find(|pc| pc.index == block.piece)
            else {
                debug_assert!(false, "request for a piece not in progress");
                continue;
            };
            let was_full = pc.is_full();
            let freed = pc.remove_request(block.index());
            if was_full && freed && !unfull.contains(&block.piece) {
                unfull.push(block.piece);
            }
            if !touched.contains(&block.piece) {
                touched.push(block.piece);
            }
        }
        for piece in touched {
            let still_requesting = self
                .peers
                .iter()
                .find(|p| p.id == peer_id)
                .is_some_and(|p| p.requests_out.iter().any(|r| r.piece == piece));
            if !still_requesting {
                if let Some(pc) = self.downloads.iter_mut().find(|pc| pc.index == piece) {
                    pc.unassign_peer(&peer_id);
                }
            }
            // a piece nobody is fetching and nothing arrived for goes back
            // to the picker untouched (not in end game, where the piece
            // set must stay fixed)
            if !self.endgame {
                let Some(pos) = self.downloads.iter().position(|pc| pc.index == piece) else {
                    continue;
                };
                let pc = &self.downloads[pos];
                if pc.nreqs_total == 0 && pc.nblocks_got == 0 && pc.assigned.is_empty() {
                    tracing::trace!(piece, "Returning untouched piece to the picker");
                    self.downloads.remove(pos);
                    self.busy.remove(piece as usize).unwrap();
                    unfull.retain(|p| *p != piece);
                }
            }
        }
        for piece in unfull {
            self.on_piece_unfull(piece, rng);
        }
    }

    /// Freed blocks go back on offer to everyone who advertises the piece.
    fn on_piece_unfull(&mut self, piece: u32, rng: &mut StdRng) {
        for idx in 0..self.peers.len() {
            if !self.peers[idx].bitfield.has(piece as usize) {
                continue;
            }
            if !self.peers[idx].out_status.is_interested() {
                self.peers[idx].set_out_interest(true);
            }
            let peer = &self.peers[idx];
            if !peer.in_status.is_choked() && peer.requests_out.len() < peer.request_depth() {
                self.assign_requests(idx, rng);
            }
        }
    }

    fn start_piece(&mut self, piece: u32) {
        debug_assert!(!self.have.has(piece as usize));
        debug_assert!(!self.busy.has(piece as usize));
        self.busy.add(piece as usize).unwrap();
        let mut pc = PieceDownload::new(piece, self.info.piece_size(piece));
        pc.seed_from_disk(&self.resume.blocks(piece));
        pc.endgame = self.endgame;
        tracing::debug!(
            piece,
            seeded = pc.nblocks_got,
            availability = self.picker.availability(piece as usize),
            "Starting piece"
        );
        if pc.is_complete() {
            // fully on disk from a previous run, only the hash check is left
            if let Err(e) = self.storage.try_verify_piece(piece) {
                tracing::warn!("Failed to queue piece verification: {e}");
            }
        }
        self.downloads.push(pc);
    }

    /// Arm end game once nothing new can be started while pieces are still
    /// in flight. Checked on the tick and after failed new-piece picks.
    pub fn check_endgame(&mut self) {
        if self.endgame || self.downloads.is_empty() {
            return;
        }
        if self.has_startable_piece() {
            return;
        }
        self.enter_endgame();
    }

    fn has_startable_piece(&self) -> bool {
        (0..self.info.npieces()).any(|piece| {
            !self.have.has(piece)
                && !self.busy.has(piece)
                && self
                    .peers
                    .iter()
                    .any(|p| !p.in_status.is_choked() && p.bitfield.has(piece))
        })
    }

    fn enter_endgame(&mut self) {
        self.endgame = true;
        tracing::info!(
            pieces_in_flight = self.downloads.len(),
            "Entering end game"
        );
        for pc_idx in 0..self.downloads.len() {
            self.downloads[pc_idx].endgame = true;
            self.reorder_endgame(pc_idx);
        }
        for idx in 0..self.peers.len() {
            let offers_any = {
                let peer = &self.peers[idx];
                self.downloads
                    .iter()
                    .any(|pc| peer.bitfield.has(pc.index as usize))
            };
            if !offers_any {
                continue;
            }
            if !self.peers[idx].out_status.is_interested() {
                self.peers[idx].set_out_interest(true);
            }
            if !self.peers[idx].in_status.is_choked() {
                self.assign_requests_endgame(idx);
            }
        }
    }

    /// Interleave a piece's outstanding requests across its downloaders so
    /// they do not all race the same block first: every peer's queue for
    /// this piece is rotated by that peer's position in the downloader set.
    fn reorder_endgame(&mut self, pc_idx: usize) {
        let piece = self.downloads[pc_idx].index;
        let assigned = self.downloads[pc_idx].assigned.clone();
        for (rotation, peer_id) in assigned.iter().enumerate() {
            if rotation == 0 {
                continue;
            }
            let Some(p_idx) = self.peer_idx(peer_id) else {
                debug_assert!(false, "downloader is not attached");
                continue;
            };
            let peer = &mut self.peers[p_idx];
            let positions: Vec<usize> = peer
                .requests_out
                .iter()
                .enumerate()
                .filter(|(_, r)| r.piece == piece)
                .map(|(i, _)| i)
                .collect();
            if positions.len() < 2 {
                continue;
            }
            let mut blocks: Vec<Block> = positions.iter().map(|&i| peer.requests_out[i]).collect();
            let blocks_len = blocks.len();
            blocks.rotate_left(rotation % blocks_len);
            for (&pos, &block) in positions.iter().zip(&blocks) {
                peer.requests_out[pos] = block;
            }
        }
    }

    /// One second of wall clock: decay rates, expire stalls, arm end game
    /// and top everyone up.
    pub fn tick(&mut self, rng: &mut StdRng) {
        self.clock += 1;
        for peer in &mut self.peers {
            peer.rate_down.tick();
            peer.rate_up.tick();
        }
        for idx in 0..self.peers.len() {
            let peer = &self.peers[idx];
            if peer.in_status.is_choked() || peer.requests_out.is_empty() {
                continue;
            }
            if self.clock.saturating_sub(peer.last_block_tick) <= SNUB_TIMEOUT {
                continue;
            }
            tracing::debug!(addr = %peer.addr, "Snubbing stalled peer");
            self.peers[idx].snubbed = true;
            self.peers[idx].last_block_tick = self.clock;
            self.unassign_requests(idx, rng);
        }
        self.check_endgame();
        for idx in 0..self.peers.len() {
            let peer = &self.peers[idx];
            if !peer.in_status.is_choked()
                && peer.out_status.is_interested()
                && peer.requests_out.len() < peer.request_depth()
            {
                self.assign_requests(idx, rng);
            }
        }
    }
}

#[cfg(test)]
impl Scheduler {
    /// Cross-check every bookkeeping identity the planner relies on.
    pub fn assert_consistent(&self) {
        assert_eq!(self.have.count_ones(), self.have_count);
        for piece in 0..self.info.npieces() {
            if self.have.has(piece) {
                assert!(!self.busy.has(piece), "piece {piece} both have and busy");
                assert!(
                    !self.downloads.iter().any(|pc| pc.index as usize == piece),
                    "piece {piece} both have and in progress"
                );
            }
            let advertising = self
                .peers
                .iter()
                .filter(|p| p.bitfield.has(piece))
                .count() as u32;
            assert_eq!(self.picker.availability(piece), advertising);
        }
        let mut nreqs_total = 0;
        for pc in &self.downloads {
            assert!(self.busy.has(pc.index as usize));
            let mut pc_reqs = 0;
            let mut got = 0;
            for block in 0..pc.nblocks {
                assert_eq!(pc.is_requested(block), pc.nreqs(block) > 0);
                if !self.endgame {
                    assert!(pc.nreqs(block) <= 1, "duplicate request outside end game");
                }
                pc_reqs += pc.nreqs(block) as u32;
                if pc.has_block(block) {
                    got += 1;
                }
            }
            assert_eq!(pc.nreqs_total, pc_reqs);
            assert_eq!(pc.nblocks_got, got);
            for peer_id in &pc.assigned {
                assert!(
                    self.peers.iter().any(|p| p.id == *peer_id),
                    "downloader is not attached"
                );
            }
            nreqs_total += pc.nreqs_total;
        }
        let outstanding: usize = self.peers.iter().map(|p| p.requests_out.len()).sum();
        assert_eq!(outstanding as u32, nreqs_total);
        for peer in &self.peers {
            if !peer.out_status.is_interested() {
                assert!(peer.requests_out.is_empty());
            }
            for request in &peer.requests_out {
                let pc = self
                    .downloads
                    .iter()
                    .find(|pc| pc.index == request.piece)
                    .expect("request for a piece not in progress");
                assert!(pc.is_requested(request.index()));
                assert!(pc.assigned.contains(&peer.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::path::PathBuf;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;
    use uuid::Uuid;

    use super::{Scheduler, REQUEST_QUEUE_DEPTH, SNUB_TIMEOUT};
    use crate::bitfield::BitField;
    use crate::download::peer::ActivePeer;
    use crate::download::NewPeer;
    use crate::protocol::{Block, DataBlock, PeerMessage, BLOCK_LENGTH};
    use crate::resume::ResumeFile;
    use crate::storage::{StorageHandle, StorageMessage};
    use crate::TorrentInfo;

    struct Swarm {
        scheduler: Scheduler,
        rng: StdRng,
        #[allow(unused)]
        storage_rx: mpsc::Receiver<StorageMessage>,
        resume_path: PathBuf,
    }

    impl Drop for Swarm {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.resume_path);
        }
    }

    fn torrent(npieces: usize, piece_length: u32) -> Swarm {
        let info = TorrentInfo {
            info_hash: [7; 20],
            name: "scheduler test".to_string(),
            piece_length,
            total_length: npieces as u64 * piece_length as u64,
            piece_hashes: vec![[0; 20]; npieces],
        };
        let resume_path =
            std::env::temp_dir().join(format!("swarm-scheduler-{}", Uuid::new_v4()));
        let resume = ResumeFile::create(&resume_path, npieces, piece_length).unwrap();
        let (message_tx, storage_rx) = mpsc::channel(256);
        let scheduler = Scheduler::new(info, resume, StorageHandle::new(message_tx));
        Swarm {
            scheduler,
            rng: StdRng::seed_from_u64(1),
            storage_rx,
            resume_path,
        }
    }

    fn attach_peer(swarm: &mut Swarm, pieces: &[usize]) -> (Uuid, flume::Receiver<PeerMessage>) {
        let id = Uuid::new_v4();
        let mut peer_id = [0u8; 20];
        peer_id[..16].copy_from_slice(id.as_bytes());
        let (message_tx, message_rx) = flume::bounded(256);
        let npieces = swarm.scheduler.info.npieces();
        let tick = swarm.scheduler.clock();
        let peer = ActivePeer::new(
            NewPeer {
                id,
                peer_id,
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881),
                message_tx,
                cancellation_token: CancellationToken::new(),
            },
            npieces,
            tick,
        );
        swarm.scheduler.add_peer(peer);
        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        let mut field = BitField::empty(npieces);
        for &piece in pieces {
            field.add(piece).unwrap();
        }
        swarm.scheduler.handle_peer_bitfield(idx, field).unwrap();
        (id, message_rx)
    }

    fn sent_requests(rx: &flume::Receiver<PeerMessage>) -> Vec<Block> {
        let mut requests = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let PeerMessage::Request(block) = message {
                requests.push(block);
            }
        }
        requests
    }

    #[test]
    #[traced_test]
    fn unchoked_peer_is_kept_at_queue_depth() {
        let mut swarm = torrent(4, 4 * BLOCK_LENGTH);
        let (id, rx) = attach_peer(&mut swarm, &[0, 1, 2, 3]);
        assert_eq!(rx.try_recv().unwrap(), PeerMessage::Interested);

        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        swarm.scheduler.handle_peer_unchoke(idx, &mut swarm.rng);
        swarm.scheduler.assert_consistent();

        let requests = sent_requests(&rx);
        assert_eq!(requests.len(), REQUEST_QUEUE_DEPTH);
        // one whole piece first, lowest blocks first, then the start of a
        // second piece
        let first = requests[0].piece;
        for (i, request) in requests[..4].iter().enumerate() {
            assert_eq!(request.piece, first);
            assert_eq!(request.offset, i as u32 * BLOCK_LENGTH);
        }
        assert_ne!(requests[4].piece, first);
        assert_eq!(requests[4].offset, 0);
    }

    #[test]
    fn choke_then_unchoke_replans_the_same_blocks() {
        let mut swarm = torrent(4, 4 * BLOCK_LENGTH);
        // helper peers never unchoke us; they only shape the rarity index
        // so every pick is tie-free
        let _helpers = [
            attach_peer(&mut swarm, &[1, 2, 3]),
            attach_peer(&mut swarm, &[2, 3]),
            attach_peer(&mut swarm, &[3]),
        ];
        let (id, rx) = attach_peer(&mut swarm, &[0, 1, 2, 3]);
        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        swarm.scheduler.handle_peer_unchoke(idx, &mut swarm.rng);
        let before = sent_requests(&rx);
        assert_eq!(before.len(), REQUEST_QUEUE_DEPTH);

        swarm.scheduler.handle_peer_choke(idx, &mut swarm.rng);
        swarm.scheduler.assert_consistent();
        assert!(swarm.scheduler.peers[idx].requests_out.is_empty());

        swarm.scheduler.handle_peer_unchoke(idx, &mut swarm.rng);
        swarm.scheduler.assert_consistent();
        let after = sent_requests(&rx);
        assert_eq!(before, after);
    }

    #[test]
    fn lost_peer_leaves_no_traces() {
        let mut swarm = torrent(4, 4 * BLOCK_LENGTH);
        let _other = attach_peer(&mut swarm, &[0]);
        let (id, _rx) = attach_peer(&mut swarm, &[0, 1, 2, 3]);
        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        swarm.scheduler.handle_peer_unchoke(idx, &mut swarm.rng);
        assert!(!swarm.scheduler.downloads.is_empty());

        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        swarm.scheduler.remove_peer(idx, &mut swarm.rng);
        swarm.scheduler.assert_consistent();

        // rarity, busy bits and the in-flight set are back to the state
        // the other peer alone would produce
        assert_eq!(swarm.scheduler.picker.availability(0), 1);
        for piece in 1..4 {
            assert_eq!(swarm.scheduler.picker.availability(piece), 0);
        }
        assert!(swarm.scheduler.downloads.is_empty());
        assert_eq!(swarm.scheduler.busy.count_ones(), 0);
    }

    #[test]
    #[traced_test]
    fn stalled_peer_is_snubbed_and_probed_with_one_request() {
        let mut swarm = torrent(4, 4 * BLOCK_LENGTH);
        let (id, rx) = attach_peer(&mut swarm, &[0, 1, 2, 3]);
        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        swarm.scheduler.handle_peer_unchoke(idx, &mut swarm.rng);
        assert_eq!(sent_requests(&rx).len(), REQUEST_QUEUE_DEPTH);

        for _ in 0..=SNUB_TIMEOUT {
            swarm.scheduler.tick(&mut swarm.rng);
        }
        swarm.scheduler.assert_consistent();
        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        assert!(swarm.scheduler.peers[idx].snubbed);
        assert_eq!(swarm.scheduler.peers[idx].requests_out.len(), 1);

        // a delivered block clears the snub and the depth recovers
        let probe = swarm.scheduler.peers[idx].requests_out[0];
        let bytes = bytes::Bytes::from(vec![0u8; probe.length as usize]);
        swarm
            .scheduler
            .save_block(idx, DataBlock::new(probe.piece, probe.offset, bytes), &mut swarm.rng)
            .unwrap();
        swarm.scheduler.assert_consistent();
        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        assert!(!swarm.scheduler.peers[idx].snubbed);
        assert_eq!(
            swarm.scheduler.peers[idx].requests_out.len(),
            REQUEST_QUEUE_DEPTH
        );
    }

    #[test]
    fn entering_endgame_interleaves_shared_piece_queues() {
        let mut swarm = torrent(1, 8 * BLOCK_LENGTH);
        let (a, _a_rx) = attach_peer(&mut swarm, &[0]);
        let (b, _b_rx) = attach_peer(&mut swarm, &[0]);

        let a_idx = swarm.scheduler.peer_idx(&a).unwrap();
        swarm.scheduler.handle_peer_unchoke(a_idx, &mut swarm.rng);
        let blocks = |queue: &std::collections::VecDeque<Block>| -> Vec<u32> {
            queue.iter().map(|r| r.index()).collect()
        };
        assert_eq!(
            blocks(&swarm.scheduler.peers[a_idx].requests_out),
            vec![0, 1, 2, 3, 4]
        );

        // the second unchoke exhausts the torrent and arms end game; its
        // share of the piece is rotated by its downloader position before
        // duplicates are handed out
        let b_idx = swarm.scheduler.peer_idx(&b).unwrap();
        swarm.scheduler.handle_peer_unchoke(b_idx, &mut swarm.rng);
        swarm.scheduler.assert_consistent();
        assert!(swarm.scheduler.endgame);
        let a_idx = swarm.scheduler.peer_idx(&a).unwrap();
        assert_eq!(
            blocks(&swarm.scheduler.peers[a_idx].requests_out),
            vec![0, 1, 2, 3, 4]
        );
        let b_idx = swarm.scheduler.peer_idx(&b).unwrap();
        assert_eq!(
            blocks(&swarm.scheduler.peers[b_idx].requests_out),
            vec![6, 7, 5, 0, 1]
        );
    }

    #[test]
    fn oversize_and_out_of_range_requests_are_rejected() {
        let mut swarm = torrent(2, 4 * BLOCK_LENGTH);
        let (id, _rx) = attach_peer(&mut swarm, &[0, 1]);
        let idx = swarm.scheduler.peer_idx(&id).unwrap();
        swarm.scheduler.peers[idx].in_status.set_interest(true);
        {
            let clock = swarm.scheduler.clock();
            swarm.scheduler.peers[idx].set_out_choke(false, clock);
        }
        swarm.scheduler.have.add(0).unwrap();
        swarm.scheduler.have_count += 1;

        let oversize = Block {
            piece: 0,
            offset: 0,
            length: BLOCK_LENGTH + 1,
        };
        assert!(swarm.scheduler.handle_peer_request(idx, oversize).is_err());

        let past_end = Block {
            piece: 0,
            offset: 3 * BLOCK_LENGTH + 1,
            length: BLOCK_LENGTH,
        };
        assert!(swarm.scheduler.handle_peer_request(idx, past_end).is_err());

        let missing = Block {
            piece: 1,
            offset: 0,
            length: BLOCK_LENGTH,
        };
        assert!(swarm.scheduler.handle_peer_request(idx, missing).is_err());

        let good = Block {
            piece: 0,
            offset: 0,
            length: BLOCK_LENGTH,
        };
        assert!(swarm.scheduler.handle_peer_request(idx, good).is_ok());
        assert_eq!(swarm.scheduler.peers[idx].requests_in.len(), 1);
    }
}
