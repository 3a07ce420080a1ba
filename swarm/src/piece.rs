use uuid::Uuid;

use crate::bitfield::BitField;
use crate::protocol::{Block, BLOCK_LENGTH};

/// A piece the planner is actively downloading.
///
/// Tracks which 16 KiB blocks are owned, which carry outstanding requests
/// and how many (more than one only in end game), and which peers are
/// fetching blocks of it. Created lazily when the planner first assigns a
/// block from the piece and destroyed on completion.
#[derive(Debug)]
pub struct PieceDownload {
    pub index: u32,
    pub piece_length: u32,
    pub nblocks: u32,
    have: BitField,
    requested: BitField,
    nreqs: Vec<u16>,
    pub nblocks_got: u32,
    pub nreqs_total: u32,
    /// Blocks that are either owned or carry at least one request.
    nbusy: u32,
    /// Peers with at least one outstanding request, in first-assignment order.
    pub assigned: Vec<Uuid>,
    pub endgame: bool,
}

impl PieceDownload {
    pub fn new(index: u32, piece_length: u32) -> Self {
        let nblocks = piece_length.div_ceil(BLOCK_LENGTH);
        Self {
            index,
            piece_length,
            nblocks,
            have: BitField::empty(nblocks as usize),
            requested: BitField::empty(nblocks as usize),
            nreqs: vec![0; nblocks as usize],
            nblocks_got: 0,
            nreqs_total: 0,
            nbusy: 0,
            assigned: Vec::new(),
            endgame: false,
        }
    }

    /// Mark blocks already written to disk by a previous run so they are
    /// never requested again.
    pub fn seed_from_disk(&mut self, on_disk: &BitField) {
        for block in 0..self.nblocks {
            if on_disk.has(block as usize) && !self.have.has(block as usize) {
                self.have.add(block as usize).unwrap();
                self.nblocks_got += 1;
                self.nbusy += 1;
            }
        }
    }

    /// Length of `block`, short only for the tail of the last piece.
    pub fn block_size(&self, block: u32) -> u32 {
        if block + 1 < self.nblocks {
            BLOCK_LENGTH
        } else {
            self.piece_length - BLOCK_LENGTH * (self.nblocks - 1)
        }
    }

    pub fn block_at(&self, block: u32) -> Block {
        Block {
            piece: self.index,
            offset: block * BLOCK_LENGTH,
            length: self.block_size(block),
        }
    }

    pub fn has_block(&self, block: u32) -> bool {
        self.have.has(block as usize)
    }

    pub fn is_requested(&self, block: u32) -> bool {
        self.requested.has(block as usize)
    }

    pub fn nreqs(&self, block: u32) -> u16 {
        self.nreqs[block as usize]
    }

    /// Every block is either owned or requested; nothing left to hand out.
    pub fn is_full(&self) -> bool {
        self.nbusy == self.nblocks
    }

    pub fn is_complete(&self) -> bool {
        self.nblocks_got == self.nblocks
    }

    /// Lowest block that is neither owned nor requested.
    pub fn next_unrequested(&self) -> Option<u32> {
        (0..self.nblocks)
            .find(|&b| !self.have.has(b as usize) && !self.requested.has(b as usize))
    }

    pub fn add_request(&mut self, block: u32, peer: Uuid) {
        debug_assert!(!self.has_block(block));
        if self.nreqs[block as usize] == 0 {
            self.requested.add(block as usize).unwrap();
            self.nbusy += 1;
        }
        self.nreqs[block as usize] += 1;
        self.nreqs_total += 1;
        if !self.assigned.contains(&peer) {
            self.assigned.push(peer);
        }
    }

    /// Drop one outstanding request for `block`. Returns true when the
    /// block lost its last request and is unrequested again.
    pub fn remove_request(&mut self, block: u32) -> bool {
        debug_assert!(self.nreqs[block as usize] > 0);
        self.nreqs[block as usize] -= 1;
        self.nreqs_total -= 1;
        if self.nreqs[block as usize] == 0 {
            self.requested.remove(block as usize).unwrap();
            if !self.have.has(block as usize) {
                self.nbusy -= 1;
                return true;
            }
        }
        false
    }

    /// One outstanding request for `block` delivered its bytes.
    pub fn record_block(&mut self, block: u32) {
        debug_assert!(!self.has_block(block));
        self.nreqs[block as usize] -= 1;
        self.nreqs_total -= 1;
        if self.nreqs[block as usize] == 0 {
            self.requested.remove(block as usize).unwrap();
        }
        self.have.add(block as usize).unwrap();
        self.nblocks_got += 1;
    }

    pub fn unassign_peer(&mut self, peer: &Uuid) {
        if let Some(pos) = self.assigned.iter().position(|id| id == peer) {
            self.assigned.remove(pos);
        }
    }

    /// Forget everything after a hash mismatch so the piece downloads
    /// again from scratch.
    pub fn reset(&mut self) {
        self.have = BitField::empty(self.nblocks as usize);
        self.requested = BitField::empty(self.nblocks as usize);
        self.nreqs = vec![0; self.nblocks as usize];
        self.nblocks_got = 0;
        self.nreqs_total = 0;
        self.nbusy = 0;
        self.assigned.clear();
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::PieceDownload;
    use crate::bitfield::BitField;
    use crate::protocol::BLOCK_LENGTH;

    #[test]
    fn short_tail_block_sizes() {
        // piece smaller than one full block
        let pc = PieceDownload::new(0, 100);
        assert_eq!(pc.nblocks, 1);
        assert_eq!(pc.block_size(0), 100);

        // last block short
        let pc = PieceDownload::new(3, 3 * BLOCK_LENGTH + 7);
        assert_eq!(pc.nblocks, 4);
        assert_eq!(pc.block_size(0), BLOCK_LENGTH);
        assert_eq!(pc.block_size(2), BLOCK_LENGTH);
        assert_eq!(pc.block_size(3), 7);
        assert_eq!(pc.block_at(3).offset, 3 * BLOCK_LENGTH);

        // exact multiple
        let pc = PieceDownload::new(0, 2 * BLOCK_LENGTH);
        assert_eq!(pc.nblocks, 2);
        assert_eq!(pc.block_size(1), BLOCK_LENGTH);
    }

    #[test]
    fn request_accounting() {
        let mut pc = PieceDownload::new(0, 4 * BLOCK_LENGTH);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(pc.next_unrequested(), Some(0));
        pc.add_request(0, a);
        pc.add_request(1, a);
        assert_eq!(pc.next_unrequested(), Some(2));
        assert_eq!(pc.nreqs_total, 2);
        assert_eq!(pc.assigned, vec![a]);
        assert!(!pc.is_full());

        pc.add_request(2, b);
        pc.add_request(3, b);
        assert!(pc.is_full());
        assert_eq!(pc.next_unrequested(), None);

        // losing the last request for a block frees it again
        assert!(pc.remove_request(3));
        assert!(!pc.is_full());
        assert_eq!(pc.next_unrequested(), Some(3));

        // delivery keeps the block busy but owned
        pc.record_block(0);
        assert!(pc.has_block(0));
        assert!(!pc.is_requested(0));
        assert_eq!(pc.nblocks_got, 1);
        assert!(!pc.is_complete());
    }

    #[test]
    fn duplicate_requests_count_per_block() {
        let mut pc = PieceDownload::new(0, 2 * BLOCK_LENGTH);
        pc.endgame = true;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        pc.add_request(0, a);
        pc.add_request(0, b);
        assert_eq!(pc.nreqs(0), 2);
        assert_eq!(pc.nreqs_total, 2);
        assert!(pc.is_requested(0));

        // first delivery, then the duplicate gets cancelled
        pc.record_block(0);
        assert!(pc.is_requested(0));
        assert!(!pc.remove_request(0));
        assert!(!pc.is_requested(0));
        assert_eq!(pc.nreqs_total, 0);
        assert!(pc.has_block(0));
    }

    #[test]
    fn resume_seeding_skips_blocks_on_disk() {
        let mut pc = PieceDownload::new(0, 4 * BLOCK_LENGTH);
        let mut on_disk = BitField::empty(4);
        on_disk.add(1).unwrap();
        on_disk.add(2).unwrap();
        pc.seed_from_disk(&on_disk);
        assert_eq!(pc.nblocks_got, 2);
        assert_eq!(pc.next_unrequested(), Some(0));
        pc.add_request(0, Uuid::new_v4());
        assert_eq!(pc.next_unrequested(), Some(3));
    }
}
