use rand::rngs::StdRng;
use rand::Rng;

use crate::bitfield::BitField;

/// Swarm rarity index and rarest-first piece selection.
///
/// `availability[i]` counts the known peers advertising piece `i`. It grows
/// on every HAVE/BITFIELD contribution and shrinks when a peer is lost;
/// an underflow means request bookkeeping went wrong somewhere and is a
/// fatal bug, not a condition to recover from.
#[derive(Debug)]
pub struct PiecePicker {
    availability: Vec<u32>,
}

impl PiecePicker {
    pub fn new(npieces: usize) -> Self {
        Self {
            availability: vec![0; npieces],
        }
    }

    pub fn availability(&self, piece: usize) -> u32 {
        self.availability[piece]
    }

    /// Count a single HAVE announcement.
    pub fn piece_seen(&mut self, piece: usize) {
        self.availability[piece] += 1;
    }

    /// Count a freshly received peer bitfield.
    pub fn peer_joined(&mut self, field: &BitField) {
        for piece in field.pieces() {
            self.availability[piece] += 1;
        }
    }

    /// Retract a lost peer's contributions.
    pub fn peer_lost(&mut self, field: &BitField) {
        for piece in field.pieces() {
            assert!(self.availability[piece] > 0, "piece count underflow");
            self.availability[piece] -= 1;
        }
    }

    /// Pick the piece to start next for a peer: offered by the peer,
    /// neither owned nor already being downloaded, rarest in the swarm,
    /// uniform random among rarity ties.
    pub fn pick_rarest(
        &self,
        peer: &BitField,
        have: &BitField,
        busy: &BitField,
        rng: &mut StdRng,
    ) -> Option<u32> {
        let mut rarest = u32::MAX;
        let mut ties: Vec<u32> = Vec::new();
        for (piece, &count) in self.availability.iter().enumerate() {
            if count == 0 || !peer.has(piece) || have.has(piece) || busy.has(piece) {
                continue;
            }
            if count < rarest {
                rarest = count;
                ties.clear();
            }
            if count == rarest {
                ties.push(piece as u32);
            }
        }
        match ties.len() {
            0 => None,
            1 => Some(ties[0]),
            len => Some(ties[rng.random_range(0..len)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::PiecePicker;
    use crate::bitfield::BitField;

    fn field(len: usize, set: &[usize]) -> BitField {
        let mut bf = BitField::empty(len);
        for &piece in set {
            bf.add(piece).unwrap();
        }
        bf
    }

    #[test]
    fn rarest_piece_wins() {
        let mut picker = PiecePicker::new(4);
        picker.peer_joined(&field(4, &[0, 1, 2, 3]));
        picker.peer_joined(&field(4, &[0, 1, 3]));
        picker.peer_joined(&field(4, &[0, 3]));

        let peer = field(4, &[0, 1, 2, 3]);
        let have = BitField::empty(4);
        let busy = BitField::empty(4);
        let mut rng = StdRng::seed_from_u64(7);
        // piece 2 is advertised by a single peer
        assert_eq!(picker.pick_rarest(&peer, &have, &busy, &mut rng), Some(2));
    }

    #[test]
    fn owned_and_busy_pieces_are_skipped() {
        let mut picker = PiecePicker::new(3);
        picker.peer_joined(&field(3, &[0, 1, 2]));

        let peer = field(3, &[0, 1, 2]);
        let have = field(3, &[0]);
        let busy = field(3, &[1]);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(picker.pick_rarest(&peer, &have, &busy, &mut rng), Some(2));

        let busy = field(3, &[1, 2]);
        assert_eq!(picker.pick_rarest(&peer, &have, &busy, &mut rng), None);
    }

    #[test]
    fn tiebreak_is_seed_deterministic() {
        let mut picker = PiecePicker::new(8);
        picker.peer_joined(&field(8, &[0, 1, 2, 3, 4, 5, 6, 7]));

        let peer = field(8, &[0, 1, 2, 3, 4, 5, 6, 7]);
        let have = BitField::empty(8);
        let busy = BitField::empty(8);
        let first = picker
            .pick_rarest(&peer, &have, &busy, &mut StdRng::seed_from_u64(42))
            .unwrap();
        let second = picker
            .pick_rarest(&peer, &have, &busy, &mut StdRng::seed_from_u64(42))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "piece count underflow")]
    fn availability_underflow_is_fatal() {
        let mut picker = PiecePicker::new(2);
        picker.peer_lost(&field(2, &[0]));
    }
}
