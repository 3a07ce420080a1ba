use rand::rngs::StdRng;
use rand::Rng;
use uuid::Uuid;

use crate::scheduler::Scheduler;

/// Unchoke slots handed out every cycle, the last one optimistic.
pub const MAX_UPLOADS: usize = 4;
/// Ticks between rechoke rounds.
pub const CHOKE_INTERVAL: u64 = 10;
/// Every third round the optimistic slot rotates, i.e. every 30 seconds.
pub const OPTIMISTIC_ROUNDS: u64 = 3;
/// Peers younger than this never hold an upload slot.
const MIN_CANDIDATE_AGE: u64 = 20;
/// Peers connected for less than this draw with triple weight.
const FRESH_PEER_AGE: u64 = 60;
const FRESH_PEER_WEIGHT: usize = 3;

/// Upload slot allocation.
///
/// Interested peers are ranked by what they are worth to us: download rate
/// while we still leech, upload rate once we seed. The top slots follow
/// the ranking; the last slot explores, rotating to a random candidate so
/// new peers get a chance to prove themselves.
#[derive(Debug, Default)]
pub struct Choker {
    optimistic: Option<Uuid>,
    round: u64,
}

impl Choker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(&self) -> Option<Uuid> {
        self.optimistic
    }

    pub fn rechoke(&mut self, scheduler: &mut Scheduler, seeding: bool, rng: &mut StdRng) {
        let tick = scheduler.clock();
        let mut candidates: Vec<usize> = scheduler
            .peers
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.in_status.is_interested() && tick.saturating_sub(p.connected_tick) > MIN_CANDIDATE_AGE
            })
            .map(|(idx, _)| idx)
            .collect();
        candidates.sort_by(|&a, &b| {
            let pa = &scheduler.peers[a];
            let pb = &scheduler.peers[b];
            let rate = |p: &crate::download::peer::ActivePeer| {
                if seeding {
                    p.rate_up.bytes_per_second()
                } else {
                    p.rate_down.bytes_per_second()
                }
            };
            rate(pb)
                .cmp(&rate(pa))
                .then(pa.out_status.last_choke_change().cmp(&pb.out_status.last_choke_change()))
                .then(pa.connected_tick.cmp(&pb.connected_tick))
        });

        let rotate = self.round % OPTIMISTIC_ROUNDS == 0;
        self.round += 1;

        let incumbent = self.optimistic.filter(|id| {
            candidates
                .iter()
                .any(|&idx| scheduler.peers[idx].id == *id)
        });

        let (regulars, optimistic) = if rotate || incumbent.is_none() {
            let regulars: Vec<usize> = candidates.iter().take(MAX_UPLOADS - 1).copied().collect();
            let pool: Vec<usize> = candidates
                .iter()
                .skip(MAX_UPLOADS - 1)
                .copied()
                .filter(|&idx| Some(scheduler.peers[idx].id) != self.optimistic)
                .collect();
            let fresh = draw_weighted(&pool, scheduler, tick, rng);
            // nobody new to explore; hang on to the incumbent if it still
            // qualifies and is not already a regular
            let optimistic = fresh.or_else(|| {
                incumbent.filter(|id| {
                    !regulars.iter().any(|&idx| scheduler.peers[idx].id == *id)
                })
            });
            (regulars, optimistic)
        } else {
            let incumbent_id = incumbent.unwrap();
            let regulars: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&idx| scheduler.peers[idx].id != incumbent_id)
                .take(MAX_UPLOADS - 1)
                .collect();
            (regulars, Some(incumbent_id))
        };
        self.optimistic = optimistic;

        let mut unchoked: Vec<Uuid> = regulars
            .iter()
            .map(|&idx| scheduler.peers[idx].id)
            .collect();
        if let Some(id) = optimistic {
            unchoked.push(id);
        }
        debug_assert!(unchoked.len() <= MAX_UPLOADS);

        // only the deltas produce wire traffic
        for idx in 0..scheduler.peers.len() {
            let peer = &scheduler.peers[idx];
            let should_unchoke = unchoked.contains(&peer.id);
            if should_unchoke && peer.out_status.is_choked() {
                scheduler.peers[idx].set_out_choke(false, tick);
            } else if !should_unchoke && !peer.out_status.is_choked() {
                scheduler.peers[idx].set_out_choke(true, tick);
                // queued piece sends die with the slot; our own outgoing
                // requests are unaffected
                scheduler.peers[idx].requests_in.clear();
            }
        }
    }
}

fn draw_weighted(
    pool: &[usize],
    scheduler: &Scheduler,
    tick: u64,
    rng: &mut StdRng,
) -> Option<Uuid> {
    if pool.is_empty() {
        return None;
    }
    let mut draw: Vec<usize> = Vec::new();
    for &idx in pool {
        let age = tick.saturating_sub(scheduler.peers[idx].connected_tick);
        let weight = if age < FRESH_PEER_AGE {
            FRESH_PEER_WEIGHT
        } else {
            1
        };
        for _ in 0..weight {
            draw.push(idx);
        }
    }
    let idx = draw[rng.random_range(0..draw.len())];
    Some(scheduler.peers[idx].id)
}
