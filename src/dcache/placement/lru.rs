use log::trace;
use rand::rngs::StdRng;

use super::{draw, PlacementDecision, PlacementParams, PlacementStats, PolicyContext};
use crate::dcache::way::{Set, TagRole};

/// Recency ranks kept separately for the prime and sub slots of every set.
/// Rank 0 is most recent, `ways - 1` the eviction candidate.
#[derive(Debug)]
pub struct LruPolicy {
    ways: usize,
    params: PlacementParams,
    prime_ranks: Vec<Vec<u32>>,
    sub_ranks: Vec<Vec<u32>>,
    rng: StdRng,
    stats: PlacementStats,
}

impl LruPolicy {
    pub fn new(num_sets: usize, ways: usize, params: PlacementParams, rng: StdRng) -> Self {
        let ranks = || (0..num_sets).map(|_| (0..ways as u32).collect()).collect();
        Self {
            ways,
            params,
            prime_ranks: ranks(),
            sub_ranks: ranks(),
            rng,
            stats: PlacementStats::default(),
        }
    }

    fn ranks_mut(&mut self, set_idx: usize, role: TagRole) -> &mut Vec<u32> {
        match role {
            TagRole::Prime => &mut self.prime_ranks[set_idx],
            TagRole::Sub => &mut self.sub_ranks[set_idx],
        }
    }

    pub fn rank(&self, set_idx: usize, role: TagRole, way: usize) -> u32 {
        match role {
            TagRole::Prime => self.prime_ranks[set_idx][way],
            TagRole::Sub => self.sub_ranks[set_idx][way],
        }
    }

    pub(crate) fn touch(&mut self, set_idx: usize, role: TagRole, way: usize) {
        let ranks = self.ranks_mut(set_idx, role);
        let current = ranks[way];
        for r in ranks.iter_mut() {
            if *r < current {
                *r += 1;
            }
        }
        ranks[way] = 0;
    }

    fn oldest(&self, set_idx: usize, role: TagRole) -> usize {
        let oldest = self.ways as u32 - 1;
        let ranks = match role {
            TagRole::Prime => &self.prime_ranks[set_idx],
            TagRole::Sub => &self.sub_ranks[set_idx],
        };
        ranks
            .iter()
            .position(|&r| r == oldest)
            .unwrap_or(self.ways - 1)
    }

    /// Empty slot first, otherwise the oldest occupant on a sampled draw.
    fn choose(
        &mut self,
        ctx: &PolicyContext,
        incoming: u64,
        set_idx: usize,
        set: &Set,
        role: TagRole,
    ) -> PlacementDecision {
        if !self.params.enable_replace {
            return PlacementDecision::decline();
        }
        if let Some(empty) = set.empty_way(role) {
            self.touch(set_idx, role, empty);
            match role {
                TagRole::Prime => self.stats.empty_prime_fills += 1,
                TagRole::Sub => self.stats.empty_sub_fills += 1,
            }
            return PlacementDecision::to_way(empty);
        }
        if !draw(&mut self.rng, self.params.sample_rate) {
            return PlacementDecision::decline();
        }
        let victim = self.oldest(set_idx, role);
        let victim_tag = set
            .way(victim)
            .slot(role)
            .map(|m| m.tag)
            .unwrap_or(incoming);
        if ctx.tag_buffer.can_insert_pair(incoming, victim_tag) {
            trace!(
                "lru set {} {:?} victim way {} (tag {:#x}) for {:#x}",
                set_idx,
                role,
                victim,
                victim_tag,
                incoming
            );
            self.touch(set_idx, role, victim);
            PlacementDecision::to_way(victim)
        } else {
            self.stats.record_decline();
            PlacementDecision::decline()
        }
    }

    pub fn handle_cache_miss(
        &mut self,
        ctx: &PolicyContext,
        tag: u64,
        set_idx: usize,
        set: &Set,
    ) -> PlacementDecision {
        self.choose(ctx, tag, set_idx, set, TagRole::Prime)
    }

    pub fn handle_prime_tag_evict(
        &mut self,
        ctx: &PolicyContext,
        replaced_way: usize,
        demoted_tag: u64,
        set_idx: usize,
        set: &Set,
    ) -> PlacementDecision {
        if self.params.in_way_replace {
            self.touch(set_idx, TagRole::Sub, replaced_way);
            return PlacementDecision::to_way(replaced_way);
        }
        self.choose(ctx, demoted_tag, set_idx, set, TagRole::Sub)
    }

    /// Hits only refresh recency; LRU never promotes a sub tag.
    pub fn handle_cache_hit(
        &mut self,
        tag: u64,
        set_idx: usize,
        set: &Set,
        hit_way: usize,
    ) -> PlacementDecision {
        let role = set
            .way(hit_way)
            .role_of(tag)
            .unwrap_or_else(|| panic!("hit on tag {:#x} not held by way {}", tag, hit_way));
        self.touch(set_idx, role, hit_way);
        PlacementDecision::decline()
    }

    pub fn stats(&self) -> PlacementStats {
        self.stats
    }
}
