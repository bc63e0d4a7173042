use log::trace;
use rand::rngs::StdRng;
use rand::Rng;
use smallvec::SmallVec;

use super::{draw, PlacementDecision, PlacementParams, PlacementStats, PolicyContext};
use crate::dcache::request::AccessKind;
use crate::dcache::way::{Set, TagRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub tag: u64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkEntry {
    pub prime: Option<Counter>,
    pub sub: Option<Counter>,
}

impl ChunkEntry {
    fn counter_mut(&mut self, role: TagRole) -> &mut Option<Counter> {
        match role {
            TagRole::Prime => &mut self.prime,
            TagRole::Sub => &mut self.sub,
        }
    }

    fn counter(&self, role: TagRole) -> Option<Counter> {
        match role {
            TagRole::Prime => self.prime,
            TagRole::Sub => self.sub,
        }
    }
}

/// Frequency-based replacement.
///
/// Every set owns a chunk of counters. Entries `0..ways` mirror the resident prime and sub
/// tags of the matching way; the remaining entries track prime candidates that are not
/// resident yet. A page only displaces a resident one once its counter leads by `margin`.
#[derive(Debug)]
pub struct FbrPolicy {
    ways: usize,
    params: PlacementParams,
    chunks: Vec<Vec<ChunkEntry>>,
    rng: StdRng,
    stats: PlacementStats,
}

impl FbrPolicy {
    pub fn new(num_sets: usize, ways: usize, params: PlacementParams, rng: StdRng) -> Self {
        assert!(
            params.entries_per_chunk > ways,
            "chunk of {} entries cannot hold candidates beyond {} ways",
            params.entries_per_chunk,
            ways
        );
        Self {
            ways,
            params,
            chunks: vec![vec![ChunkEntry::default(); params.entries_per_chunk]; num_sets],
            rng,
            stats: PlacementStats::default(),
        }
    }

    /// Current counter of `tag` in `role`, if the chunk tracks it.
    pub fn count(&self, set_idx: usize, tag: u64, role: TagRole) -> Option<u32> {
        self.chunks[set_idx]
            .iter()
            .filter_map(|e| e.counter(role))
            .find(|c| c.tag == tag)
            .map(|c| c.count)
    }

    /// Rebuild the mirror entries from the set, carrying counts by tag. Mirrors whose page
    /// left the cache fall back into free candidate slots.
    fn resync(&mut self, set_idx: usize, set: &Set) {
        let ways = self.ways;
        let chunk = &mut self.chunks[set_idx];
        let mut snapshot: SmallVec<[(u64, u32, TagRole); 32]> = SmallVec::new();
        for e in chunk.iter() {
            if let Some(c) = e.prime {
                snapshot.push((c.tag, c.count, TagRole::Prime));
            }
            if let Some(c) = e.sub {
                snapshot.push((c.tag, c.count, TagRole::Sub));
            }
        }
        let count_of = |tag: u64, role: TagRole| {
            snapshot
                .iter()
                .find(|&&(t, _, r)| t == tag && r == role)
                .or_else(|| snapshot.iter().find(|&&(t, _, _)| t == tag))
                .map_or(0, |&(_, c, _)| c)
        };
        let resident = |tag: u64| set.find(tag).is_some();

        let displaced: SmallVec<[Counter; 8]> = chunk[..ways]
            .iter()
            .filter_map(|e| e.prime)
            .filter(|c| !resident(c.tag))
            .collect();
        for (way, entry) in chunk[..ways].iter_mut().enumerate() {
            let w = set.way(way);
            entry.prime = w.prime_tag().map(|tag| Counter {
                tag,
                count: count_of(tag, TagRole::Prime),
            });
            entry.sub = w.sub_tag().map(|tag| Counter {
                tag,
                count: count_of(tag, TagRole::Sub),
            });
        }
        for entry in chunk[ways..].iter_mut() {
            entry.sub = None;
            if entry.prime.is_some_and(|c| resident(c.tag)) {
                entry.prime = None;
            }
        }
        for c in displaced {
            let tracked = chunk[ways..]
                .iter()
                .any(|e| e.prime.is_some_and(|p| p.tag == c.tag));
            if tracked {
                continue;
            }
            if let Some(slot) = chunk[ways..].iter_mut().find(|e| e.prime.is_none()) {
                slot.prime = Some(c);
            }
        }
    }

    fn sample_or_not(&mut self, ctx: &PolicyContext) -> bool {
        if ctx.num_requests < self.params.warmup_requests {
            return true;
        }
        let rate = self.params.sample_rate;
        if rate >= 1.0 {
            draw(&mut self.rng, rate)
        } else {
            let miss_rate = ctx.recent_miss_rate.max(self.params.miss_rate_threshold);
            draw(&mut self.rng, rate * miss_rate)
        }
    }

    fn beats(&self, challenger: u32, resident: u32) -> bool {
        challenger as f64 >= resident as f64 + self.params.margin()
    }

    /// Bump a counter; on reaching the limit it and every other counter of the role are halved.
    fn increment(&mut self, set_idx: usize, idx: usize, role: TagRole) {
        let max = self.params.max_count_size;
        let chunk = &mut self.chunks[set_idx];
        let count = match chunk[idx].counter_mut(role) {
            Some(c) => {
                c.count += 1;
                c.count
            }
            None => panic!("incrementing an empty {:?} chunk entry {}", role, idx),
        };
        if count < max {
            return;
        }
        trace!("fbr set {} {:?} counter overflow at entry {}", set_idx, role, idx);
        // prime and sub counts age separately; an overflow halves only its own role
        for (i, entry) in chunk.iter_mut().enumerate() {
            if let Some(c) = entry.counter_mut(role) {
                c.count = if i == idx { (c.count + 1) / 2 } else { c.count / 2 };
            }
        }
    }

    /// Minimum-count resident way for `role`, ties to the lowest way.
    fn min_way(&self, set_idx: usize, role: TagRole) -> Option<(usize, Counter)> {
        self.chunks[set_idx][..self.ways]
            .iter()
            .enumerate()
            .filter_map(|(way, e)| e.counter(role).map(|c| (way, c)))
            .min_by_key(|&(way, c)| (c.count, way))
    }

    /// Remove a candidate entry for `tag`, returning the count it had gathered.
    fn take_candidate(&mut self, set_idx: usize, tag: u64) -> u32 {
        let ways = self.ways;
        self.chunks[set_idx][ways..]
            .iter_mut()
            .find(|e| e.prime.is_some_and(|c| c.tag == tag))
            .and_then(|e| e.prime.take())
            .map_or(0, |c| c.count)
    }

    /// Locate or allocate the candidate entry for a missing page. A full chunk evicts a random
    /// candidate with probability `1 / count`, so hot candidates tend to survive.
    fn candidate_entry(&mut self, set_idx: usize, tag: u64) -> Option<usize> {
        let ways = self.ways;
        let entries = self.params.entries_per_chunk;
        let chunk = &self.chunks[set_idx];
        if let Some(idx) = (ways..entries).find(|&i| chunk[i].prime.is_some_and(|c| c.tag == tag)) {
            return Some(idx);
        }
        let idx = match (ways..entries).find(|&i| chunk[i].prime.is_none()) {
            Some(free) => free,
            None => {
                let idx = self.rng.gen_range(ways..entries);
                let f: f64 = self.rng.gen();
                let count = self.chunks[set_idx][idx].prime.map_or(0, |c| c.count);
                if count > 0 && f > 1.0 / count as f64 {
                    return None;
                }
                idx
            }
        };
        self.chunks[set_idx][idx].prime = Some(Counter { tag, count: 0 });
        Some(idx)
    }

    pub fn handle_cache_miss(
        &mut self,
        ctx: &PolicyContext,
        tag: u64,
        access: AccessKind,
        set_idx: usize,
        set: &Set,
    ) -> PlacementDecision {
        if !self.params.enable_replace {
            return PlacementDecision::decline();
        }
        self.resync(set_idx, set);
        if access == AccessKind::Store && !self.params.replace_on_store {
            trace!("fbr set {} store miss on {:#x} never replaces", set_idx, tag);
            return PlacementDecision::decline();
        }
        let empty = set.empty_way(TagRole::Prime);
        if empty.is_none() && !self.sample_or_not(ctx) {
            return PlacementDecision::decline();
        }
        self.stats.record_counter_access();
        let mut decision = PlacementDecision {
            way: None,
            counter_access: true,
        };

        if let Some(way) = empty {
            let count = self.take_candidate(set_idx, tag);
            self.chunks[set_idx][way].prime = Some(Counter { tag, count });
            self.increment(set_idx, way, TagRole::Prime);
            self.stats.empty_prime_fills += 1;
            decision.way = Some(way);
            return decision;
        }

        let Some(idx) = self.candidate_entry(set_idx, tag) else {
            self.stats.record_decline();
            return decision;
        };
        self.increment(set_idx, idx, TagRole::Prime);
        let candidate = self.chunks[set_idx][idx].prime.map_or(0, |c| c.count);
        if let Some((victim, resident)) = self.min_way(set_idx, TagRole::Prime) {
            if self.beats(candidate, resident.count)
                && ctx.tag_buffer.can_insert_pair(tag, resident.tag)
            {
                trace!(
                    "fbr set {} candidate {:#x} ({}) replaces way {} {:#x} ({})",
                    set_idx,
                    tag,
                    candidate,
                    victim,
                    resident.tag,
                    resident.count
                );
                decision.way = Some(victim);
                return decision;
            }
        }
        self.stats.record_decline();
        decision
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
            return PlacementDecision::to_way(replaced_way);
        }
        if !self.params.enable_replace {
            return PlacementDecision::decline();
        }
        self.resync(set_idx, set);
        if let Some(empty) = set.empty_way(TagRole::Sub) {
            self.stats.empty_sub_fills += 1;
            return PlacementDecision::to_way(empty);
        }
        if !self.sample_or_not(ctx) {
            return PlacementDecision::to_way(replaced_way);
        }
        self.stats.record_counter_access();
        let mut decision = PlacementDecision {
            way: None,
            counter_access: true,
        };
        let demoted = self.count(set_idx, demoted_tag, TagRole::Prime).unwrap_or(0);
        if let Some((victim, resident)) = self.min_way(set_idx, TagRole::Sub) {
            if self.beats(demoted, resident.count)
                && ctx.tag_buffer.can_insert_pair(demoted_tag, resident.tag)
            {
                decision.way = Some(victim);
                return decision;
            }
        }
        self.stats.record_decline();
        decision
    }

    pub fn handle_cache_hit(
        &mut self,
        ctx: &PolicyContext,
        tag: u64,
        set_idx: usize,
        set: &Set,
        hit_way: usize,
    ) -> PlacementDecision {
        self.resync(set_idx, set);
        let role = set
            .way(hit_way)
            .role_of(tag)
            .unwrap_or_else(|| panic!("hit on tag {:#x} not held by way {}", tag, hit_way));
        let mut decision = PlacementDecision::decline();

        if role == TagRole::Prime {
            if self.sample_or_not(ctx) {
                self.stats.record_counter_access();
                self.increment(set_idx, hit_way, TagRole::Prime);
                decision.counter_access = true;
            }
            return decision;
        }

        let empty = set.empty_way(TagRole::Prime);
        if empty.is_none() && !self.sample_or_not(ctx) {
            return decision;
        }
        self.stats.record_counter_access();
        self.increment(set_idx, hit_way, TagRole::Sub);
        decision.counter_access = true;
        if let Some(way) = empty {
            self.stats.sub_promotions += 1;
            decision.way = Some(way);
            return decision;
        }
        let sub_count = self.chunks[set_idx][hit_way].sub.map_or(0, |c| c.count);
        if let Some((victim, resident)) = self.min_way(set_idx, TagRole::Prime) {
            if self.beats(sub_count, resident.count)
                && ctx.tag_buffer.can_insert_pair(tag, resident.tag)
            {
                trace!(
                    "fbr set {} promotes sub {:#x} ({}) over way {} ({})",
                    set_idx,
                    tag,
                    sub_count,
                    victim,
                    resident.count
                );
                self.stats.sub_promotions += 1;
                decision.way = Some(victim);
            }
        }
        decision
    }

    pub fn flush_chunk(&mut self, set_idx: usize) {
        for entry in self.chunks[set_idx].iter_mut() {
            *entry = ChunkEntry::default();
        }
        self.stats.chunk_flushes += 1;
    }

    pub fn stats(&self) -> PlacementStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn set_count(&mut self, set_idx: usize, tag: u64, role: TagRole, count: u32) {
        let entry = self.chunks[set_idx]
            .iter_mut()
            .filter_map(|e| e.counter_mut(role).as_mut())
            .find(|c| c.tag == tag)
            .expect("tag tracked in chunk");
        entry.count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{ctx, params, set_with};
    use super::*;
    use crate::dcache::tag_buffer::TagBuffer;
    use rand::SeedableRng;

    fn policy(p: PlacementParams) -> FbrPolicy {
        FbrPolicy::new(1, 2, p, StdRng::seed_from_u64(7))
    }

    fn full_sampling() -> PlacementParams {
        let mut p = params(1.0);
        p.max_count_size = 255;
        p
    }

    #[test]
    fn empty_prime_way_is_filled_with_a_counter_access() {
        let mut fbr = policy(params(0.0));
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), None], &[None, None]);
        let d = fbr.handle_cache_miss(&ctx(&tb), 11, AccessKind::Load, 0, &set);
        assert_eq!(d.way, Some(1));
        assert!(d.counter_access);
        assert_eq!(fbr.count(0, 11, TagRole::Prime), Some(1));
        assert_eq!(fbr.stats().empty_prime_fills, 1);
    }

    #[test]
    fn store_misses_never_replace_unless_enabled() {
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[None, None], &[None, None]);
        let mut fbr = policy(full_sampling());
        let d = fbr.handle_cache_miss(&ctx(&tb), 11, AccessKind::Store, 0, &set);
        assert_eq!(d, PlacementDecision::decline());

        let mut p = full_sampling();
        p.replace_on_store = true;
        let mut fbr = policy(p);
        let d = fbr.handle_cache_miss(&ctx(&tb), 11, AccessKind::Store, 0, &set);
        assert_eq!(d.way, Some(0));
    }

    #[test]
    fn candidate_replaces_only_after_leading_by_margin() {
        let mut fbr = policy(full_sampling());
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), Some(12)], &[None, None]);
        // margin is 4096 / 64 / 2 * 1.0 = 32 over residents with count 0
        for _ in 0..31 {
            let d = fbr.handle_cache_miss(&ctx(&tb), 14, AccessKind::Load, 0, &set);
            assert_eq!(d.way, None);
            assert!(d.counter_access);
        }
        let d = fbr.handle_cache_miss(&ctx(&tb), 14, AccessKind::Load, 0, &set);
        assert_eq!(d.way, Some(0));
        assert_eq!(fbr.count(0, 14, TagRole::Prime), Some(32));
    }

    #[test]
    fn winning_candidate_still_needs_tag_buffer_room() {
        let mut fbr = policy(full_sampling());
        let mut tb = TagBuffer::new(1, 2);
        tb.insert(100, true);
        tb.insert(101, true);
        let set = set_with(&[Some(10), Some(12)], &[None, None]);
        for _ in 0..40 {
            let d = fbr.handle_cache_miss(&ctx(&tb), 14, AccessKind::Load, 0, &set);
            assert_eq!(d.way, None);
        }
    }

    #[test]
    fn saturated_counter_halves_itself_and_its_role() {
        let mut fbr = policy(full_sampling());
        fbr.params.max_count_size = 31;
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), Some(12)], &[Some(20), None]);
        fbr.handle_cache_hit(&ctx(&tb), 12, 0, &set, 1);
        fbr.set_count(0, 10, TagRole::Prime, 31);
        fbr.set_count(0, 12, TagRole::Prime, 10);
        fbr.set_count(0, 20, TagRole::Sub, 9);
        fbr.handle_cache_hit(&ctx(&tb), 10, 0, &set, 0);
        assert_eq!(fbr.count(0, 10, TagRole::Prime), Some(16));
        assert_eq!(fbr.count(0, 12, TagRole::Prime), Some(5));
        assert_eq!(fbr.count(0, 20, TagRole::Sub), Some(9));
    }

    #[test]
    fn sub_hit_promotes_into_empty_prime_way() {
        let mut fbr = policy(params(0.0));
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), None], &[None, Some(22)]);
        let d = fbr.handle_cache_hit(&ctx(&tb), 22, 0, &set, 1);
        assert_eq!(d.way, Some(1));
        assert_eq!(fbr.stats().sub_promotions, 1);
    }

    #[test]
    fn sub_hit_promotes_over_cold_prime_by_margin() {
        let mut fbr = policy(full_sampling());
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), Some(12)], &[Some(20), Some(22)]);
        fbr.handle_cache_hit(&ctx(&tb), 10, 0, &set, 0);
        fbr.set_count(0, 10, TagRole::Prime, 40);
        fbr.set_count(0, 12, TagRole::Prime, 3);
        fbr.set_count(0, 22, TagRole::Sub, 33);
        let d = fbr.handle_cache_hit(&ctx(&tb), 22, 0, &set, 1);
        assert_eq!(d.way, None);
        let d = fbr.handle_cache_hit(&ctx(&tb), 22, 0, &set, 1);
        assert_eq!(d.way, Some(1));
        assert_eq!(fbr.count(0, 22, TagRole::Sub), Some(35));
    }

    #[test]
    fn prime_evict_prefers_empty_sub_way() {
        let mut fbr = policy(full_sampling());
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), Some(12)], &[Some(20), None]);
        let d = fbr.handle_prime_tag_evict(&ctx(&tb), 0, 10, 0, &set);
        assert_eq!(d.way, Some(1));
    }

    #[test]
    fn prime_evict_displaces_colder_sub_or_drops_the_page() {
        let mut fbr = policy(full_sampling());
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), Some(12)], &[Some(20), Some(22)]);
        let d = fbr.handle_prime_tag_evict(&ctx(&tb), 0, 10, 0, &set);
        assert_eq!(d.way, None);
        assert!(d.counter_access);

        fbr.set_count(0, 10, TagRole::Prime, 40);
        fbr.set_count(0, 20, TagRole::Sub, 5);
        fbr.set_count(0, 22, TagRole::Sub, 2);
        let d = fbr.handle_prime_tag_evict(&ctx(&tb), 0, 10, 0, &set);
        assert_eq!(d.way, Some(1));
    }

    #[test]
    fn unsampled_prime_evict_demotes_in_way() {
        let mut fbr = policy(params(0.0));
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), Some(12)], &[Some(20), Some(22)]);
        let d = fbr.handle_prime_tag_evict(&ctx(&tb), 1, 12, 0, &set);
        assert_eq!(d.way, Some(1));
        assert!(!d.counter_access);
    }

    #[test]
    fn counts_follow_tags_across_roles() {
        let mut fbr = policy(full_sampling());
        let tb = TagBuffer::new(4, 2);
        let before = set_with(&[Some(10), Some(12)], &[None, None]);
        fbr.handle_cache_hit(&ctx(&tb), 10, 0, &before, 0);
        fbr.set_count(0, 10, TagRole::Prime, 7);
        // 10 is demoted into way 1's sub slot and 14 takes its prime slot
        let after = set_with(&[Some(14), Some(12)], &[None, Some(10)]);
        fbr.handle_cache_hit(&ctx(&tb), 12, 0, &after, 1);
        assert_eq!(fbr.count(0, 10, TagRole::Sub), Some(7));
        assert_eq!(fbr.count(0, 14, TagRole::Prime), Some(0));
    }

    #[test]
    fn displaced_prime_keeps_its_count_as_a_candidate() {
        let mut fbr = policy(full_sampling());
        let tb = TagBuffer::new(4, 2);
        let before = set_with(&[Some(10), Some(12)], &[None, None]);
        fbr.handle_cache_hit(&ctx(&tb), 10, 0, &before, 0);
        fbr.set_count(0, 10, TagRole::Prime, 7);
        let after = set_with(&[Some(14), Some(12)], &[None, None]);
        fbr.handle_cache_hit(&ctx(&tb), 12, 0, &after, 1);
        assert_eq!(fbr.count(0, 10, TagRole::Prime), Some(7));
    }

    #[test]
    fn flush_forgets_all_counters() {
        let mut fbr = policy(full_sampling());
        let tb = TagBuffer::new(4, 2);
        let set = set_with(&[Some(10), None], &[None, None]);
        fbr.handle_cache_hit(&ctx(&tb), 10, 0, &set, 0);
        fbr.flush_chunk(0);
        assert_eq!(fbr.count(0, 10, TagRole::Prime), None);
        assert_eq!(fbr.stats().chunk_flushes, 1);
    }
}
