//! Miss handling: fetch from the slow tier and, if the policy agrees, install the page.

use log::debug;
use smallvec::SmallVec;

use crate::dcache::addr::LineLocation;
use crate::dcache::controller::MemoryController;
use crate::dcache::placement::PolicyContext;
use crate::dcache::request::{AccessKind, MemRequest};
use crate::dcache::way::{Set, TagMeta, TagRole};
use crate::mem::{AccessEvent, LINE_BURSTS};
use crate::timeq::Cycle;

/// Changes to the set caused by one install, computed before anything is committed.
#[derive(Debug)]
struct Install {
    prime_way: usize,
    prime: TagMeta,
    /// Prime page pushed out of `prime_way`, whether demoted or evicted.
    displaced: Option<TagMeta>,
    /// Where the displaced page lands, if it stays cached.
    demotion: Option<(usize, TagMeta)>,
    /// Page leaving the cache: the displaced prime or the sub it was demoted over.
    evicted: Option<TagMeta>,
    /// Sub kept in the prime way after dropping blocks the new page brings in.
    kept_sub: Option<TagMeta>,
    writebacks: SmallVec<[(u64, u64); 2]>,
}

fn stage_install(
    set: &Set,
    prime_way: usize,
    new_prime: TagMeta,
    sub_way: Option<usize>,
) -> Install {
    let way = set.way(prime_way);
    let mut writebacks = SmallVec::new();
    let mut kept_sub = way.sub;
    let mut evicted = None;
    let mut demotion = None;

    match (way.prime, sub_way) {
        (None, _) => {}
        (Some(displaced), None) => evicted = Some(displaced),
        (Some(mut displaced), Some(sw)) => {
            let target = set.way(sw);
            evicted = target.sub;
            // in-way demotion takes over the sub slot
            let keep_out = if sw == prime_way {
                kept_sub = None;
                new_prime.valid
            } else {
                target.prime_valid()
            };
            let dirty = displaced.drop_blocks(keep_out);
            if dirty != 0 {
                writebacks.push((displaced.tag, dirty));
            }
            demotion = Some((sw, displaced));
        }
    }

    if let Some(sub) = kept_sub.as_mut() {
        let dirty = sub.drop_blocks(new_prime.valid);
        if dirty != 0 {
            writebacks.push((sub.tag, dirty));
        }
    }

    Install {
        prime_way,
        prime: new_prime,
        displaced: way.prime,
        demotion,
        evicted,
        kept_sub,
        writebacks,
    }
}

impl MemoryController {
    pub(crate) fn handle_miss(
        &mut self,
        req: &MemRequest,
        loc: &LineLocation,
        now: Cycle,
        needs_probe: bool,
        passthrough: bool,
    ) -> Cycle {
        let access = req.kind.access_kind();
        match access {
            AccessKind::Load => self.stats.load_misses += 1,
            AccessKind::Store => self.stats.store_misses += 1,
        }
        self.recent.misses += 1;
        let event = match access {
            AccessKind::Load => AccessEvent::Load,
            AccessKind::Store => AccessEvent::Store,
        };

        if passthrough {
            self.stats.passthrough += 1;
            return self.slow_access(req, req.line_addr, now, event, LINE_BURSTS);
        }

        let now = if needs_probe {
            self.probe_tags(req, loc, now)
        } else {
            now
        };
        let ready = self.slow_access(req, req.line_addr, now, event, LINE_BURSTS);

        let decision = self.policy.handle_cache_miss(
            &PolicyContext {
                tag_buffer: &self.tag_buffer,
                recent_miss_rate: self.recent.miss_rate(),
                num_requests: self.num_requests,
            },
            loc.tag,
            access,
            loc.set,
            &self.sets[loc.set],
        );
        self.model_counter_access(req, &decision, ready);

        match decision.way {
            Some(way) => self.install(req, loc, way, ready),
            None => {
                if access == AccessKind::Load && self.tag_buffer.can_insert(loc.tag) {
                    self.tag_buffer.insert(loc.tag, false);
                }
            }
        }
        ready
    }

    /// Install the missing page as the prime of `prime_way`, prefetching its history.
    fn install(&mut self, req: &MemRequest, loc: &LineLocation, prime_way: usize, now: Cycle) {
        let (tag, set_idx) = (loc.tag, loc.set);
        let prefetch = self.locator.history(tag) | loc.access_bit;
        let new_prime = TagMeta::installed(tag, prefetch, loc.access_bit, req.kind.dirties());

        let displaced = self.sets[set_idx].way(prime_way).prime;
        let sub_way = match displaced {
            Some(displaced) => {
                let decision = self.policy.handle_prime_tag_evict(
                    &PolicyContext {
                        tag_buffer: &self.tag_buffer,
                        recent_miss_rate: self.recent.miss_rate(),
                        num_requests: self.num_requests,
                    },
                    prime_way,
                    displaced.tag,
                    set_idx,
                    &self.sets[set_idx],
                );
                self.model_counter_access(req, &decision, now);
                decision.way
            }
            None => None,
        };
        let plan = stage_install(&self.sets[set_idx], prime_way, new_prime, sub_way);
        self.commit_install(req, set_idx, plan, now);

        let bursts = self.bursts_for(prefetch);
        let base = self.geo.page_base(tag);
        self.slow_access(req, base, now, AccessEvent::Prefetch, bursts);
        self.fast_access(req, base, now, AccessEvent::Prefetch, bursts);
        self.locator.bind(tag, prime_way);
        self.locator.set_history(tag, prefetch);
        self.stats.placements += 1;
    }

    fn commit_install(&mut self, req: &MemRequest, set_idx: usize, plan: Install, now: Cycle) {
        let set = &mut self.sets[set_idx];
        {
            let way = set.way_mut(plan.prime_way);
            way.replace(TagRole::Prime, Some(plan.prime));
            way.replace(TagRole::Sub, plan.kept_sub);
        }
        if let Some((sw, demoted)) = plan.demotion {
            let target = set.way_mut(sw);
            target.replace(TagRole::Sub, Some(demoted));
            if sw == plan.prime_way {
                target.role_changed = true;
                target.in_way_replacements = target.in_way_replacements.saturating_add(1);
            }
        }
        set.way(plan.prime_way).check_invariants();
        if let Some((sw, _)) = plan.demotion {
            set.way(sw).check_invariants();
        }

        if let Some(meta) = plan.evicted {
            self.evict_page(req, &meta, now);
        }
        if plan.displaced.is_some_and(|d| d.valid != 0) {
            self.stats.evicted_valid_primes += 1;
        }
        if let Some((sw, demoted)) = plan.demotion {
            self.locator.bind(demoted.tag, sw);
            self.stats.demotions += 1;
            if sw != plan.prime_way {
                self.stats.placements += 1;
                let bursts = self.bursts_for(demoted.valid);
                let base = self.geo.page_base(demoted.tag);
                self.fast_access(req, base, now, AccessEvent::Prefetch, bursts);
            }
        }
        for &(tag, bits) in &plan.writebacks {
            self.write_back(req, tag, bits, now);
            self.stats.conflict_writebacks += 1;
        }

        let evicted_tag = plan.evicted.map(|m| m.tag);
        self.pin(plan.prime.tag, evicted_tag, now);
        debug!(
            "installed {:#x} in way {} (demoted {:?}, evicted {:?})",
            plan.prime.tag,
            plan.prime_way,
            plan.demotion.map(|(sw, d)| (d.tag, sw)),
            evicted_tag
        );
    }
}
