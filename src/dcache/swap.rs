//! Promotion of a sub-tag page into a prime slot after a hit.
//!
//! The swap is applied to a copy of the set and only written back once the tag buffer has
//! agreed to pin the tags involved, so a refused swap leaves the set untouched.

use log::debug;
use smallvec::SmallVec;

use crate::dcache::addr::LineLocation;
use crate::dcache::controller::MemoryController;
use crate::dcache::request::MemRequest;
use crate::dcache::way::{Set, TagMeta, TagRole};
use crate::mem::AccessEvent;
use crate::timeq::Cycle;

#[derive(Debug)]
struct SwapPlan {
    hit_way: usize,
    victim_way: usize,
    /// The whole set as it looks after the swap.
    staged: Set,
    promoted: u64,
    demoted: Option<u64>,
    writebacks: Writebacks,
    moved: SmallVec<[(u64, u64); 2]>,
}

impl SwapPlan {
    fn in_way(&self) -> bool {
        self.hit_way == self.victim_way
    }
}

type Writebacks = SmallVec<[(u64, u64); 2]>;

/// Drop `bits` from the page in `slot`, queueing any dirty ones. Returns the page's tag.
fn drop_overlap(slot: &mut Option<TagMeta>, bits: u64, writebacks: &mut Writebacks) -> Option<u64> {
    let meta = slot.as_mut()?;
    let dirty = meta.drop_blocks(bits);
    if dirty != 0 {
        writebacks.push((meta.tag, dirty));
    }
    Some(meta.tag)
}

fn stage_swap(
    set: &Set,
    hit_way: usize,
    victim_way: usize,
    access_bit: u64,
    dirties: bool,
) -> Option<SwapPlan> {
    let mut promoted = set.way(hit_way).sub?;
    promoted.valid |= access_bit;
    promoted.reference |= access_bit;
    if dirties {
        promoted.dirty |= access_bit;
    }
    let mut staged = set.clone();
    let mut writebacks = Writebacks::new();
    let mut moved = SmallVec::new();

    let demoted = if hit_way == victim_way {
        let way = staged.way_mut(hit_way);
        way.replace(TagRole::Sub, Some(promoted));
        way.exchange_roles();
        way.in_way_replacements = way.in_way_replacements.saturating_add(1);
        drop_overlap(way.slot_mut(TagRole::Sub), promoted.valid, &mut writebacks)
    } else {
        let (hit, victim) = staged.pair_mut(hit_way, victim_way);
        hit.replace(TagRole::Sub, None);
        drop_overlap(victim.slot_mut(TagRole::Sub), promoted.valid, &mut writebacks);
        let mut demoted = victim.replace(TagRole::Prime, Some(promoted));
        moved.push((promoted.tag, promoted.valid));
        let tag = drop_overlap(&mut demoted, hit.prime_valid(), &mut writebacks);
        if let Some(d) = demoted {
            moved.push((d.tag, d.valid));
        }
        hit.replace(TagRole::Sub, demoted);
        tag
    };

    Some(SwapPlan {
        hit_way,
        victim_way,
        staged,
        promoted: promoted.tag,
        demoted,
        writebacks,
        moved,
    })
}

impl MemoryController {
    /// Promote the sub page hit in `hit_way` to the prime slot of `victim_way`.
    pub(crate) fn promote_sub(
        &mut self,
        req: &MemRequest,
        loc: &LineLocation,
        hit_way: usize,
        victim_way: usize,
        now: Cycle,
    ) {
        let victim_way = if self.cfg.in_way_replace {
            hit_way
        } else {
            victim_way
        };
        let Some(plan) = stage_swap(
            &self.sets[loc.set],
            hit_way,
            victim_way,
            loc.access_bit,
            req.kind.dirties(),
        ) else {
            return;
        };
        let fits = match plan.demoted {
            Some(d) => self.tag_buffer.can_insert_pair(plan.promoted, d),
            None => self.tag_buffer.can_insert(plan.promoted),
        };
        if !fits {
            debug!(
                "swap of {:#x} into way {} skipped: tag buffer full",
                plan.promoted, victim_way
            );
            self.stats.skipped_swaps += 1;
            return;
        }
        self.commit_swap(req, loc.set, plan, now);
    }

    fn commit_swap(&mut self, req: &MemRequest, set_idx: usize, plan: SwapPlan, now: Cycle) {
        let in_way = plan.in_way();
        plan.staged.way(plan.hit_way).check_invariants();
        plan.staged.way(plan.victim_way).check_invariants();
        self.sets[set_idx] = plan.staged;

        self.locator.bind(plan.promoted, plan.victim_way);
        if let Some(d) = plan.demoted {
            self.locator.bind(d, plan.hit_way);
        }
        self.tag_buffer.insert(plan.promoted, true);
        if let Some(d) = plan.demoted {
            self.tag_buffer.insert(d, true);
        }

        for &(tag, bits) in &plan.writebacks {
            self.write_back(req, tag, bits, now);
            self.stats.conflict_writebacks += 1;
        }
        for &(tag, bits) in &plan.moved {
            let bursts = self.bursts_for(bits);
            let base = self.geo.page_base(tag);
            self.fast_access(req, base, now, AccessEvent::Prefetch, bursts);
        }
        if in_way {
            self.stats.in_way_swaps += 1;
        } else {
            self.stats.cross_way_swaps += 1;
        }
        debug!(
            "promoted {:#x} to prime of way {} (demoted {:?}, in-way {})",
            plan.promoted, plan.victim_way, plan.demoted, in_way
        );
    }
}
