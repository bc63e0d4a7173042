//! Bandwidth balancing between the tiers.
//!
//! Sets below `ds_index` stop caching: their pages are drained and later accesses go straight
//! to the slow tier. The boundary moves up when the fast tier carries too large a share of the
//! recent traffic and back down when it carries too little.

use log::info;

use crate::dcache::controller::MemoryController;
use crate::dcache::request::MemRequest;
use crate::dcache::way::Set;
use crate::mem::AccessEvent;
use crate::timeq::Cycle;

/// Share of burst traffic the fast tier should carry.
pub const TARGET_FAST_RATIO: f64 = 0.8;
/// Deviation from the target that is left alone.
pub const RATIO_DEADBAND: f64 = 0.02;
const RATIO_UNIT: f64 = 0.01;

/// Signed number of sets to move `ds_index` by for an observed fast-tier share.
pub fn balance_delta(fast_ratio: f64, step: u64) -> i64 {
    let error = fast_ratio - TARGET_FAST_RATIO;
    if error.abs() < RATIO_DEADBAND {
        return 0;
    }
    (step as f64 * error / RATIO_UNIT) as i64
}

impl MemoryController {
    /// Decay the traffic window and, when enabled, move the drained-set boundary.
    pub(crate) fn balance(&mut self, req: &MemRequest, now: Cycle) {
        self.recent.halve();
        if !self.cfg.bw_balance {
            return;
        }
        let Some(ratio) = self.recent.fast_ratio() else {
            return;
        };
        let delta = balance_delta(ratio, self.balance_step);
        if delta == 0 {
            return;
        }
        let num_sets = self.sets.len() as u64;
        let old = self.ds_index;
        let new = (old as i64).saturating_add(delta).clamp(0, num_sets as i64) as u64;
        for set_idx in old..new {
            self.drain_set(req, set_idx as usize, now);
        }
        self.ds_index = new;
        if new != old {
            info!(
                "ds_index {} -> {} of {} sets (fast share {:.3})",
                old, new, num_sets, ratio
            );
        }
    }

    /// Write back and drop every page of a set leaving the cache.
    fn drain_set(&mut self, req: &MemRequest, set_idx: usize, now: Cycle) {
        let drained = std::mem::replace(&mut self.sets[set_idx], Set::new(self.cfg.ways));
        for way in drained.ways() {
            for meta in way.prime.iter().chain(way.sub.iter()) {
                let dirty = meta.dirty_valid();
                if dirty != 0 {
                    let bursts = self.bursts_for(dirty);
                    let base = self.geo.page_base(meta.tag);
                    self.fast_access(req, base, now, AccessEvent::Load, bursts);
                    self.write_back(req, meta.tag, dirty, now);
                }
                self.locator.unbind(meta.tag, meta.reference);
                if !self.tag_buffer.can_insert(meta.tag) {
                    self.flush_tag_buffer(now);
                }
                self.tag_buffer.insert(meta.tag, true);
            }
        }
        self.policy.flush_chunk(set_idx);
        self.stats.drained_sets += 1;
    }
}
