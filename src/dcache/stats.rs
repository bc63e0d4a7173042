use serde::Serialize;
use std::ops::AddAssign;

use crate::dcache::placement::PlacementStats;
use crate::mem::TierStats;

/// Pages bucketed by how many of their lines were referenced before eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TouchedLineHistogram {
    pub upto_8: u64,
    pub upto_16: u64,
    pub upto_24: u64,
    pub upto_32: u64,
    pub upto_48: u64,
    pub below_64: u64,
    pub full: u64,
}

impl TouchedLineHistogram {
    /// `lines` is the number of referenced lines of a page holding `lines_per_page`.
    pub fn record(&mut self, lines: u64, lines_per_page: u64) {
        let bucket = if lines >= lines_per_page {
            &mut self.full
        } else if lines <= 8 {
            &mut self.upto_8
        } else if lines <= 16 {
            &mut self.upto_16
        } else if lines <= 24 {
            &mut self.upto_24
        } else if lines <= 32 {
            &mut self.upto_32
        } else if lines <= 48 {
            &mut self.upto_48
        } else {
            &mut self.below_64
        };
        *bucket = bucket.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.upto_8
            + self.upto_16
            + self.upto_24
            + self.upto_32
            + self.upto_48
            + self.below_64
            + self.full
    }
}

impl AddAssign<&TouchedLineHistogram> for TouchedLineHistogram {
    fn add_assign(&mut self, other: &TouchedLineHistogram) {
        self.upto_8 = self.upto_8.saturating_add(other.upto_8);
        self.upto_16 = self.upto_16.saturating_add(other.upto_16);
        self.upto_24 = self.upto_24.saturating_add(other.upto_24);
        self.upto_32 = self.upto_32.saturating_add(other.upto_32);
        self.upto_48 = self.upto_48.saturating_add(other.upto_48);
        self.below_64 = self.below_64.saturating_add(other.below_64);
        self.full = self.full.saturating_add(other.full);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ControllerStats {
    pub requests: u64,
    pub load_hits: u64,
    pub load_misses: u64,
    pub store_hits: u64,
    pub store_misses: u64,
    pub clean_writebacks: u64,
    pub passthrough: u64,
    pub tag_buffer_hits: u64,
    pub tag_buffer_misses: u64,
    pub tag_buffer_dirty_hits: u64,
    pub tag_buffer_dirty_misses: u64,
    pub tag_buffer_flushes: u64,
    pub tag_loads: u64,
    pub real_hits: u64,
    pub false_hits: u64,
    pub sub_tag_hits: u64,
    pub placements: u64,
    pub demotions: u64,
    pub clean_evictions: u64,
    pub dirty_evictions: u64,
    pub evicted_dirty_lines: u64,
    pub evicted_valid_primes: u64,
    pub conflict_writebacks: u64,
    pub in_way_swaps: u64,
    pub cross_way_swaps: u64,
    pub skipped_swaps: u64,
    pub counter_accesses: u64,
    pub touched_pages: u64,
    pub touched_lines: TouchedLineHistogram,
    pub drained_sets: u64,
    pub ds_index: u64,
    pub placement: PlacementStats,
    pub fast_tier: TierStats,
    pub slow_tier: TierStats,
}

impl ControllerStats {
    pub fn hits(&self) -> u64 {
        self.load_hits + self.store_hits
    }

    pub fn misses(&self) -> u64 {
        self.load_misses + self.store_misses
    }

    pub fn miss_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.misses() as f64 / total as f64
    }
}

/// Counters decayed by the bandwidth-balance loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecentTraffic {
    pub hits: u64,
    pub misses: u64,
    pub fast_bursts: u64,
    pub slow_bursts: u64,
}

impl RecentTraffic {
    pub fn halve(&mut self) {
        self.hits /= 2;
        self.misses /= 2;
        self.fast_bursts /= 2;
        self.slow_bursts /= 2;
    }

    /// Miss rate over the decayed window; 1.0 until anything was observed.
    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 1.0;
        }
        self.misses as f64 / total as f64
    }

    /// Share of recent traffic served by the fast tier, if any traffic was seen.
    pub fn fast_ratio(&self) -> Option<f64> {
        let total = self.fast_bursts + self.slow_bursts;
        if total == 0 {
            return None;
        }
        Some(self.fast_bursts as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_touched_lines() {
        let mut h = TouchedLineHistogram::default();
        for lines in [4, 8, 9, 24, 32, 40, 60, 64] {
            h.record(lines, 64);
        }
        assert_eq!(h.upto_8, 2);
        assert_eq!(h.upto_16, 1);
        assert_eq!(h.upto_24, 1);
        assert_eq!(h.upto_32, 1);
        assert_eq!(h.upto_48, 1);
        assert_eq!(h.below_64, 1);
        assert_eq!(h.full, 1);
        assert_eq!(h.total(), 8);
    }

    #[test]
    fn large_pages_are_full_only_at_their_own_size() {
        let mut h = TouchedLineHistogram::default();
        h.record(64, 128);
        h.record(128, 128);
        assert_eq!(h.below_64, 1);
        assert_eq!(h.full, 1);
    }

    #[test]
    fn recent_window_decays_and_defaults_to_missing() {
        let mut recent = RecentTraffic::default();
        assert_eq!(recent.miss_rate(), 1.0);
        assert_eq!(recent.fast_ratio(), None);
        recent.hits = 3;
        recent.misses = 1;
        recent.fast_bursts = 8;
        recent.slow_bursts = 2;
        assert!((recent.miss_rate() - 0.25).abs() < 1e-9);
        assert!((recent.fast_ratio().unwrap_or_default() - 0.8).abs() < 1e-9);
        recent.halve();
        assert_eq!((recent.hits, recent.misses), (1, 0));
        assert_eq!((recent.fast_bursts, recent.slow_bursts), (4, 1));
    }

    #[test]
    fn stats_serialize_to_json() {
        let mut stats = ControllerStats::default();
        stats.load_hits = 3;
        stats.load_misses = 1;
        let json = serde_json::to_value(stats).expect("serialize");
        assert_eq!(json["load_hits"], 3);
        assert_eq!(json["touched_lines"]["full"], 0);
        assert!((stats.miss_rate() - 0.25).abs() < 1e-9);
    }
}
