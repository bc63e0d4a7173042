//! Victim selection for the dual-tag cache.
//!
//! Both schemes answer the same three questions: which prime way a missing page should take,
//! which sub way a displaced prime should be demoted into, and whether a sub-tag hit earns a
//! promotion into a prime slot. `None` always means "leave the cache as it is".

mod fbr;
mod lru;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::dcache::config::{DramCacheConfig, PlacementScheme};
use crate::dcache::request::AccessKind;
use crate::dcache::tag_buffer::TagBuffer;
use crate::dcache::way::Set;

pub use fbr::FbrPolicy;
pub use lru::LruPolicy;

/// Controller state a policy may read while making one decision.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub tag_buffer: &'a TagBuffer,
    pub recent_miss_rate: f64,
    pub num_requests: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlacementDecision {
    pub way: Option<usize>,
    /// A placement counter was read and written for this decision.
    pub counter_access: bool,
}

impl PlacementDecision {
    pub fn decline() -> Self {
        Self::default()
    }

    pub fn to_way(way: usize) -> Self {
        Self {
            way: Some(way),
            counter_access: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlacementParams {
    pub sample_rate: f64,
    pub miss_rate_threshold: f64,
    pub enable_replace: bool,
    pub in_way_replace: bool,
    pub replace_on_store: bool,
    pub granularity: u64,
    pub entries_per_chunk: usize,
    pub max_count_size: u32,
    pub warmup_requests: u64,
}

impl PlacementParams {
    pub fn from_config(cfg: &DramCacheConfig) -> Self {
        Self {
            sample_rate: cfg.sample_rate,
            miss_rate_threshold: cfg.miss_rate_threshold,
            enable_replace: cfg.enable_replace,
            in_way_replace: cfg.in_way_replace,
            replace_on_store: cfg.replace_on_store,
            granularity: cfg.granularity,
            entries_per_chunk: cfg.entries_per_chunk,
            max_count_size: cfg.counter_limit(),
            warmup_requests: cfg.warmup(),
        }
    }

    /// Count lead a challenger needs over the resident it would displace.
    pub fn margin(&self) -> f64 {
        (self.granularity / 64 / 2) as f64 * self.sample_rate
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PlacementStats {
    pub counter_reads: u64,
    pub counter_writes: u64,
    pub empty_prime_fills: u64,
    pub empty_sub_fills: u64,
    pub sub_promotions: u64,
    pub declined: u64,
    pub chunk_flushes: u64,
}

impl PlacementStats {
    pub(crate) fn record_counter_access(&mut self) {
        self.counter_reads = self.counter_reads.saturating_add(1);
        self.counter_writes = self.counter_writes.saturating_add(1);
    }

    pub(crate) fn record_decline(&mut self) {
        self.declined = self.declined.saturating_add(1);
    }
}

/// Bernoulli draw shared by both schemes.
pub(crate) fn draw(rng: &mut StdRng, probability: f64) -> bool {
    rng.gen::<f64>() < probability
}

#[derive(Debug)]
pub enum PlacementPolicy {
    Lru(LruPolicy),
    Fbr(FbrPolicy),
}

impl PlacementPolicy {
    pub fn new(cfg: &DramCacheConfig, num_sets: usize) -> Result<Self> {
        cfg.ensure_valid()?;
        let params = PlacementParams::from_config(cfg);
        let rng = StdRng::seed_from_u64(cfg.seed);
        Ok(match cfg.placement_policy {
            PlacementScheme::Lru => Self::Lru(LruPolicy::new(num_sets, cfg.ways, params, rng)),
            PlacementScheme::Fbr => Self::Fbr(FbrPolicy::new(num_sets, cfg.ways, params, rng)),
        })
    }

    pub fn scheme(&self) -> PlacementScheme {
        match self {
            Self::Lru(_) => PlacementScheme::Lru,
            Self::Fbr(_) => PlacementScheme::Fbr,
        }
    }

    /// Prime way for a page that missed, if it should be installed.
    pub fn handle_cache_miss(
        &mut self,
        ctx: &PolicyContext,
        tag: u64,
        access: AccessKind,
        set_idx: usize,
        set: &Set,
    ) -> PlacementDecision {
        match self {
            Self::Lru(p) => p.handle_cache_miss(ctx, tag, set_idx, set),
            Self::Fbr(p) => p.handle_cache_miss(ctx, tag, access, set_idx, set),
        }
    }

    /// Sub way receiving the prime page displaced from `replaced_way`.
    pub fn handle_prime_tag_evict(
        &mut self,
        ctx: &PolicyContext,
        replaced_way: usize,
        demoted_tag: u64,
        set_idx: usize,
        set: &Set,
    ) -> PlacementDecision {
        match self {
            Self::Lru(p) => p.handle_prime_tag_evict(ctx, replaced_way, demoted_tag, set_idx, set),
            Self::Fbr(p) => p.handle_prime_tag_evict(ctx, replaced_way, demoted_tag, set_idx, set),
        }
    }

    /// Prime way a sub-tag hit should be promoted into, if any.
    pub fn handle_cache_hit(
        &mut self,
        ctx: &PolicyContext,
        tag: u64,
        set_idx: usize,
        set: &Set,
        hit_way: usize,
    ) -> PlacementDecision {
        match self {
            Self::Lru(p) => p.handle_cache_hit(tag, set_idx, set, hit_way),
            Self::Fbr(p) => p.handle_cache_hit(ctx, tag, set_idx, set, hit_way),
        }
    }

    /// Forget all frequency state for a set that stopped caching.
    pub fn flush_chunk(&mut self, set_idx: usize) {
        if let Self::Fbr(p) = self {
            p.flush_chunk(set_idx);
        }
    }

    pub fn stats(&self) -> PlacementStats {
        match self {
            Self::Lru(p) => p.stats(),
            Self::Fbr(p) => p.stats(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::dcache::way::TagMeta;

    pub fn params(sample_rate: f64) -> PlacementParams {
        PlacementParams {
            sample_rate,
            miss_rate_threshold: 0.3,
            enable_replace: true,
            in_way_replace: false,
            replace_on_store: false,
            granularity: 4096,
            entries_per_chunk: 4,
            max_count_size: 31,
            warmup_requests: 0,
        }
    }

    pub fn ctx(tb: &TagBuffer) -> PolicyContext<'_> {
        PolicyContext {
            tag_buffer: tb,
            recent_miss_rate: 1.0,
            num_requests: 1_000_000,
        }
    }

    /// Set whose ways hold the given prime and sub tags, each with one valid block.
    pub fn set_with(primes: &[Option<u64>], subs: &[Option<u64>]) -> Set {
        let mut set = Set::new(primes.len());
        for (way, (p, s)) in primes.iter().zip(subs.iter()).enumerate() {
            set.way_mut(way).prime = p.map(|t| TagMeta::installed(t, 0b01, 0b01, false));
            set.way_mut(way).sub = s.map(|t| TagMeta::installed(t, 0b10, 0b10, false));
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_scales_with_page_and_rate() {
        let mut p = test_support::params(0.5);
        assert_eq!(p.margin(), 16.0);
        p.granularity = 8192;
        p.sample_rate = 1.0;
        assert_eq!(p.margin(), 64.0);
    }

    #[test]
    fn scheme_selected_once_from_config() {
        let mut cfg = DramCacheConfig::default();
        cfg.placement_policy = PlacementScheme::Lru;
        let policy = PlacementPolicy::new(&cfg, 4).expect("policy");
        assert_eq!(policy.scheme(), PlacementScheme::Lru);
        cfg.placement_policy = PlacementScheme::Fbr;
        let policy = PlacementPolicy::new(&cfg, 4).expect("policy");
        assert_eq!(policy.scheme(), PlacementScheme::Fbr);
    }

    #[test]
    fn invalid_policy_config_is_rejected() {
        let mut cfg = DramCacheConfig::default();
        cfg.sample_rate = 1.5;
        assert!(PlacementPolicy::new(&cfg, 4).is_err());
    }
}
