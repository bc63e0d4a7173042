use anyhow::{bail, Result};
use serde::Deserialize;

use crate::dcache::addr::LINE_BYTES;
use crate::sim::config::Config;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlacementScheme {
    Lru,
    #[default]
    Fbr,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DramCacheConfig {
    pub capacity_bytes: u64,
    pub ways: usize,
    /// Page size tracked by one tag, in bytes.
    pub granularity: u64,
    /// Lines per footprint sub-block.
    pub footprint_size: u64,
    pub channels: u64,
    pub tag_buffer_size: usize,
    pub tag_buffer_ways: usize,
    pub placement_policy: PlacementScheme,
    pub sample_rate: f64,
    pub miss_rate_threshold: f64,
    pub enable_replace: bool,
    pub in_way_replace: bool,
    pub replace_on_store: bool,
    pub bw_balance: bool,
    /// Sets moved per 1% of bandwidth-ratio error; `num_sets / 1000`, at least 1, when unset.
    pub balance_step_sets: Option<u64>,
    pub sram_tag: bool,
    pub sram_tag_latency: u64,
    pub entries_per_chunk: usize,
    pub max_count_size: Option<u32>,
    pub warmup_requests: Option<u64>,
    pub seed: u64,
}

impl Config for DramCacheConfig {}

impl Default for DramCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 << 20,
            ways: 4,
            granularity: 4096,
            footprint_size: 4,
            channels: 4,
            tag_buffer_size: 1024,
            tag_buffer_ways: 8,
            placement_policy: PlacementScheme::Fbr,
            sample_rate: 0.1,
            miss_rate_threshold: 0.3,
            enable_replace: true,
            in_way_replace: false,
            replace_on_store: false,
            bw_balance: false,
            balance_step_sets: None,
            sram_tag: false,
            sram_tag_latency: 10,
            entries_per_chunk: 9,
            max_count_size: None,
            warmup_requests: None,
            seed: 0,
        }
    }
}

impl DramCacheConfig {
    pub fn num_sets(&self) -> u64 {
        if self.ways == 0 || self.granularity == 0 {
            return 0;
        }
        self.capacity_bytes / self.ways as u64 / self.granularity
    }

    pub fn capacity_lines(&self) -> u64 {
        self.capacity_bytes / LINE_BYTES
    }

    pub fn balance_step(&self) -> u64 {
        self.balance_step_sets
            .unwrap_or((self.num_sets() / 1000).max(1))
    }

    pub fn counter_limit(&self) -> u32 {
        self.max_count_size.unwrap_or(
            if self.sample_rate >= 1.0 || self.granularity > 4096 {
                255
            } else {
                31
            },
        )
    }

    pub fn warmup(&self) -> u64 {
        self.warmup_requests
            .unwrap_or(self.num_sets() * self.ways as u64 * 64 * 8)
    }

    /// Reject geometry and policy parameters the controller cannot run with.
    /// Address-decomposition limits are checked by `FootprintGeometry`.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.ways == 0 {
            bail!("ways must be > 0");
        }
        if self.num_sets() == 0 {
            bail!(
                "capacity {} bytes with {} ways of {}-byte pages yields no sets",
                self.capacity_bytes,
                self.ways,
                self.granularity
            );
        }
        if self.tag_buffer_ways < 2 {
            bail!("tag_buffer_ways must be at least 2 to pin a pair of tags");
        }
        if self.tag_buffer_size < self.tag_buffer_ways
            || self.tag_buffer_size % self.tag_buffer_ways != 0
        {
            bail!(
                "tag_buffer_size {} must be a non-zero multiple of tag_buffer_ways {}",
                self.tag_buffer_size,
                self.tag_buffer_ways
            );
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            bail!("sample_rate {} outside [0, 1]", self.sample_rate);
        }
        if !(0.0..=1.0).contains(&self.miss_rate_threshold) {
            bail!("miss_rate_threshold {} outside [0, 1]", self.miss_rate_threshold);
        }
        if self.placement_policy == PlacementScheme::Fbr {
            if self.entries_per_chunk <= self.ways {
                bail!(
                    "entries_per_chunk {} must exceed the {} ways",
                    self.entries_per_chunk,
                    self.ways
                );
            }
            if self.counter_limit() < 2 {
                bail!("max_count_size must be at least 2");
            }
        }
        if self.bw_balance && self.balance_step_sets == Some(0) {
            bail!("balance_step_sets must be > 0 when bw_balance is enabled");
        }
        Ok(())
    }
}
