//! Timing models behind the controller. The controller only chains the cycles they return.

mod bandwidth;
mod simple;

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use crate::dcache::request::MemRequest;
use crate::sim::config::Config;
use crate::timeq::Cycle;

pub use bandwidth::BandwidthMemory;
pub use simple::SimpleMemory;

pub const BURST_BYTES: u32 = 16;
/// Bursts in one 64-byte line.
pub const LINE_BURSTS: u32 = 4;
/// Bursts read or written for a metadata-only access of the fast tier.
pub const TAG_PROBE_BURSTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessEvent {
    Load,
    Store,
    Prefetch,
}

pub trait MemoryTier: Send {
    /// Serve `size` bursts for `req`, returning the completion cycle.
    fn access(&mut self, req: &MemRequest, event: AccessEvent, size: u32) -> Cycle;

    fn name(&self) -> &str;

    fn stats(&self) -> TierStats;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub loads: u64,
    pub stores: u64,
    pub prefetches: u64,
    pub bursts: u64,
    pub last_completion: Cycle,
}

impl TierStats {
    pub fn accesses(&self) -> u64 {
        self.loads + self.stores + self.prefetches
    }

    pub fn record(&mut self, event: AccessEvent, size: u32, done: Cycle) {
        let counter = match event {
            AccessEvent::Load => &mut self.loads,
            AccessEvent::Store => &mut self.stores,
            AccessEvent::Prefetch => &mut self.prefetches,
        };
        *counter = counter.saturating_add(1);
        self.bursts = self.bursts.saturating_add(size as u64);
        self.last_completion = self.last_completion.max(done);
    }
}

impl AddAssign<&TierStats> for TierStats {
    fn add_assign(&mut self, other: &TierStats) {
        self.loads = self.loads.saturating_add(other.loads);
        self.stores = self.stores.saturating_add(other.stores);
        self.prefetches = self.prefetches.saturating_add(other.prefetches);
        self.bursts = self.bursts.saturating_add(other.bursts);
        self.last_completion = self.last_completion.max(other.last_completion);
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TierModel {
    #[default]
    Simple,
    Bandwidth,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TierConfig {
    pub model: TierModel,
    pub latency: Cycle,
    /// Only used by the bandwidth model.
    pub bytes_per_cycle: u32,
}

impl Config for TierConfig {}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            model: TierModel::Simple,
            latency: 100,
            bytes_per_cycle: 16,
        }
    }
}

impl TierConfig {
    pub fn fast_default() -> Self {
        Self {
            model: TierModel::Bandwidth,
            latency: 40,
            bytes_per_cycle: 64,
        }
    }

    pub fn slow_default() -> Self {
        Self {
            model: TierModel::Bandwidth,
            latency: 100,
            bytes_per_cycle: 16,
        }
    }

    pub fn build(&self, name: &str) -> anyhow::Result<Box<dyn MemoryTier>> {
        Ok(match self.model {
            TierModel::Simple => Box::new(SimpleMemory::new(name, self.latency)),
            TierModel::Bandwidth => {
                if self.bytes_per_cycle == 0 {
                    anyhow::bail!("{}: bytes_per_cycle must be > 0", name);
                }
                Box::new(BandwidthMemory::new(name, self.latency, self.bytes_per_cycle))
            }
        })
    }
}
