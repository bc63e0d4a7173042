use super::{AccessEvent, MemoryTier, TierStats};
use crate::dcache::request::MemRequest;
use crate::timeq::Cycle;

/// Every access completes a fixed latency after it is issued.
#[derive(Debug)]
pub struct SimpleMemory {
    name: String,
    latency: Cycle,
    stats: TierStats,
}

impl SimpleMemory {
    pub fn new(name: &str, latency: Cycle) -> Self {
        Self {
            name: name.to_string(),
            latency,
            stats: TierStats::default(),
        }
    }
}

impl MemoryTier for SimpleMemory {
    fn access(&mut self, req: &MemRequest, event: AccessEvent, size: u32) -> Cycle {
        let done = req.cycle.saturating_add(self.latency);
        self.stats.record(event, size, done);
        done
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> TierStats {
        self.stats
    }
}
