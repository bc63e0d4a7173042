use super::{AccessEvent, MemoryTier, TierStats, BURST_BYTES};
use crate::dcache::request::MemRequest;
use crate::timeq::{BandwidthServer, Cycle, ServerConfig};

/// Tier with a base latency and a bytes-per-cycle transfer budget; overlapping accesses
/// queue behind each other's transfers.
#[derive(Debug)]
pub struct BandwidthMemory {
    name: String,
    server: BandwidthServer,
    stats: TierStats,
}

impl BandwidthMemory {
    pub fn new(name: &str, latency: Cycle, bytes_per_cycle: u32) -> Self {
        Self {
            name: name.to_string(),
            server: BandwidthServer::new(ServerConfig {
                base_latency: latency,
                bytes_per_cycle,
            }),
            stats: TierStats::default(),
        }
    }

    pub fn available_at(&self) -> Cycle {
        self.server.available_at()
    }
}

impl MemoryTier for BandwidthMemory {
    fn access(&mut self, req: &MemRequest, event: AccessEvent, size: u32) -> Cycle {
        let ticket = self.server.serve(req.cycle, size.saturating_mul(BURST_BYTES));
        self.stats.record(event, size, ticket.ready_at());
        ticket.ready_at()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> TierStats {
        self.stats
    }
}
