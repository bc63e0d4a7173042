/*
Service-time helpers for the reference memory tiers.

The cache controller never looks inside a timing model; it only chains the completion cycles
that the tiers hand back.  The tiers in `crate::mem` are built on the server below, which enforces
a simple service law:
    - A base latency plus a throughput component expressed in bytes-per-cycle

Requests are served in arrival order.  A request that arrives while the server is still busy
with earlier work starts when the server frees up, so sustained traffic above the configured
bandwidth shows up as growing completion cycles rather than as rejections.
*/

pub type Cycle = u64;

// Result of handing a request to a bandwidth server
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
    size_bytes: u32,
}

impl Ticket {
    fn new(issued_at: Cycle, ready_at: Cycle, size_bytes: u32) -> Self {
        Self {
            issued_at,
            ready_at,
            size_bytes,
        }
    }

    // Cycle at which the request entered the server.
    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    // Cycle at which the server makes the payload available.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    // Number of cycles between issue and completion.
    pub fn latency(&self) -> Cycle {
        self.ready_at.saturating_sub(self.issued_at)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    // Fixed latency added to every request
    pub base_latency: Cycle,
    // Throughput
    pub bytes_per_cycle: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            bytes_per_cycle: 1,
        }
    }
}

// Single-lane server that enforces the configured latency/bandwidth budget.
#[derive(Debug)]
pub struct BandwidthServer {
    config: ServerConfig,
    busy_until: Cycle,
    served: u64,
}

impl BandwidthServer {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "bytes_per_cycle must be > 0");
        Self {
            config,
            busy_until: 0,
            served: 0,
        }
    }

    // Serve a request of `size_bytes` arriving at `now`.
    pub fn serve(&mut self, now: Cycle, size_bytes: u32) -> Ticket {
        let start = self.busy_until.max(now);
        let transfer = ceil_div_u64(size_bytes as u64, self.config.bytes_per_cycle as u64);
        // the channel is occupied for the transfer only; latency overlaps with later requests
        self.busy_until = start.saturating_add(transfer);
        self.served = self.served.saturating_add(1);
        let ready_at = start
            .saturating_add(self.config.base_latency)
            .saturating_add(transfer);
        Ticket::new(now, ready_at, size_bytes)
    }

    // Returns the earliest cycle at which a new request could begin service.
    pub fn available_at(&self) -> Cycle {
        self.busy_until
    }

    pub fn served(&self) -> u64 {
        self.served
    }
}

fn ceil_div_u64(nom: u64, denom: u64) -> Cycle {
    debug_assert!(denom > 0);
    (nom + denom - 1) / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_server_charges_latency_plus_transfer() {
        let mut server = BandwidthServer::new(ServerConfig {
            base_latency: 10,
            bytes_per_cycle: 16,
        });
        let ticket = server.serve(100, 64);
        assert_eq!(ticket.issued_at(), 100);
        assert_eq!(ticket.ready_at(), 100 + 10 + 4);
        assert_eq!(ticket.latency(), 14);
    }

    #[test]
    fn back_to_back_requests_queue_behind_transfer() {
        let mut server = BandwidthServer::new(ServerConfig {
            base_latency: 10,
            bytes_per_cycle: 16,
        });
        let first = server.serve(0, 64);
        let second = server.serve(0, 64);
        assert_eq!(first.ready_at(), 14);
        assert_eq!(second.ready_at(), 18);
        assert_eq!(server.available_at(), 8);
        assert_eq!(server.served(), 2);
    }

    #[test]
    fn partial_transfer_rounds_up() {
        let mut server = BandwidthServer::new(ServerConfig {
            base_latency: 0,
            bytes_per_cycle: 16,
        });
        assert_eq!(server.serve(0, 1).ready_at(), 1);
    }

    #[test]
    fn late_arrival_does_not_inherit_old_backlog() {
        let mut server = BandwidthServer::new(ServerConfig::default());
        server.serve(0, 4);
        let ticket = server.serve(100, 4);
        assert_eq!(ticket.ready_at(), 104);
    }
}
