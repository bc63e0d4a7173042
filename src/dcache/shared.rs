use std::sync::{Arc, Mutex, MutexGuard};

use crate::dcache::controller::MemoryController;
use crate::dcache::request::MemRequest;
use crate::dcache::stats::ControllerStats;
use crate::timeq::Cycle;

/// Cloneable handle serializing requests from several issuers into one controller.
#[derive(Clone)]
pub struct SharedController(Arc<Mutex<MemoryController>>);

impl SharedController {
    pub fn new(controller: MemoryController) -> Self {
        Self(Arc::new(Mutex::new(controller)))
    }

    fn lock(&self) -> MutexGuard<'_, MemoryController> {
        self.0.lock().expect("controller lock poisoned")
    }

    pub fn access(&self, req: &mut MemRequest) -> Cycle {
        self.lock().access(req)
    }

    pub fn stats(&self) -> ControllerStats {
        self.lock().stats()
    }

    /// Run `f` with exclusive access to the controller.
    pub fn with<R>(&self, f: impl FnOnce(&mut MemoryController) -> R) -> R {
        f(&mut self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcache::config::DramCacheConfig;
    use crate::dcache::request::RequestKind;
    use crate::mem::TierConfig;
    use std::thread;

    #[test]
    fn concurrent_issuers_are_all_counted() {
        let cfg = DramCacheConfig {
            capacity_bytes: 1 << 20,
            ..DramCacheConfig::default()
        };
        let mc = MemoryController::from_config(cfg, &TierConfig::default(), &TierConfig::default())
            .expect("controller");
        let shared = SharedController::new(mc);
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let mut req = MemRequest::new(t * 1_000_000 + i, RequestKind::Gets, i);
                        shared.access(&mut req);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("issuer thread");
        }
        assert_eq!(shared.stats().requests, 400);
        shared.with(|mc| mc.check_invariants());
    }
}
