use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::timeq::Cycle;

/// Request kinds arriving from the last-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
pub enum RequestKind {
    /// Clean eviction from the LLC.
    Puts = 0,
    /// Dirty eviction from the LLC.
    Putx = 1,
    /// Read for sharing.
    Gets = 2,
    /// Read for ownership.
    Getx = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoherenceState {
    #[default]
    I,
    S,
    E,
    M,
}

/// How the controller treats a request: a demand fetch or a writeback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load,
    Store,
}

impl RequestKind {
    pub fn access_kind(self) -> AccessKind {
        match self {
            RequestKind::Gets | RequestKind::Getx => AccessKind::Load,
            RequestKind::Puts | RequestKind::Putx => AccessKind::Store,
        }
    }

    /// Whether the touched block must be marked dirty in the cache.
    pub fn dirties(self) -> bool {
        matches!(self, RequestKind::Getx | RequestKind::Putx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRequest {
    /// Address in units of 64-byte lines.
    pub line_addr: u64,
    pub kind: RequestKind,
    /// Written by the controller.
    pub state: CoherenceState,
    pub cycle: Cycle,
    /// GETS must not be granted exclusivity.
    pub no_exclusive: bool,
    pub child_id: u32,
    pub src_id: u32,
    pub flags: u32,
}

impl MemRequest {
    pub fn new(line_addr: u64, kind: RequestKind, cycle: Cycle) -> Self {
        Self {
            line_addr,
            kind,
            state: CoherenceState::I,
            cycle,
            no_exclusive: false,
            child_id: 0,
            src_id: 0,
            flags: 0,
        }
    }

    /// Derived request for controller-generated traffic (probes, fills, writebacks).
    /// Routing fields are carried over unchanged.
    pub(crate) fn derive(&self, line_addr: u64, kind: RequestKind, cycle: Cycle) -> Self {
        Self {
            line_addr,
            kind,
            state: CoherenceState::I,
            cycle,
            ..*self
        }
    }

    /// Coherence state granted to the requester.
    pub fn resulting_state(&self) -> CoherenceState {
        match self.kind {
            RequestKind::Puts | RequestKind::Putx => CoherenceState::I,
            RequestKind::Gets if self.no_exclusive => CoherenceState::S,
            RequestKind::Gets => CoherenceState::E,
            RequestKind::Getx => CoherenceState::M,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn resulting_state_follows_kind() {
        let mut req = MemRequest::new(0, RequestKind::Gets, 0);
        assert_eq!(req.resulting_state(), CoherenceState::E);
        req.no_exclusive = true;
        assert_eq!(req.resulting_state(), CoherenceState::S);
        req.kind = RequestKind::Getx;
        assert_eq!(req.resulting_state(), CoherenceState::M);
        req.kind = RequestKind::Putx;
        assert_eq!(req.resulting_state(), CoherenceState::I);
    }

    #[test]
    fn getx_and_putx_dirty_the_block() {
        assert!(RequestKind::Getx.dirties());
        assert!(RequestKind::Putx.dirties());
        assert!(!RequestKind::Gets.dirties());
        assert_eq!(RequestKind::Getx.access_kind(), AccessKind::Load);
        assert_eq!(RequestKind::Putx.access_kind(), AccessKind::Store);
    }

    #[test]
    fn kind_decodes_from_integer() {
        assert_eq!(RequestKind::from_u32(1), Some(RequestKind::Putx));
        assert_eq!(RequestKind::from_u32(7), None);
    }
}
