//! Footprint DRAM cache controller.
//!
//! Pages of `granularity` bytes are cached in a set-associative fast tier. Each way holds a
//! prime and a sub page whose footprints (valid sub-blocks) never overlap. A tag buffer caches
//! recently seen tags so most accesses avoid a metadata probe of the fast tier, and a
//! placement policy (LRU or frequency-based) decides installs, demotions and promotions.

pub mod addr;
pub mod balance;
pub mod config;
pub mod controller;
pub mod locator;
pub mod placement;
mod replace;
pub mod request;
pub mod shared;
pub mod stats;
mod swap;
pub mod tag_buffer;
pub mod way;


pub use config::{DramCacheConfig, PlacementScheme};
pub use controller::MemoryController;
pub use request::{AccessKind, CoherenceState, MemRequest, RequestKind};
pub use shared::SharedController;
pub use stats::ControllerStats;
