//! Synthetic request streams for running the controller without a recorded trace.

pub mod config;
pub mod logging;
pub mod patterns;

pub use config::TrafficConfig;
pub use patterns::{PatternEngine, TrafficEvent};
