use serde::Deserialize;

use crate::sim::config::Config;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    /// Independent request streams, each driven from its own thread.
    pub num_issuers: usize,
    pub reqs_per_pattern: u64,
    pub address: TrafficAddressConfig,
    pub logging: TrafficLoggingConfig,
    pub patterns: Vec<TrafficPatternSpec>,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            num_issuers: 1,
            reqs_per_pattern: 100_000,
            address: TrafficAddressConfig::default(),
            logging: TrafficLoggingConfig::default(),
            patterns: vec![TrafficPatternSpec {
                kind: "hotset".to_string(),
                op: "mixed".to_string(),
                ..TrafficPatternSpec::default()
            }],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficAddressConfig {
    /// First line address touched by issuer 0.
    pub base_line: u64,
    /// Bytes each issuer's patterns range over; issuers use disjoint regions.
    pub region_bytes: u64,
}

impl Default for TrafficAddressConfig {
    fn default() -> Self {
        Self {
            base_line: 0,
            region_bytes: 256 << 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficLoggingConfig {
    pub print_traffic_lines: bool,
}

impl Default for TrafficLoggingConfig {
    fn default() -> Self {
        Self {
            print_traffic_lines: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficPatternSpec {
    pub name: String,
    /// `stream`, `random` or `hotset`.
    pub kind: String,
    /// `read`, `write` or `mixed`.
    pub op: String,
    pub write_fraction: f64,
    pub stride_lines: u64,
    /// Narrows the pattern to the first bytes of the issuer's region.
    pub within_bytes: Option<u64>,
    /// Share of the range that is hot, for `hotset`.
    pub hot_fraction: f64,
    /// Probability a `hotset` request lands in the hot share.
    pub hot_probability: f64,
    pub seed: u64,
}

impl Default for TrafficPatternSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            op: "read".to_string(),
            write_fraction: 0.3,
            stride_lines: 1,
            within_bytes: None,
            hot_fraction: 0.1,
            hot_probability: 0.9,
            seed: 0,
        }
    }
}
