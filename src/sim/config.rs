use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

/// Where the runner takes its requests from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrontendMode {
    #[default]
    Traffic,
    Trace,
}

impl FromStr for FrontendMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "traffic" => Ok(Self::Traffic),
            "trace" => Ok(Self::Trace),
            _ => Err(format!(
                "unsupported frontend mode '{}', expected one of: traffic, trace",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub frontend_mode: FrontendMode,
    /// Recorded trace replayed in `trace` mode.
    pub trace_in: Option<PathBuf>,
    /// Every request seen by the controller is appended here.
    pub trace_out: Option<PathBuf>,
    pub max_requests: Option<u64>,
    /// Cycles between consecutive requests of one issuer.
    pub issue_interval: u64,
    /// Final statistics as pretty JSON.
    pub stats_out: Option<PathBuf>,
    /// Statistics snapshot every this many requests, one JSON object per line.
    pub stats_interval: Option<u64>,
    pub stats_log: Option<PathBuf>,
    pub log_level: u64,
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Result<Self> {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .context("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Ok(Self::default())
            }
        }
    }
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            frontend_mode: FrontendMode::Traffic,
            trace_in: None,
            trace_out: None,
            max_requests: None,
            issue_interval: 4,
            stats_out: None,
            stats_interval: None,
            stats_log: None,
            log_level: 0,
        }
    }
}
