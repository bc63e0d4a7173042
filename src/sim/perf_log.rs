use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::dcache::stats::ControllerStats;
use crate::timeq::Cycle;

/// Periodic controller snapshot.
#[derive(Debug, Serialize)]
pub struct StatsRecord {
    pub request: u64,
    pub cycle: Cycle,
    pub miss_rate: f64,
    pub stats: ControllerStats,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub requests_issued: u64,
    pub final_cycle: Cycle,
    /// Mean cycles from issue to data-ready.
    pub mean_latency: f64,
    pub miss_rate: f64,
    pub stats: ControllerStats,
}

/// Line-delimited JSON sink shared by issuer threads.
pub struct StatsLog {
    writer: Mutex<BufWriter<File>>,
}

impl StatsLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("cannot create stats log {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn write_json<T: Serialize>(&self, record: &T) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Ok(payload) = serde_json::to_string(record) {
                let _ = writeln!(guard, "{payload}");
            }
        }
    }

    pub fn flush(&self) -> Result<()> {
        if let Ok(mut guard) = self.writer.lock() {
            guard.flush()?;
        }
        Ok(())
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let payload = serde_json::to_string_pretty(summary)?;
    fs::write(path, payload).with_context(|| format!("cannot write {}", path.display()))
}
