use std::ops::AddAssign;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use log::info;

use crate::dcache::config::DramCacheConfig;
use crate::dcache::controller::MemoryController;
use crate::dcache::request::{MemRequest, RequestKind};
use crate::dcache::shared::SharedController;
use crate::mem::TierConfig;
use crate::sim::config::{FrontendMode, SimConfig};
use crate::sim::perf_log::{write_summary, RunSummary, StatsLog, StatsRecord};
use crate::sim::trace::{TraceReader, TraceRecorder};
use crate::timeq::Cycle;
use crate::traffic::config::TrafficConfig;
use crate::traffic::logging::TrafficLogger;
use crate::traffic::patterns::{PatternEngine, TrafficEvent};

#[derive(Debug, Default, Clone, Copy)]
struct IssueTotals {
    requests: u64,
    latency_sum: u64,
    final_cycle: Cycle,
}

impl AddAssign<&IssueTotals> for IssueTotals {
    fn add_assign(&mut self, other: &IssueTotals) {
        self.requests = self.requests.saturating_add(other.requests);
        self.latency_sum = self.latency_sum.saturating_add(other.latency_sum);
        self.final_cycle = self.final_cycle.max(other.final_cycle);
    }
}

/// Drives a controller from a trace or synthetic traffic and reports its statistics.
pub struct Sim {
    config: SimConfig,
    traffic: TrafficConfig,
    controller: SharedController,
    recorder: Option<Mutex<TraceRecorder>>,
    stats_log: Option<StatsLog>,
    issued: AtomicU64,
}

impl Sim {
    pub fn new(
        config: SimConfig,
        dcache: DramCacheConfig,
        fast: &TierConfig,
        slow: &TierConfig,
        traffic: TrafficConfig,
    ) -> Result<Self> {
        let controller = MemoryController::from_config(dcache, fast, slow)?;
        let recorder = match &config.trace_out {
            Some(path) => Some(Mutex::new(TraceRecorder::create(path)?)),
            None => None,
        };
        let stats_log = match (&config.stats_log, config.stats_interval) {
            (Some(path), Some(_)) => Some(StatsLog::create(path)?),
            (Some(_), None) => bail!("stats_log requires stats_interval"),
            _ => None,
        };
        Ok(Self {
            config,
            traffic,
            controller: SharedController::new(controller),
            recorder,
            stats_log,
            issued: AtomicU64::new(0),
        })
    }

    pub fn controller(&self) -> &SharedController {
        &self.controller
    }

    pub fn simulate(&mut self) -> Result<RunSummary> {
        let totals = match self.config.frontend_mode {
            FrontendMode::Trace => {
                let path = self
                    .config
                    .trace_in
                    .clone()
                    .context("trace frontend needs sim.trace_in")?;
                self.run_trace(&path)?
            }
            FrontendMode::Traffic => self.run_traffic()?,
        };

        if let Some(recorder) = self.recorder.take() {
            let recorder = recorder
                .into_inner()
                .map_err(|_| anyhow!("trace recorder lock poisoned"))?;
            let records = recorder.finish()?;
            info!("recorded {} requests", records);
        }
        if let Some(log) = &self.stats_log {
            log.flush()?;
        }

        let stats = self.controller.stats();
        let summary = RunSummary {
            requests_issued: totals.requests,
            final_cycle: totals.final_cycle,
            mean_latency: if totals.requests == 0 {
                0.0
            } else {
                totals.latency_sum as f64 / totals.requests as f64
            },
            miss_rate: stats.miss_rate(),
            stats,
        };
        if let Some(path) = &self.config.stats_out {
            write_summary(path, &summary)?;
        }
        info!(
            "{} requests, miss rate {:.4}, mean latency {:.1} cycles",
            summary.requests_issued, summary.miss_rate, summary.mean_latency
        );
        Ok(summary)
    }

    /// Claim a slot under `max_requests`; false once the budget is spent.
    fn claim(&self) -> bool {
        let n = self.issued.fetch_add(1, Ordering::Relaxed);
        self.config.max_requests.map_or(true, |max| n < max)
    }

    fn issue(&self, req: &mut MemRequest, totals: &mut IssueTotals) -> Result<()> {
        let issued_at = req.cycle;
        let ready = self.controller.with(|mc| -> Result<Cycle> {
            if let Some(recorder) = &self.recorder {
                recorder
                    .lock()
                    .map_err(|_| anyhow!("trace recorder lock poisoned"))?
                    .record(req)?;
            }
            let ready = mc.access(req);
            if let (Some(log), Some(every)) = (&self.stats_log, self.config.stats_interval) {
                let n = mc.num_requests();
                if every > 0 && n > 0 && n % every == 0 && req.kind != RequestKind::Puts {
                    let stats = mc.stats();
                    log.write_json(&StatsRecord {
                        request: n,
                        cycle: ready,
                        miss_rate: stats.miss_rate(),
                        stats,
                    });
                }
            }
            Ok(ready)
        })?;
        totals.requests += 1;
        totals.latency_sum += ready - issued_at;
        totals.final_cycle = totals.final_cycle.max(ready);
        Ok(())
    }

    fn run_trace(&self, path: &Path) -> Result<IssueTotals> {
        let reader = TraceReader::open(path)?;
        info!("replaying {} requests from {}", reader.remaining(), path.display());
        let mut totals = IssueTotals::default();
        let mut cycle = 0;
        for record in reader {
            let (line_addr, kind) = record?;
            if !self.claim() {
                break;
            }
            let mut req = MemRequest::new(line_addr, kind, cycle);
            self.issue(&mut req, &mut totals)?;
            cycle += self.config.issue_interval;
        }
        Ok(totals)
    }

    fn run_traffic(&self) -> Result<IssueTotals> {
        let issuers = self.traffic.num_issuers.max(1);
        let engines = (0..issuers)
            .map(|i| PatternEngine::new(&self.traffic, i))
            .collect::<Result<Vec<_>>>()?;
        info!("driving {} issuers of {} patterns", issuers, engines[0].len());

        let results: Vec<Result<IssueTotals>> = thread::scope(|s| {
            let handles: Vec<_> = engines
                .into_iter()
                .map(|engine| s.spawn(move || self.drive(engine)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(anyhow!("traffic issuer panicked")))
                })
                .collect()
        });
        let mut totals = IssueTotals::default();
        for result in results {
            totals += &result?;
        }
        Ok(totals)
    }

    fn drive(&self, mut engine: PatternEngine) -> Result<IssueTotals> {
        let mut totals = IssueTotals::default();
        let mut cycle = 0;
        let print = self.traffic.logging.print_traffic_lines;
        loop {
            match engine.next_request() {
                TrafficEvent::Request { line_addr, kind } => {
                    if !self.claim() {
                        break;
                    }
                    let mut req = MemRequest::new(line_addr, kind, cycle);
                    req.src_id = engine.issuer() as u32;
                    self.issue(&mut req, &mut totals)?;
                    cycle += self.config.issue_interval;
                }
                TrafficEvent::PatternDone(idx) => {
                    if print {
                        let name = engine.pattern_name(idx).unwrap_or("?");
                        TrafficLogger::log_pattern_checkpoint(engine.issuer(), name, cycle);
                    }
                }
                TrafficEvent::Exhausted => break,
            }
        }
        if print {
            TrafficLogger::log_issuer_done(engine.issuer(), totals.requests);
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::config::TrafficPatternSpec;

    fn small_cache() -> DramCacheConfig {
        DramCacheConfig {
            capacity_bytes: 1 << 20,
            channels: 2,
            ..DramCacheConfig::default()
        }
    }

    fn quiet_traffic(issuers: usize, reqs: u64) -> TrafficConfig {
        let mut traffic = TrafficConfig {
            num_issuers: issuers,
            reqs_per_pattern: reqs,
            patterns: vec![TrafficPatternSpec {
                kind: "hotset".to_string(),
                op: "mixed".to_string(),
                ..TrafficPatternSpec::default()
            }],
            ..TrafficConfig::default()
        };
        traffic.address.region_bytes = 4 << 20;
        traffic.logging.print_traffic_lines = false;
        traffic
    }

    fn scratch(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dramcache_sim_{}_{}", name, std::process::id()))
    }

    #[test]
    fn traffic_run_counts_every_issued_request() {
        let mut sim = Sim::new(
            SimConfig::default(),
            small_cache(),
            &TierConfig::fast_default(),
            &TierConfig::slow_default(),
            quiet_traffic(3, 500),
        )
        .expect("sim");
        let summary = sim.simulate().expect("run");
        assert_eq!(summary.requests_issued, 1500);
        assert_eq!(
            summary.stats.requests + summary.stats.clean_writebacks,
            1500
        );
        assert!(summary.mean_latency > 0.0);
        sim.controller().with(|mc| mc.check_invariants());
    }

    #[test]
    fn request_budget_caps_the_run() {
        let config = SimConfig {
            max_requests: Some(100),
            ..SimConfig::default()
        };
        let mut sim = Sim::new(
            config,
            small_cache(),
            &TierConfig::default(),
            &TierConfig::default(),
            quiet_traffic(2, 1000),
        )
        .expect("sim");
        assert_eq!(sim.simulate().expect("run").requests_issued, 100);
    }

    #[test]
    fn recorded_trace_replays_to_identical_stats() {
        let trace = scratch("replay.trace");
        let stats_out = scratch("replay.json");
        let record = SimConfig {
            trace_out: Some(trace.clone()),
            ..SimConfig::default()
        };
        let mut first = Sim::new(
            record,
            small_cache(),
            &TierConfig::default(),
            &TierConfig::default(),
            quiet_traffic(1, 800),
        )
        .expect("sim");
        let recorded = first.simulate().expect("record run");

        let replay = SimConfig {
            frontend_mode: FrontendMode::Trace,
            trace_in: Some(trace.clone()),
            stats_out: Some(stats_out.clone()),
            ..SimConfig::default()
        };
        let mut second = Sim::new(
            replay,
            small_cache(),
            &TierConfig::default(),
            &TierConfig::default(),
            TrafficConfig::default(),
        )
        .expect("sim");
        let replayed = second.simulate().expect("replay run");
        assert_eq!(replayed.requests_issued, recorded.requests_issued);
        assert_eq!(replayed.stats.load_hits, recorded.stats.load_hits);
        assert_eq!(replayed.stats.placements, recorded.stats.placements);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&stats_out).expect("summary"))
                .expect("json");
        assert_eq!(json["requests_issued"], 800);
        let _ = std::fs::remove_file(&trace);
        let _ = std::fs::remove_file(&stats_out);
    }

    #[test]
    fn trace_mode_without_input_is_an_error() {
        let config = SimConfig {
            frontend_mode: FrontendMode::Trace,
            ..SimConfig::default()
        };
        let mut sim = Sim::new(
            config,
            small_cache(),
            &TierConfig::default(),
            &TierConfig::default(),
            TrafficConfig::default(),
        )
        .expect("sim");
        assert!(sim.simulate().is_err());
    }
}
