use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use toml::Table;

use dramcache::dcache::config::{DramCacheConfig, PlacementScheme};
use dramcache::mem::TierConfig;
use dramcache::sim::config::{Config, FrontendMode, SimConfig};
use dramcache::sim::top::Sim;
use dramcache::traffic::config::TrafficConfig;

#[derive(Parser)]
#[command(version, about)]
struct DramCacheArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override request source (traffic, trace)")]
    frontend: Option<FrontendMode>,
    #[arg(long, help = "Replay this trace instead of synthetic traffic")]
    trace_in: Option<PathBuf>,
    #[arg(long, help = "Record every request into this trace")]
    trace_out: Option<PathBuf>,
    #[arg(long, help = "Stop after this many requests")]
    max_requests: Option<u64>,
    #[arg(long, help = "Write final statistics as JSON")]
    stats_out: Option<PathBuf>,
    #[arg(long, help = "Override placement policy (lru, fbr)")]
    policy: Option<String>,
    #[arg(long, help = "Enable bandwidth balancing")]
    bw_balance: Option<bool>,
    #[arg(long, help = "Enable log at level (0:warn, 1:info, 2:debug)")]
    log: Option<u64>,
}

fn parse_policy(name: &str) -> Result<PlacementScheme> {
    match name.to_ascii_lowercase().as_str() {
        "lru" => Ok(PlacementScheme::Lru),
        "fbr" => Ok(PlacementScheme::Fbr),
        other => anyhow::bail!("unsupported placement policy '{}', expected lru or fbr", other),
    }
}

pub fn main() -> Result<()> {
    let argv = DramCacheArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;

    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut sim_config = SimConfig::from_section(config_table.get("sim"))?;
    let mut dcache_config = DramCacheConfig::from_section(config_table.get("dcache"))?;
    let fast_config = match config_table.get("fast_tier") {
        Some(section) => TierConfig::from_section(Some(section))?,
        None => TierConfig::fast_default(),
    };
    let slow_config = match config_table.get("slow_tier") {
        Some(section) => TierConfig::from_section(Some(section))?,
        None => TierConfig::slow_default(),
    };
    let traffic_config = TrafficConfig::from_section(config_table.get("traffic"))?;

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    sim_config.frontend_mode = argv.frontend.unwrap_or(sim_config.frontend_mode);
    if argv.trace_in.is_some() {
        sim_config.trace_in = argv.trace_in;
        if argv.frontend.is_none() {
            sim_config.frontend_mode = FrontendMode::Trace;
        }
    }
    sim_config.trace_out = argv.trace_out.or(sim_config.trace_out);
    sim_config.max_requests = argv.max_requests.or(sim_config.max_requests);
    sim_config.stats_out = argv.stats_out.or(sim_config.stats_out);
    if let Some(policy) = &argv.policy {
        dcache_config.placement_policy = parse_policy(policy)?;
    }
    dcache_config.bw_balance = argv.bw_balance.unwrap_or(dcache_config.bw_balance);

    let default_level = match sim_config.log_level {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut sim = Sim::new(
        sim_config,
        dcache_config,
        &fast_config,
        &slow_config,
        traffic_config,
    )?;
    let summary = sim.simulate()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
