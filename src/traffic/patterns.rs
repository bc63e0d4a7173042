use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dcache::addr::LINE_BYTES;
use crate::dcache::request::RequestKind;
use crate::traffic::config::{TrafficConfig, TrafficPatternSpec};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatternOp {
    Read,
    Write,
    Mixed { write_fraction: f64 },
}

impl PatternOp {
    fn short(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
            Self::Mixed { .. } => "rw",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PatternKind {
    Stream { stride_lines: u64 },
    Random,
    Hotset { hot_lines: u64, hot_probability: f64 },
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub name: String,
    pub op: PatternOp,
    within_lines: u64,
    seed: u64,
    kind: PatternKind,
}

impl CompiledPattern {
    fn offset_lines(&self, req_idx: u64, rng: &mut StdRng) -> u64 {
        match self.kind {
            PatternKind::Stream { stride_lines } => {
                req_idx.wrapping_mul(stride_lines) % self.within_lines
            }
            PatternKind::Random => rng.gen_range(0..self.within_lines),
            PatternKind::Hotset {
                hot_lines,
                hot_probability,
            } => {
                if rng.gen::<f64>() < hot_probability {
                    rng.gen_range(0..hot_lines)
                } else {
                    rng.gen_range(0..self.within_lines)
                }
            }
        }
    }

    fn kind_of(&self, rng: &mut StdRng) -> RequestKind {
        match self.op {
            PatternOp::Read => RequestKind::Gets,
            PatternOp::Write => RequestKind::Putx,
            PatternOp::Mixed { write_fraction } => {
                if rng.gen::<f64>() < write_fraction {
                    RequestKind::Putx
                } else {
                    RequestKind::Gets
                }
            }
        }
    }
}

/// Outcome of one `PatternEngine::next_request` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficEvent {
    Request { line_addr: u64, kind: RequestKind },
    /// The pattern at this index issued its last request.
    PatternDone(usize),
    Exhausted,
}

/// Request stream of one issuer: each pattern in turn, `reqs_per_pattern` requests apiece.
#[derive(Debug, Clone)]
pub struct PatternEngine {
    patterns: Vec<CompiledPattern>,
    reqs_per_pattern: u64,
    base_line: u64,
    issuer: usize,
    current: usize,
    req_idx: u64,
    rng: StdRng,
}

impl PatternEngine {
    pub fn new(config: &TrafficConfig, issuer: usize) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .enumerate()
            .map(|(idx, spec)| compile_pattern(spec, idx, config))
            .collect::<Result<Vec<_>>>()?;
        let region_lines = (config.address.region_bytes / LINE_BYTES).max(1);
        let seed = patterns.first().map_or(0, |p| p.seed) ^ (issuer as u64).rotate_left(32);
        Ok(Self {
            patterns,
            reqs_per_pattern: config.reqs_per_pattern,
            base_line: config.address.base_line + issuer as u64 * region_lines,
            issuer,
            current: 0,
            req_idx: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn issuer(&self) -> usize {
        self.issuer
    }

    pub fn pattern_name(&self, idx: usize) -> Option<&str> {
        self.patterns.get(idx).map(|p| p.name.as_str())
    }

    pub fn next_request(&mut self) -> TrafficEvent {
        let Some(pattern) = self.patterns.get(self.current) else {
            return TrafficEvent::Exhausted;
        };
        if self.req_idx == self.reqs_per_pattern {
            let done = self.current;
            self.current += 1;
            self.req_idx = 0;
            if let Some(next) = self.patterns.get(self.current) {
                self.rng = StdRng::seed_from_u64(next.seed ^ (self.issuer as u64).rotate_left(32));
            }
            return TrafficEvent::PatternDone(done);
        }
        let offset = pattern.offset_lines(self.req_idx, &mut self.rng);
        let kind = pattern.kind_of(&mut self.rng);
        self.req_idx += 1;
        TrafficEvent::Request {
            line_addr: self.base_line + offset,
            kind,
        }
    }
}

fn compile_pattern(
    spec: &TrafficPatternSpec,
    index: usize,
    config: &TrafficConfig,
) -> Result<CompiledPattern> {
    let kind_key = spec.kind.trim().to_ascii_lowercase();
    let op = parse_op(spec)?;
    let within_bytes = spec
        .within_bytes
        .unwrap_or(config.address.region_bytes)
        .min(config.address.region_bytes);
    let within_lines = (within_bytes / LINE_BYTES).max(1);

    let kind = match kind_key.as_str() {
        "stream" | "sequential" => PatternKind::Stream {
            stride_lines: spec.stride_lines.max(1),
        },
        "random" => PatternKind::Random,
        "hotset" | "hot" => {
            if !(0.0..=1.0).contains(&spec.hot_probability) {
                bail!(
                    "pattern {}: hot_probability {} outside [0, 1]",
                    index,
                    spec.hot_probability
                );
            }
            let hot_lines = ((within_lines as f64 * spec.hot_fraction) as u64).clamp(1, within_lines);
            PatternKind::Hotset {
                hot_lines,
                hot_probability: spec.hot_probability,
            }
        }
        other => bail!(
            "unsupported traffic pattern kind '{}' at index {} (expected stream|random|hotset)",
            other,
            index
        ),
    };

    let name = if spec.name.is_empty() {
        default_pattern_name(&kind, within_lines, op)
    } else {
        spec.name.clone()
    };

    Ok(CompiledPattern {
        name,
        op,
        within_lines,
        seed: spec.seed,
        kind,
    })
}

fn parse_op(spec: &TrafficPatternSpec) -> Result<PatternOp> {
    Ok(match spec.op.trim().to_ascii_lowercase().as_str() {
        "read" | "r" | "get" => PatternOp::Read,
        "write" | "w" | "put" | "store" => PatternOp::Write,
        "mixed" | "rw" => {
            if !(0.0..=1.0).contains(&spec.write_fraction) {
                bail!("write_fraction {} outside [0, 1]", spec.write_fraction);
            }
            PatternOp::Mixed {
                write_fraction: spec.write_fraction,
            }
        }
        other => bail!("unsupported traffic op '{}'; expected read/write/mixed", other),
    })
}

fn default_pattern_name(kind: &PatternKind, within_lines: u64, op: PatternOp) -> String {
    let base = match kind {
        PatternKind::Stream { stride_lines } => format!("stream({})@{}", stride_lines, within_lines),
        PatternKind::Random => format!("random@{}", within_lines),
        PatternKind::Hotset {
            hot_lines,
            hot_probability,
        } => format!("hotset({}, {:.2})@{}", hot_lines, hot_probability, within_lines),
    };
    format!("{}_{}", base, op.short())
}
