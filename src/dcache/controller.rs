use anyhow::{bail, Result};
use log::{debug, info, trace};

use crate::dcache::addr::{FootprintGeometry, LineLocation};
use crate::dcache::config::DramCacheConfig;
use crate::dcache::locator::WayLocator;
use crate::dcache::placement::{PlacementDecision, PlacementPolicy, PolicyContext};
use crate::dcache::request::{AccessKind, MemRequest, RequestKind};
use crate::dcache::stats::{ControllerStats, RecentTraffic};
use crate::dcache::tag_buffer::TagBuffer;
use crate::dcache::way::{Set, TagMeta, TagRole};
use crate::mem::{AccessEvent, MemoryTier, TierConfig, TierStats, LINE_BURSTS, TAG_PROBE_BURSTS};
use crate::timeq::Cycle;

/// Footprint DRAM cache in front of a slow tier.
///
/// `access` runs the whole per-request pipeline: locate the page, reconcile with the tag buffer,
/// serve the line from whichever tier holds it, then let the placement policy reshape the set.
/// All timing-model calls are synchronous and happen inside `access`.
pub struct MemoryController {
    pub(crate) cfg: DramCacheConfig,
    pub(crate) geo: FootprintGeometry,
    pub(crate) sets: Vec<Set>,
    pub(crate) locator: WayLocator,
    pub(crate) tag_buffer: TagBuffer,
    pub(crate) policy: PlacementPolicy,
    fast: Vec<Box<dyn MemoryTier>>,
    slow: Box<dyn MemoryTier>,
    pub(crate) stats: ControllerStats,
    pub(crate) recent: RecentTraffic,
    pub(crate) ds_index: u64,
    pub(crate) balance_step: u64,
    balance_interval: u64,
    pub(crate) num_requests: u64,
}

impl MemoryController {
    /// `fast` holds one timing model per channel.
    pub fn new(
        cfg: DramCacheConfig,
        fast: Vec<Box<dyn MemoryTier>>,
        slow: Box<dyn MemoryTier>,
    ) -> Result<Self> {
        cfg.ensure_valid()?;
        let geo = FootprintGeometry::new(
            cfg.granularity,
            cfg.footprint_size,
            cfg.num_sets(),
            cfg.channels,
        )?;
        if fast.len() as u64 != cfg.channels {
            bail!(
                "{} fast-tier models supplied for {} channels",
                fast.len(),
                cfg.channels
            );
        }
        let num_sets = cfg.num_sets() as usize;
        let tag_buffer = TagBuffer::with_capacity(cfg.tag_buffer_size, cfg.tag_buffer_ways)?;
        let policy = PlacementPolicy::new(&cfg, num_sets)?;
        info!(
            "dram cache: {} sets x {} ways, {}-byte pages, {} sub-blocks/page, {:?} placement",
            num_sets,
            cfg.ways,
            cfg.granularity,
            geo.blocks_per_page(),
            cfg.placement_policy
        );
        Ok(Self {
            sets: (0..num_sets).map(|_| Set::new(cfg.ways)).collect(),
            locator: WayLocator::new(),
            tag_buffer,
            policy,
            fast,
            slow,
            stats: ControllerStats::default(),
            recent: RecentTraffic::default(),
            ds_index: 0,
            balance_step: cfg.balance_step(),
            balance_interval: (cfg.capacity_lines() / 10).max(1),
            num_requests: 0,
            geo,
            cfg,
        })
    }

    /// Build the tiers from their configs, replicating the fast tier per channel.
    pub fn from_config(cfg: DramCacheConfig, fast: &TierConfig, slow: &TierConfig) -> Result<Self> {
        let fast_tiers = (0..cfg.channels)
            .map(|ch| fast.build(&format!("fast{}", ch)))
            .collect::<Result<Vec<_>>>()?;
        let slow_tier = slow.build("slow")?;
        Self::new(cfg, fast_tiers, slow_tier)
    }

    /// Serve one request, returning the cycle at which its data is ready.
    pub fn access(&mut self, req: &mut MemRequest) -> Cycle {
        req.state = req.resulting_state();
        if req.kind == RequestKind::Puts {
            self.stats.clean_writebacks += 1;
            return req.cycle;
        }
        self.num_requests += 1;
        self.stats.requests += 1;

        let access = req.kind.access_kind();
        let loc = self.geo.locate(req.line_addr);
        if self.locator.touch(loc.tag) {
            self.stats.touched_pages += 1;
        }
        let mut now = req.cycle;
        if self.cfg.sram_tag {
            now += self.cfg.sram_tag_latency;
        }

        let passthrough = (loc.set as u64) < self.ds_index;
        let tb_hit = passthrough || self.tag_buffer.probe(loc.tag);
        let needs_probe = !tb_hit && access == AccessKind::Store && !self.cfg.sram_tag;
        match (tb_hit, access) {
            (true, AccessKind::Load) => self.stats.tag_buffer_hits += 1,
            (true, AccessKind::Store) => {
                self.stats.tag_buffer_hits += 1;
                self.stats.tag_buffer_dirty_hits += 1;
            }
            (false, AccessKind::Load) => self.stats.tag_buffer_misses += 1,
            (false, AccessKind::Store) => {
                self.stats.tag_buffer_misses += 1;
                self.stats.tag_buffer_dirty_misses += 1;
            }
        }
        trace!(
            "access {:#x} {:?} tag {:#x} set {} block {} tb_hit {}",
            req.line_addr,
            req.kind,
            loc.tag,
            loc.set,
            loc.block,
            tb_hit
        );

        let ready = match self.locator.lookup(loc.tag) {
            Some(way) => self.handle_hit(req, &loc, way, now, needs_probe),
            None => self.handle_miss(req, &loc, now, needs_probe, passthrough),
        };
        self.finish_access(req, loc.set, ready);
        ready
    }

    fn handle_hit(
        &mut self,
        req: &MemRequest,
        loc: &LineLocation,
        way: usize,
        now: Cycle,
        needs_probe: bool,
    ) -> Cycle {
        let (tag, bit, set_idx) = (loc.tag, loc.access_bit, loc.set);
        let access = req.kind.access_kind();
        let dirties = req.kind.dirties();
        let now = if needs_probe {
            self.probe_tags(req, loc, now)
        } else {
            self.fast_access(req, req.line_addr, now, AccessEvent::Load, LINE_BURSTS)
        };

        let decision = self.policy.handle_cache_hit(
            &PolicyContext {
                tag_buffer: &self.tag_buffer,
                recent_miss_rate: self.recent.miss_rate(),
                num_requests: self.num_requests,
            },
            tag,
            set_idx,
            &self.sets[set_idx],
            way,
        );
        self.model_counter_access(req, &decision, now);

        let w = self.sets[set_idx].way_mut(way);
        let Some(role) = w.role_of(tag) else {
            panic!("locator binds tag {:#x} to way {} of set {} which does not hold it", tag, way, set_idx);
        };
        let ready = if !w.is_tag_only_hit(tag, bit) {
            if let Some(meta) = w.slot_mut(role).as_mut() {
                meta.record_real_hit(bit, dirties);
            }
            w.check_invariants();
            self.stats.real_hits += 1;
            self.recent.hits += 1;
            match access {
                AccessKind::Load => self.stats.load_hits += 1,
                AccessKind::Store => self.stats.store_hits += 1,
            }
            if role == TagRole::Sub {
                self.stats.sub_tag_hits += 1;
            }
            match access {
                AccessKind::Load => now,
                AccessKind::Store => {
                    self.fast_access(req, req.line_addr, now, AccessEvent::Store, LINE_BURSTS)
                }
            }
        } else {
            let conflict = self.fill_tag_only(tag, bit, dirties, set_idx, way, role);
            self.stats.false_hits += 1;
            self.recent.misses += 1;
            let event = match access {
                AccessKind::Load => AccessEvent::Load,
                AccessKind::Store => AccessEvent::Store,
            };
            let ready = self.slow_access(req, req.line_addr, now, event, LINE_BURSTS);
            if let Some((sub_tag, dirty)) = conflict {
                self.write_back(req, sub_tag, dirty, ready);
                self.stats.conflict_writebacks += 1;
            }
            ready
        };

        if role == TagRole::Sub {
            if let Some(victim) = decision.way {
                self.promote_sub(req, loc, way, victim, ready);
            }
        }
        ready
    }

    /// Mark the missing block of a resident page valid. Returns a dirty block dropped from the
    /// sub tag to keep the footprints disjoint.
    fn fill_tag_only(
        &mut self,
        tag: u64,
        bit: u64,
        dirties: bool,
        set_idx: usize,
        way: usize,
        role: TagRole,
    ) -> Option<(u64, u64)> {
        let w = self.sets[set_idx].way_mut(way);
        let mut conflict = None;
        match role {
            TagRole::Prime => {
                if let Some(prime) = w.prime.as_mut() {
                    prime.record_fill(bit, dirties);
                }
                if let Some(sub) = w.sub.as_mut() {
                    let dirty = sub.drop_blocks(bit);
                    if dirty != 0 {
                        conflict = Some((sub.tag, dirty));
                    }
                }
            }
            TagRole::Sub => {
                let prime_holds = w.prime.is_some_and(|p| p.holds(bit));
                if let Some(sub) = w.sub.as_mut() {
                    if prime_holds {
                        sub.reference |= bit;
                    } else {
                        sub.record_fill(bit, dirties);
                    }
                }
            }
        }
        w.check_invariants();
        conflict
    }

    /// Metadata-only read of the fast tier after a tag-buffer miss.
    pub(crate) fn probe_tags(&mut self, req: &MemRequest, loc: &LineLocation, now: Cycle) -> Cycle {
        let done = self.fast_access(req, req.line_addr, now, AccessEvent::Load, TAG_PROBE_BURSTS);
        self.stats.tag_loads += 1;
        if self.tag_buffer.can_insert(loc.tag) {
            self.tag_buffer.insert(loc.tag, false);
        }
        done
    }

    pub(crate) fn model_counter_access(
        &mut self,
        req: &MemRequest,
        decision: &PlacementDecision,
        now: Cycle,
    ) {
        if !decision.counter_access {
            return;
        }
        self.stats.counter_accesses += 1;
        if self.cfg.sram_tag {
            return;
        }
        self.fast_access(req, req.line_addr, now, AccessEvent::Load, TAG_PROBE_BURSTS);
        self.fast_access(req, req.line_addr, now, AccessEvent::Store, TAG_PROBE_BURSTS);
    }

    fn finish_access(&mut self, req: &MemRequest, set_idx: usize, now: Cycle) {
        if self.tag_buffer.needs_flush() {
            info!(
                "tag buffer flush at cycle {}: occupancy {:.3}",
                now,
                self.tag_buffer.occupancy()
            );
            self.flush_tag_buffer(now);
        }
        if self.num_requests % self.balance_interval == 0 {
            self.balance(req, now);
        }
        if cfg!(debug_assertions) {
            self.sets[set_idx].check_invariants();
        }
    }

    pub(crate) fn flush_tag_buffer(&mut self, now: Cycle) {
        self.tag_buffer.clear(now);
        self.stats.tag_buffer_flushes += 1;
    }

    /// Pin `a` (and `b`) in the tag buffer, flushing it first when they do not fit.
    pub(crate) fn pin(&mut self, a: u64, b: Option<u64>, now: Cycle) {
        let fits = match b {
            Some(b) => self.tag_buffer.can_insert_pair(a, b),
            None => self.tag_buffer.can_insert(a),
        };
        if !fits {
            debug!("tag buffer cannot pin {:#x}/{:?}, flushing", a, b);
            self.flush_tag_buffer(now);
        }
        self.tag_buffer.insert(a, true);
        if let Some(b) = b {
            self.tag_buffer.insert(b, true);
        }
    }

    pub(crate) fn fast_access(
        &mut self,
        req: &MemRequest,
        line_addr: u64,
        cycle: Cycle,
        event: AccessEvent,
        bursts: u32,
    ) -> Cycle {
        if bursts == 0 {
            return cycle;
        }
        let channel = self.geo.channel(line_addr);
        let local = req.derive(self.geo.channel_addr(line_addr), kind_for(event), cycle);
        self.recent.fast_bursts += bursts as u64;
        self.fast[channel].access(&local, event, bursts)
    }

    pub(crate) fn slow_access(
        &mut self,
        req: &MemRequest,
        line_addr: u64,
        cycle: Cycle,
        event: AccessEvent,
        bursts: u32,
    ) -> Cycle {
        if bursts == 0 {
            return cycle;
        }
        let derived = req.derive(line_addr, kind_for(event), cycle);
        self.recent.slow_bursts += bursts as u64;
        self.slow.access(&derived, event, bursts)
    }

    pub(crate) fn bursts_for(&self, blocks: u64) -> u32 {
        (self.geo.lines_in(blocks) as u32).saturating_mul(LINE_BURSTS)
    }

    /// Write the dirty blocks `bits` of page `tag` back to the slow tier.
    pub(crate) fn write_back(&mut self, req: &MemRequest, tag: u64, bits: u64, now: Cycle) {
        if bits == 0 {
            return;
        }
        let bursts = self.bursts_for(bits);
        self.stats.evicted_dirty_lines += self.geo.lines_in(bits);
        self.slow_access(req, self.geo.page_base(tag), now, AccessEvent::Store, bursts);
    }

    /// A page leaves the cache: flush its dirty blocks and remember what it referenced.
    pub(crate) fn evict_page(&mut self, req: &MemRequest, meta: &TagMeta, now: Cycle) {
        let dirty = meta.dirty_valid();
        if dirty != 0 {
            self.stats.dirty_evictions += 1;
            self.write_back(req, meta.tag, dirty, now);
        } else {
            self.stats.clean_evictions += 1;
        }
        self.locator.unbind(meta.tag, meta.reference);
        self.stats
            .touched_lines
            .record(self.geo.lines_in(meta.reference), self.geo.lines_per_page());
        debug!("evicted page {:#x} dirty {:#x}", meta.tag, dirty);
    }

    pub fn num_requests(&self) -> u64 {
        self.num_requests
    }

    pub fn ds_index(&self) -> u64 {
        self.ds_index
    }

    pub fn geometry(&self) -> &FootprintGeometry {
        &self.geo
    }

    pub fn config(&self) -> &DramCacheConfig {
        &self.cfg
    }

    pub fn set(&self, idx: usize) -> &Set {
        &self.sets[idx]
    }

    pub fn locator(&self) -> &WayLocator {
        &self.locator
    }

    pub fn tag_buffer(&self) -> &TagBuffer {
        &self.tag_buffer
    }

    pub fn recent_miss_rate(&self) -> f64 {
        self.recent.miss_rate()
    }

    pub fn stats(&self) -> ControllerStats {
        let mut stats = self.stats;
        stats.ds_index = self.ds_index;
        stats.placement = self.policy.stats();
        stats.fast_tier = TierStats::default();
        for tier in &self.fast {
            stats.fast_tier += &tier.stats();
        }
        stats.slow_tier = self.slow.stats();
        stats
    }

    /// Panics unless every set is well formed and the locator agrees with the sets.
    pub fn check_invariants(&self) {
        for (set_idx, set) in self.sets.iter().enumerate() {
            set.check_invariants();
            for (way_idx, way) in set.ways().iter().enumerate() {
                for tag in way.prime_tag().into_iter().chain(way.sub_tag()) {
                    assert_eq!(
                        self.geo.set_index(tag),
                        set_idx,
                        "tag {:#x} resident in the wrong set",
                        tag
                    );
                    assert_eq!(
                        self.locator.lookup(tag),
                        Some(way_idx),
                        "locator out of sync for tag {:#x}",
                        tag
                    );
                }
            }
        }
        for (tag, way) in self.locator.resident() {
            let set = &self.sets[self.geo.set_index(tag)];
            assert!(
                set.way(way).role_of(tag).is_some(),
                "locator binds {:#x} to way {} which does not hold it",
                tag,
                way
            );
        }
    }
}

fn kind_for(event: AccessEvent) -> RequestKind {
    match event {
        AccessEvent::Store => RequestKind::Putx,
        AccessEvent::Load | AccessEvent::Prefetch => RequestKind::Gets,
    }
}
