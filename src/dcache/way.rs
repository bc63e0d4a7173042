/// Bookkeeping for one page held in a way slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagMeta {
    pub tag: u64,
    /// Sub-blocks present in the fast tier.
    pub valid: u64,
    /// Sub-blocks actually referenced since the page was installed.
    pub reference: u64,
    /// Sub-blocks modified relative to the slow tier.
    pub dirty: u64,
    pub accesses: u32,
    pub real_hits: u32,
    pub false_hits: u32,
    pub misses: u32,
}

impl TagMeta {
    /// Fresh page installed by a miss.
    pub fn installed(tag: u64, valid: u64, access_bit: u64, dirty: bool) -> Self {
        Self {
            tag,
            valid,
            reference: access_bit,
            dirty: if dirty { access_bit } else { 0 },
            accesses: 1,
            real_hits: 0,
            false_hits: 0,
            misses: 1,
        }
    }

    pub fn holds(&self, bit: u64) -> bool {
        self.valid & bit != 0
    }

    pub fn dirty_valid(&self) -> u64 {
        self.valid & self.dirty
    }

    /// Drop the blocks in `bits`; returns the dropped blocks that were dirty.
    pub fn drop_blocks(&mut self, bits: u64) -> u64 {
        let dropped_dirty = self.dirty & self.valid & bits;
        self.valid &= !bits;
        self.dirty &= self.valid;
        dropped_dirty
    }

    pub fn record_real_hit(&mut self, bit: u64, dirty: bool) {
        self.reference |= bit;
        if dirty {
            self.dirty |= bit;
        }
        self.accesses = self.accesses.saturating_add(1);
        self.real_hits = self.real_hits.saturating_add(1);
    }

    pub fn record_fill(&mut self, bit: u64, dirty: bool) {
        self.valid |= bit;
        if dirty {
            self.dirty |= bit;
        }
        self.reference |= bit;
        self.accesses = self.accesses.saturating_add(1);
        self.false_hits = self.false_hits.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagRole {
    Prime,
    Sub,
}

/// One associative slot holding a prime page and a sub page with disjoint footprints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Way {
    pub prime: Option<TagMeta>,
    pub sub: Option<TagMeta>,
    pub role_changed: bool,
    pub in_way_replacements: u32,
}

impl Way {
    pub fn slot(&self, role: TagRole) -> Option<&TagMeta> {
        match role {
            TagRole::Prime => self.prime.as_ref(),
            TagRole::Sub => self.sub.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, role: TagRole) -> &mut Option<TagMeta> {
        match role {
            TagRole::Prime => &mut self.prime,
            TagRole::Sub => &mut self.sub,
        }
    }

    pub fn prime_tag(&self) -> Option<u64> {
        self.prime.map(|m| m.tag)
    }

    pub fn sub_tag(&self) -> Option<u64> {
        self.sub.map(|m| m.tag)
    }

    /// Which slot holds `tag`, if any.
    pub fn role_of(&self, tag: u64) -> Option<TagRole> {
        if self.prime_tag() == Some(tag) {
            Some(TagRole::Prime)
        } else if self.sub_tag() == Some(tag) {
            Some(TagRole::Sub)
        } else {
            None
        }
    }

    pub fn prime_valid(&self) -> u64 {
        self.prime.map_or(0, |m| m.valid)
    }

    pub fn sub_valid(&self) -> u64 {
        self.sub.map_or(0, |m| m.valid)
    }

    /// The tag is present but the requested block is not.
    pub fn is_tag_only_hit(&self, tag: u64, bit: u64) -> bool {
        match self.role_of(tag) {
            Some(role) => self.slot(role).is_some_and(|m| !m.holds(bit)),
            None => false,
        }
    }

    /// Replace the record in `role`, handing back the previous occupant.
    pub fn replace(&mut self, role: TagRole, meta: Option<TagMeta>) -> Option<TagMeta> {
        std::mem::replace(self.slot_mut(role), meta)
    }

    /// Exchange the prime and sub records of this way.
    pub fn exchange_roles(&mut self) {
        std::mem::swap(&mut self.prime, &mut self.sub);
        self.role_changed = !self.role_changed;
    }

    /// Panics if the way breaks a structural invariant.
    pub fn check_invariants(&self) {
        if let (Some(p), Some(s)) = (self.prime, self.sub) {
            assert!(p.tag != s.tag, "tag {:#x} held as both prime and sub", p.tag);
        }
        assert!(
            self.prime_valid() & self.sub_valid() == 0,
            "prime/sub footprints overlap: prime {:#x} sub {:#x}",
            self.prime_valid(),
            self.sub_valid()
        );
        for meta in self.prime.iter().chain(self.sub.iter()) {
            assert!(
                meta.dirty & !meta.valid == 0,
                "tag {:#x} has dirty blocks {:#x} outside valid {:#x}",
                meta.tag,
                meta.dirty,
                meta.valid
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct Set {
    ways: Vec<Way>,
}

impl Set {
    pub fn new(num_ways: usize) -> Self {
        Self {
            ways: vec![Way::default(); num_ways],
        }
    }

    pub fn way(&self, idx: usize) -> &Way {
        &self.ways[idx]
    }

    pub fn way_mut(&mut self, idx: usize) -> &mut Way {
        &mut self.ways[idx]
    }

    pub fn ways(&self) -> &[Way] {
        &self.ways
    }

    /// Mutable access to two distinct ways at once.
    pub fn pair_mut(&mut self, a: usize, b: usize) -> (&mut Way, &mut Way) {
        assert!(a != b, "pair_mut needs two distinct ways");
        if a < b {
            let (lo, hi) = self.ways.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.ways.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    pub fn empty_way(&self, role: TagRole) -> Option<usize> {
        self.ways.iter().position(|w| w.slot(role).is_none())
    }

    pub fn find(&self, tag: u64) -> Option<(usize, TagRole)> {
        self.ways
            .iter()
            .enumerate()
            .find_map(|(idx, w)| w.role_of(tag).map(|role| (idx, role)))
    }

    /// Panics if any way breaks an invariant or a tag is resident twice.
    pub fn check_invariants(&self) {
        let mut seen: Vec<u64> = Vec::with_capacity(self.ways.len() * 2);
        for way in &self.ways {
            way.check_invariants();
            for tag in way.prime_tag().into_iter().chain(way.sub_tag()) {
                assert!(!seen.contains(&tag), "tag {:#x} resident in two slots", tag);
                seen.push(tag);
            }
        }
    }
}
