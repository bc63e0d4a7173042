use anyhow::{bail, Result};

use crate::timeq::Cycle;

/// Occupancy of pinned entries above which the whole buffer is flushed.
pub const FLUSH_OCCUPANCY: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TagBufferEntry {
    tag: Option<u64>,
    /// Placement of this page changed; the entry may not be replaced until reconciled.
    pinned: bool,
    /// Stamp of the last insert or hit; larger is more recent.
    last_use: u64,
}

/// Small set-associative record of pages whose residency the controller already knows,
/// letting it skip a metadata probe of the fast tier.
#[derive(Debug)]
pub struct TagBuffer {
    sets: usize,
    ways: usize,
    entries: Vec<Vec<TagBufferEntry>>,
    pinned: usize,
    clock: u64,
    last_clear_cycle: Cycle,
}

impl TagBuffer {
    pub fn new(sets: usize, ways: usize) -> Self {
        assert!(sets > 0 && ways > 0, "tag buffer needs at least one set and one way");
        let entries = (0..sets).map(|_| Self::empty_set(ways)).collect();
        Self {
            sets,
            ways,
            entries,
            pinned: 0,
            clock: 0,
            last_clear_cycle: 0,
        }
    }

    /// Build from a total entry count split into `ways`-wide sets.
    pub fn with_capacity(capacity: usize, ways: usize) -> Result<Self> {
        if ways == 0 || capacity < ways || capacity % ways != 0 {
            bail!(
                "tag buffer capacity {} must be a non-zero multiple of its {} ways",
                capacity,
                ways
            );
        }
        Ok(Self::new(capacity / ways, ways))
    }

    fn empty_set(ways: usize) -> Vec<TagBufferEntry> {
        vec![
            TagBufferEntry {
                tag: None,
                pinned: false,
                last_use: 0,
            };
            ways
        ]
    }

    fn set_of(&self, tag: u64) -> usize {
        (tag % self.sets as u64) as usize
    }

    fn find(&self, tag: u64) -> Option<usize> {
        let set = &self.entries[self.set_of(tag)];
        set.iter().position(|e| e.tag == Some(tag))
    }

    pub fn probe(&self, tag: u64) -> bool {
        self.find(tag).is_some()
    }

    pub fn is_pinned(&self, tag: u64) -> bool {
        let set_idx = self.set_of(tag);
        self.find(tag)
            .is_some_and(|way| self.entries[set_idx][way].pinned)
    }

    pub fn can_insert(&self, tag: u64) -> bool {
        self.entries[self.set_of(tag)]
            .iter()
            .any(|e| !e.pinned || e.tag == Some(tag))
    }

    /// Both tags can be inserted; never mutates.
    pub fn can_insert_pair(&self, a: u64, b: u64) -> bool {
        if a == b {
            return self.can_insert(a);
        }
        let (set_a, set_b) = (self.set_of(a), self.set_of(b));
        if set_a != set_b {
            return self.can_insert(a) && self.can_insert(b);
        }
        let usable = self.entries[set_a]
            .iter()
            .filter(|e| !e.pinned || e.tag == Some(a) || e.tag == Some(b))
            .count();
        usable >= 2
    }

    /// Install `tag`, pinning it if asked. An existing entry is upgraded to pinned but never
    /// unpinned. Panics if every slot of the set is pinned by other tags.
    pub fn insert(&mut self, tag: u64, pin: bool) {
        let set_idx = self.set_of(tag);
        if let Some(way) = self.find(tag) {
            let entry = &mut self.entries[set_idx][way];
            if pin && !entry.pinned {
                entry.pinned = true;
                self.pinned += 1;
            } else if !entry.pinned {
                self.touch(set_idx, way);
            }
            return;
        }

        // free slots first, then the least recently used unpinned entry
        let victim = self.entries[set_idx]
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.pinned)
            .min_by_key(|(way, e)| (e.tag.is_some(), e.last_use, *way))
            .map(|(way, _)| way);
        let Some(way) = victim else {
            panic!(
                "tag buffer set {} has no unpinned slot for tag {:#x}; capacity check bypassed",
                set_idx, tag
            );
        };
        let entry = &mut self.entries[set_idx][way];
        entry.tag = Some(tag);
        entry.pinned = pin;
        if pin {
            self.pinned += 1;
        } else {
            self.touch(set_idx, way);
        }
    }

    /// Remove a tag known to be present.
    pub fn evict(&mut self, tag: u64) {
        let set_idx = self.set_of(tag);
        let Some(way) = self.find(tag) else {
            panic!("evicting tag {:#x} that is not in the tag buffer", tag);
        };
        let entry = &mut self.entries[set_idx][way];
        if entry.pinned {
            self.pinned -= 1;
        }
        entry.tag = None;
        entry.pinned = false;
        entry.last_use = 0;
    }

    /// Fraction of all slots that are pinned.
    pub fn occupancy(&self) -> f64 {
        self.pinned as f64 / (self.sets * self.ways) as f64
    }

    pub fn pinned(&self) -> usize {
        self.pinned
    }

    pub fn needs_flush(&self) -> bool {
        self.occupancy() > FLUSH_OCCUPANCY
    }

    pub fn clear(&mut self, now: Cycle) {
        for set in self.entries.iter_mut() {
            *set = Self::empty_set(self.ways);
        }
        self.pinned = 0;
        self.clock = 0;
        self.last_clear_cycle = now;
    }

    pub fn last_clear_cycle(&self) -> Cycle {
        self.last_clear_cycle
    }

    // recency is tracked for unpinned entries only
    fn touch(&mut self, set_idx: usize, way: usize) {
        self.clock += 1;
        let entry = &mut self.entries[set_idx][way];
        assert!(!entry.pinned, "touching pinned tag buffer entry {:?}", entry.tag);
        entry.last_use = self.clock;
    }
}
