use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocatorEntry {
    /// Way currently holding the page, `None` when it is not resident.
    pub way: Option<usize>,
    /// Referenced sub-blocks observed the last time the page was evicted.
    pub footprint_history: u64,
}

/// Page-to-way map consulted before any tag probe, plus per-page footprint history
/// used to size prefetches when a page is brought back.
#[derive(Debug, Default)]
pub struct WayLocator {
    entries: HashMap<u64, LocatorEntry>,
}

impl WayLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an absent entry on first reference. Returns true if the tag was new.
    pub fn touch(&mut self, tag: u64) -> bool {
        if self.entries.contains_key(&tag) {
            return false;
        }
        self.entries.insert(tag, LocatorEntry::default());
        true
    }

    pub fn lookup(&self, tag: u64) -> Option<usize> {
        self.entries.get(&tag).and_then(|e| e.way)
    }

    pub fn entry(&self, tag: u64) -> Option<&LocatorEntry> {
        self.entries.get(&tag)
    }

    pub fn bind(&mut self, tag: u64, way: usize) {
        self.entries.entry(tag).or_default().way = Some(way);
    }

    /// Mark the page as no longer resident, remembering what it referenced.
    pub fn unbind(&mut self, tag: u64, history: u64) {
        let entry = self.entries.entry(tag).or_default();
        entry.way = None;
        entry.footprint_history = history;
    }

    pub fn history(&self, tag: u64) -> u64 {
        self.entries.get(&tag).map_or(0, |e| e.footprint_history)
    }

    pub fn set_history(&mut self, tag: u64, history: u64) {
        self.entries.entry(tag).or_default().footprint_history = history;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.entries
            .iter()
            .filter_map(|(&tag, e)| e.way.map(|way| (tag, way)))
    }
}
