//! Bounded most-recently-used sector cache
//!
//! Decoding a sector's record index costs one flash read per record header,
//! so decoded [`Sector`] entries are kept in a small deque, most recent at
//! the front. The cache owns its entries; the engine takes a sector out,
//! works on it, and puts it back, so there is exactly one copy of any
//! sector's index at a time.

use std::collections::VecDeque;

use crate::sector::{Sector, SectorCommon};

/// Default bound on resident entries; tunable via
/// [`RingConfig`](crate::RingConfig).
pub const DEFAULT_CACHE_SIZE: usize = 8;

#[derive(Debug)]
pub struct SectorCache {
    entries: VecDeque<Sector>,
    capacity: usize,
}

impl SectorCache {
    pub fn new(capacity: usize) -> Self {
        SectorCache {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Remove and return the entry for `sector_num`, if cached.
    pub fn take(&mut self, sector_num: u16) -> Option<Sector> {
        let pos = self
            .entries
            .iter()
            .position(|s| s.sector_num == sector_num)?;
        self.entries.remove(pos)
    }

    /// Insert `sector` at the front, replacing any stale entry for the same
    /// sector and evicting the least recently used entry when full.
    pub fn insert(&mut self, sector: Sector) {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|s| s.sector_num == sector.sector_num)
        {
            self.entries.remove(pos);
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(sector);
    }

    /// Mirror a header rewrite into any cached entry: replace its state word
    /// and drop its record index. No effect if the sector is not resident.
    pub fn reset(&mut self, sector_num: u16, common: SectorCommon) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|s| s.sector_num == sector_num)
        {
            entry.common = common;
            entry.records.clear();
        }
    }

    pub fn contains(&self, sector_num: u16) -> bool {
        self.entries.iter().any(|s| s.sector_num == sector_num)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
