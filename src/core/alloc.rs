// Ordered index of live regions in the backing file with first-fit placement.
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    pub offset: u64,
    pub length: u64,
}

impl Region {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Live (offset, length) pairs keyed by owning handle, iterated in
/// ascending-offset order. Entries never overlap; the composite
/// `(offset, id)` key permits zero-length regions at coincident offsets.
#[derive(Debug, Default)]
pub struct AllocationTable {
    by_offset: BTreeMap<(u64, u64), u64>,
    by_id: HashMap<u64, Region>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// First gap (in ascending-offset order) large enough for `needed`
    /// bytes, or the end of the last live entry when no gap fits.
    pub fn place(&self, needed: u64) -> u64 {
        self.place_excluding(None, needed)
    }

    /// Same scan with one handle's entry treated as already freed.
    pub fn place_excluding(&self, skip: Option<u64>, needed: u64) -> u64 {
        let mut cursor = 0u64;
        for (&(offset, id), &length) in &self.by_offset {
            if Some(id) == skip {
                continue;
            }
            if offset > cursor && offset - cursor >= needed {
                return cursor;
            }
            cursor = cursor.max(offset + length);
        }
        cursor
    }

    pub fn insert(&mut self, id: u64, region: Region) {
        debug_assert!(!self.by_id.contains_key(&id), "duplicate handle id");
        self.by_offset.insert((region.offset, id), region.length);
        self.by_id.insert(id, region);
    }

    pub fn remove(&mut self, id: u64) -> Option<Region> {
        let region = self.by_id.remove(&id)?;
        self.by_offset.remove(&(region.offset, id));
        Some(region)
    }

    /// Logical file length: max end over live entries, 0 when empty.
    pub fn end(&self) -> u64 {
        self.by_id.values().map(Region::end).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn live_bytes(&self) -> u64 {
        self.by_id.values().map(|region| region.length).sum()
    }
}
