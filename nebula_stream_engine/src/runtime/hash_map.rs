// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Chained hash map backing keyed aggregation state.
//!
//! Entries live in a paged slab tied to the owning slice's lifetime and are laid out as
//! `[hash | next | key bytes | value bytes]`. The bucket array is sized once at creation
//! (a power of two, at least twice the expected key count) and never rehashed: lift runs
//! while the slice is hot, and chains stay short by construction.

use xxhash_rust::xxh3::xxh3_64;

const ENTRY_HEADER_SIZE: usize = 16;

/// Sizing parameters of one hash-map slice.
#[derive(Clone, Copy, Debug)]
pub struct HashMapOptions {
    pub key_size: usize,
    pub value_size: usize,
    /// Bytes per slab page.
    pub page_size: usize,
    /// Bucket count; rounded up to a power of two.
    pub num_buckets: usize,
}

impl HashMapOptions {
    /// Buckets at twice the expected keys keeps expected chain length under one.
    pub fn for_expected_keys(
        expected_keys: usize,
        key_size: usize,
        value_size: usize,
        page_size: usize,
    ) -> Self {
        Self {
            key_size,
            value_size,
            page_size,
            num_buckets: (expected_keys.max(1) * 2).next_power_of_two(),
        }
    }
}

pub struct ChainedHashMap {
    key_size: usize,
    value_size: usize,
    entry_size: usize,
    entries_per_page: usize,
    page_size: usize,
    /// Encoded as slot index + 1; zero is the empty chain.
    buckets: Vec<u64>,
    mask: u64,
    pages: Vec<Box<[u8]>>,
    next_slot: usize,
    len: usize,
}

impl ChainedHashMap {
    pub fn new(options: HashMapOptions) -> Self {
        let entry_size = ENTRY_HEADER_SIZE + options.key_size + options.value_size;
        let num_buckets = options.num_buckets.next_power_of_two();
        let entries_per_page = (options.page_size / entry_size).max(1);
        Self {
            key_size: options.key_size,
            value_size: options.value_size,
            entry_size,
            entries_per_page,
            page_size: options.page_size,
            buckets: vec![0; num_buckets],
            mask: num_buckets as u64 - 1,
            pages: Vec::new(),
            next_slot: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn hash_of(key: &[u8]) -> u64 {
        xxh3_64(key)
    }

    fn entry_range(&self, slot: usize) -> (usize, usize) {
        (slot / self.entries_per_page, (slot % self.entries_per_page) * self.entry_size)
    }

    fn entry(&self, slot: usize) -> &[u8] {
        let (page, offset) = self.entry_range(slot);
        &self.pages[page][offset..offset + self.entry_size]
    }

    fn entry_mut(&mut self, slot: usize) -> &mut [u8] {
        let (page, offset) = self.entry_range(slot);
        let entry_size = self.entry_size;
        &mut self.pages[page][offset..offset + entry_size]
    }

    fn entry_hash(&self, slot: usize) -> u64 {
        u64::from_le_bytes(self.entry(slot)[..8].try_into().expect("header"))
    }

    fn entry_next(&self, slot: usize) -> Option<usize> {
        let next = u64::from_le_bytes(self.entry(slot)[8..16].try_into().expect("header"));
        (next != 0).then(|| next as usize - 1)
    }

    fn entry_key(&self, slot: usize) -> &[u8] {
        &self.entry(slot)[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + self.key_size]
    }

    /// The value area of an entry.
    pub fn value(&self, slot: usize) -> &[u8] {
        let base = ENTRY_HEADER_SIZE + self.key_size;
        &self.entry(slot)[base..base + self.value_size]
    }

    /// The mutable value area of an entry.
    pub fn value_mut(&mut self, slot: usize) -> &mut [u8] {
        let base = ENTRY_HEADER_SIZE + self.key_size;
        let value_size = self.value_size;
        &mut self.entry_mut(slot)[base..base + value_size]
    }

    /// Finds the slot holding `key`, walking the bucket chain with a byte-wise compare.
    pub fn find(&self, key: &[u8]) -> Option<usize> {
        debug_assert_eq!(key.len(), self.key_size);
        let hash = Self::hash_of(key);
        let bucket = (hash & self.mask) as usize;
        let mut slot = (self.buckets[bucket] != 0).then(|| self.buckets[bucket] as usize - 1);
        while let Some(current) = slot {
            if self.entry_hash(current) == hash && self.entry_key(current) == key {
                return Some(current);
            }
            slot = self.entry_next(current);
        }
        None
    }

    /// Finds `key`'s slot or inserts a zeroed entry for it; at most one entry per key.
    ///
    /// Returns the slot and whether the entry was just inserted.
    pub fn find_or_insert(&mut self, key: &[u8]) -> (usize, bool) {
        if let Some(slot) = self.find(key) {
            return (slot, false);
        }
        let hash = Self::hash_of(key);
        let bucket = (hash & self.mask) as usize;
        let slot = self.allocate();
        let head = self.buckets[bucket];
        let key_size = self.key_size;
        let entry = self.entry_mut(slot);
        entry[..8].copy_from_slice(&hash.to_le_bytes());
        entry[8..16].copy_from_slice(&head.to_le_bytes());
        entry[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + key_size].copy_from_slice(key);
        self.buckets[bucket] = slot as u64 + 1;
        self.len += 1;
        (slot, true)
    }

    fn allocate(&mut self) -> usize {
        let slot = self.next_slot;
        if slot / self.entries_per_page == self.pages.len() {
            let page_bytes = self.entries_per_page * self.entry_size;
            debug_assert!(page_bytes <= self.page_size.max(self.entry_size));
            self.pages.push(vec![0u8; page_bytes].into_boxed_slice());
        }
        self.next_slot += 1;
        slot
    }

    /// Iterates `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        (0..self.next_slot).map(|slot| (self.entry_key(slot), self.value(slot)))
    }
}

impl std::fmt::Debug for ChainedHashMap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ChainedHashMap")
            .field("len", &self.len)
            .field("buckets", &self.buckets.len())
            .field("pages", &self.pages.len())
            .finish()
    }
}
