use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    slice,
};
use thiserror::Error;
use tidal_types::config::SliceStoreConfig;
use xxhash_rust::xxh3::xxh3_64;

/// Every entry starts with the index (plus one) of the next entry in its
/// chain followed by the key's hash.
const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum SnapshotError {
    #[error("entries of {entry_size} bytes cannot hold {key_size} byte keys and {value_size} byte values")]
    EntrySize {
        entry_size: u64,
        key_size: u64,
        value_size: u64,
    },
    #[error("snapshot holds {actual} bytes of entries but {tuple_count} entries need {expected}")]
    MemorySize {
        tuple_count: u64,
        expected: u64,
        actual: u64,
    },
    #[error("{bucket_count} buckets with {chains} chain heads")]
    Buckets { bucket_count: u64, chains: u64 },
    #[error("chain link {link} points past the last of {tuple_count} entries")]
    DanglingLink { link: u64, tuple_count: u64 },
    #[error("variable sized offset {offset} exceeds the {len} bytes of variable sized memory")]
    VarSizedOffset { offset: u64, len: u64 },
}

/// The portable form of a [`ChainedHashMap`], used to migrate window state
/// between engines.
///
/// `memory` holds the `tuple_count` entries back to back, each
/// `entry_size` bytes long, `chains` the head link of every bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMapSnapshot {
    pub memory: Vec<u8>,
    pub chains: Vec<u64>,
    pub entry_size: u64,
    pub tuple_count: u64,
    pub key_size: u64,
    pub value_size: u64,
    pub bucket_count: u64,
    pub var_sized_memory: Vec<u8>,
    pub var_sized_offset: u64,
}

/// A hash map over fixed size byte keys and values with stable entry
/// addresses.
///
/// Entries live in fixed size pages that never move, so the value of an
/// entry can be handed to compiled code as a raw pointer and stays valid
/// until the map is dropped or cleared. Buckets hold singly linked chains of
/// entry indices and are doubled once the load factor exceeds 0.75. Keys may
/// repeat when inserted through [`ChainedHashMap::insert`].
pub struct ChainedHashMap {
    key_size: usize,
    value_size: usize,
    entry_size: usize,
    entries_per_page: usize,
    pages: Vec<Box<[u64]>>,
    /// Index plus one of the first entry of every bucket, zero if empty
    chains: Vec<u64>,
    tuple_count: u64,
    var_sized: Vec<u8>,
}

impl ChainedHashMap {
    pub fn new(key_size: usize, value_size: usize, buckets: usize, page_size: usize) -> Self {
        let entry_size = (HEADER_SIZE + key_size + value_size).div_ceil(8) * 8;
        Self {
            key_size,
            value_size,
            entry_size,
            entries_per_page: (page_size / entry_size).max(1),
            pages: Vec::new(),
            chains: vec![0; buckets.max(1).next_power_of_two()],
            tuple_count: 0,
            var_sized: Vec::new(),
        }
    }

    pub fn from_config(key_size: usize, value_size: usize, config: &SliceStoreConfig) -> Self {
        Self::new(
            key_size,
            value_size,
            config.hash_map_buckets,
            config.hash_map_page_size,
        )
    }

    /// An empty map with the same entry shape and page size as `self`.
    pub fn empty_like(&self) -> Self {
        Self::new(
            self.key_size,
            self.value_size,
            self.chains.len(),
            self.entries_per_page * self.entry_size,
        )
    }

    pub const fn key_size(&self) -> usize {
        self.key_size
    }

    pub const fn value_size(&self) -> usize {
        self.value_size
    }

    pub const fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn bucket_count(&self) -> usize {
        self.chains.len()
    }

    pub const fn len(&self) -> u64 {
        self.tuple_count
    }

    pub const fn is_empty(&self) -> bool {
        self.tuple_count == 0
    }

    fn page_words(&self) -> usize {
        self.entries_per_page * self.entry_size / 8
    }

    fn locate(&self, index: u64) -> (usize, usize) {
        let index = index as usize;
        (
            index / self.entries_per_page,
            (index % self.entries_per_page) * self.entry_size,
        )
    }

    fn entry(&self, index: u64) -> &[u8] {
        let (page, offset) = self.locate(index);
        let words = &self.pages[page];
        // Safety: a page of u64s is always a valid byte slice of eight times
        // its length
        let bytes = unsafe { slice::from_raw_parts(words.as_ptr().cast::<u8>(), words.len() * 8) };
        &bytes[offset..offset + self.entry_size]
    }

    fn entry_mut(&mut self, index: u64) -> &mut [u8] {
        let (page, offset) = self.locate(index);
        let entry_size = self.entry_size;
        let words = &mut self.pages[page];
        // Safety: see `entry`
        let bytes =
            unsafe { slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), words.len() * 8) };
        &mut bytes[offset..offset + entry_size]
    }

    fn header(&self, index: u64) -> (u64, u64) {
        let entry = self.entry(index);
        (read_u64(&entry[..8]), read_u64(&entry[8..16]))
    }

    fn set_next(&mut self, index: u64, next: u64) {
        self.entry_mut(index)[..8].copy_from_slice(&next.to_le_bytes());
    }

    fn key_of(&self, index: u64) -> &[u8] {
        &self.entry(index)[HEADER_SIZE..HEADER_SIZE + self.key_size]
    }

    fn value_of(&self, index: u64) -> &[u8] {
        let start = HEADER_SIZE + self.key_size;
        &self.entry(index)[start..start + self.value_size]
    }

    fn value_of_mut(&mut self, index: u64) -> &mut [u8] {
        let start = HEADER_SIZE + self.key_size;
        let end = start + self.value_size;
        &mut self.entry_mut(index)[start..end]
    }

    fn bucket(&self, hash: u64) -> usize {
        (hash & (self.chains.len() as u64 - 1)) as usize
    }

    /// Iterates over the indices of the entries whose key equals `key`.
    fn chain<'a>(&'a self, key: &'a [u8], hash: u64) -> impl Iterator<Item = u64> + 'a {
        let mut link = self.chains[self.bucket(hash)];
        std::iter::from_fn(move || {
            while link != 0 {
                let index = link - 1;
                let (next, entry_hash) = self.header(index);
                link = next;
                if entry_hash == hash && self.key_of(index) == key {
                    return Some(index);
                }
            }
            None
        })
    }

    fn check_key(&self, key: &[u8]) {
        assert_eq!(
            key.len(),
            self.key_size,
            "key of {} bytes in a map with {} byte keys",
            key.len(),
            self.key_size,
        );
    }

    /// Appends a new entry without looking for an existing key.
    fn push_entry(&mut self, key: &[u8], hash: u64, value: &[u8]) -> u64 {
        if (self.tuple_count + 1) * 4 > self.chains.len() as u64 * 3 {
            self.grow();
        }

        let index = self.tuple_count;
        let (page, _) = self.locate(index);
        if page == self.pages.len() {
            self.pages
                .push(vec![0u64; self.page_words()].into_boxed_slice());
        }
        self.tuple_count += 1;

        let bucket = self.bucket(hash);
        let head = self.chains[bucket];
        let key_size = self.key_size;
        let entry = self.entry_mut(index);
        entry[..8].copy_from_slice(&head.to_le_bytes());
        entry[8..16].copy_from_slice(&hash.to_le_bytes());
        entry[HEADER_SIZE..HEADER_SIZE + key_size].copy_from_slice(key);
        let value_start = HEADER_SIZE + key_size;
        entry[value_start..value_start + value.len()].copy_from_slice(value);
        self.chains[bucket] = index + 1;
        index
    }

    fn grow(&mut self) {
        let buckets = self.chains.len() * 2;
        tracing::trace!("growing hash map to {buckets} buckets");
        self.chains = vec![0; buckets];
        for index in 0..self.tuple_count {
            let (_, hash) = self.header(index);
            let bucket = self.bucket(hash);
            let head = self.chains[bucket];
            self.set_next(index, head);
            self.chains[bucket] = index + 1;
        }
    }

    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        self.check_key(key);
        let hash = xxh3_64(key);
        self.chain(key, hash)
            .next()
            .map(|index| self.value_of(index))
    }

    /// Returns the value stored under `key`, inserting `init` first if the
    /// key is not present. The flag is `true` if the entry was inserted.
    pub fn find_or_insert(&mut self, key: &[u8], init: &[u8]) -> (&mut [u8], bool) {
        self.check_key(key);
        debug_assert_eq!(init.len(), self.value_size);
        let hash = xxh3_64(key);
        let existing = self.chain(key, hash).next();
        match existing {
            Some(index) => (self.value_of_mut(index), false),
            None => {
                let index = self.push_entry(key, hash, init);
                (self.value_of_mut(index), true)
            }
        }
    }

    /// Inserts a new entry even if `key` is already present.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> &mut [u8] {
        self.check_key(key);
        let hash = xxh3_64(key);
        let index = self.push_entry(key, hash, value);
        self.value_of_mut(index)
    }

    /// All values stored under `key`, most recently inserted first.
    pub fn matches<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.check_key(key);
        let hash = xxh3_64(key);
        self.chain(key, hash).map(move |index| self.value_of(index))
    }

    /// All `(key, value)` pairs in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.tuple_count).map(move |index| (self.key_of(index), self.value_of(index)))
    }

    /// Folds `other` into `self`: values of keys present in both maps are
    /// combined with `combine(existing, incoming)`, other entries are copied.
    pub fn merge<F>(&mut self, other: &ChainedHashMap, mut combine: F)
    where
        F: FnMut(&mut [u8], &[u8]),
    {
        assert_eq!(
            (self.key_size, self.value_size),
            (other.key_size, other.value_size)
        );
        for index in 0..other.tuple_count {
            let (_, hash) = other.header(index);
            let (key, value) = (other.key_of(index), other.value_of(index));
            let existing = self.chain(key, hash).next();
            match existing {
                Some(existing) => combine(self.value_of_mut(existing), value),
                None => {
                    self.push_entry(key, hash, value);
                }
            }
        }
    }

    /// Copies every entry of `other` into `self`, keeping duplicates.
    pub fn append(&mut self, other: &ChainedHashMap) {
        assert_eq!(
            (self.key_size, self.value_size),
            (other.key_size, other.value_size)
        );
        for index in 0..other.tuple_count {
            let (_, hash) = other.header(index);
            self.push_entry(other.key_of(index), hash, other.value_of(index));
        }
    }

    /// Stores variable sized data next to the map and returns its offset.
    pub fn insert_var_sized(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.var_sized.len() as u64;
        self.var_sized.extend_from_slice(bytes);
        offset
    }

    pub fn var_sized(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.var_sized.get(start..start.checked_add(len)?)
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.chains.iter_mut().for_each(|link| *link = 0);
        self.tuple_count = 0;
        self.var_sized.clear();
    }

    /// Bytes allocated for entries, chains and variable sized data.
    pub fn memory_usage(&self) -> usize {
        self.pages.len() * self.page_words() * 8 + self.chains.len() * 8 + self.var_sized.len()
    }

    pub fn export(&self) -> HashMapSnapshot {
        let mut memory = Vec::with_capacity(self.tuple_count as usize * self.entry_size);
        for index in 0..self.tuple_count {
            memory.extend_from_slice(self.entry(index));
        }
        HashMapSnapshot {
            memory,
            chains: self.chains.clone(),
            entry_size: self.entry_size as u64,
            tuple_count: self.tuple_count,
            key_size: self.key_size as u64,
            value_size: self.value_size as u64,
            bucket_count: self.chains.len() as u64,
            var_sized_memory: self.var_sized.clone(),
            var_sized_offset: self.var_sized.len() as u64,
        }
    }

    /// Rebuilds a map from a snapshot, storing entries in pages of
    /// `page_size` bytes.
    pub fn import(snapshot: &HashMapSnapshot, page_size: usize) -> Result<Self, SnapshotError> {
        let mut map = Self::new(
            snapshot.key_size as usize,
            snapshot.value_size as usize,
            snapshot.bucket_count as usize,
            page_size,
        );
        if map.entry_size as u64 != snapshot.entry_size {
            return Err(SnapshotError::EntrySize {
                entry_size: snapshot.entry_size,
                key_size: snapshot.key_size,
                value_size: snapshot.value_size,
            });
        }

        let expected = snapshot.tuple_count * snapshot.entry_size;
        if snapshot.memory.len() as u64 != expected {
            return Err(SnapshotError::MemorySize {
                tuple_count: snapshot.tuple_count,
                expected,
                actual: snapshot.memory.len() as u64,
            });
        }
        if !snapshot.bucket_count.is_power_of_two()
            || snapshot.chains.len() as u64 != snapshot.bucket_count
        {
            return Err(SnapshotError::Buckets {
                bucket_count: snapshot.bucket_count,
                chains: snapshot.chains.len() as u64,
            });
        }
        if snapshot.var_sized_offset > snapshot.var_sized_memory.len() as u64 {
            return Err(SnapshotError::VarSizedOffset {
                offset: snapshot.var_sized_offset,
                len: snapshot.var_sized_memory.len() as u64,
            });
        }

        let check_link = |link: u64| {
            if link > snapshot.tuple_count {
                Err(SnapshotError::DanglingLink {
                    link,
                    tuple_count: snapshot.tuple_count,
                })
            } else {
                Ok(())
            }
        };
        for &link in &snapshot.chains {
            check_link(link)?;
        }

        for (index, entry) in snapshot
            .memory
            .chunks_exact(snapshot.entry_size as usize)
            .enumerate()
        {
            check_link(read_u64(&entry[..8]))?;
            let (page, _) = map.locate(index as u64);
            if page == map.pages.len() {
                map.pages.push(vec![0u64; map.page_words()].into_boxed_slice());
            }
            map.tuple_count += 1;
            map.entry_mut(index as u64).copy_from_slice(entry);
        }

        map.chains.copy_from_slice(&snapshot.chains);
        map.var_sized = snapshot.var_sized_memory[..snapshot.var_sized_offset as usize].to_vec();
        Ok(map)
    }
}

impl Debug for ChainedHashMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedHashMap")
            .field("key_size", &self.key_size)
            .field("value_size", &self.value_size)
            .field("len", &self.tuple_count)
            .field("buckets", &self.chains.len())
            .finish_non_exhaustive()
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}
