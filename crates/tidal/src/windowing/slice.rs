use super::hash_map::ChainedHashMap;
use crossbeam::utils::Backoff;
use serde::Serialize;
use std::{
    cell::UnsafeCell,
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tidal_types::config::SliceStoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SliceState {
    /// Accepting tuples.
    Open,
    /// The watermark passed the end of the slice, windows covering it are
    /// being emitted.
    Closing,
    /// Every window covering the slice was emitted.
    Closed,
}

/// Key and value size of the hash maps of one input side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MapShape {
    pub key_size: usize,
    pub value_size: usize,
}

impl MapShape {
    pub const fn new(key_size: usize, value_size: usize) -> Self {
        Self {
            key_size,
            value_size,
        }
    }
}

/// Partial state for the interval `[start, end)`.
///
/// Every input side owns one hash map per worker. A worker only touches its
/// own maps and only while it holds a [`SlicePin`]; the maps are read once
/// the slice stopped accepting tuples and every pin was released.
pub struct Slice {
    start: u64,
    end: u64,
    workers: usize,
    maps: Box<[UnsafeCell<ChainedHashMap>]>,
    writers: AtomicUsize,
}

// Safety: access to the maps follows the pin protocol described above
unsafe impl Send for Slice {}
unsafe impl Sync for Slice {}

impl Slice {
    pub fn new(
        start: u64,
        end: u64,
        shapes: &[MapShape],
        workers: usize,
        config: &SliceStoreConfig,
    ) -> Self {
        let workers = workers.max(1);
        let maps = shapes
            .iter()
            .flat_map(|shape| {
                (0..workers).map(move |_| {
                    UnsafeCell::new(ChainedHashMap::from_config(
                        shape.key_size,
                        shape.value_size,
                        config,
                    ))
                })
            })
            .collect();
        Self {
            start,
            end,
            workers,
            maps,
            writers: AtomicUsize::new(0),
        }
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    pub const fn end(&self) -> u64 {
        self.end
    }

    pub const fn contains(&self, ts: u64) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    pub(super) fn pin(self: &Arc<Self>) -> SlicePin {
        self.writers.fetch_add(1, Ordering::SeqCst);
        SlicePin {
            slice: self.clone(),
        }
    }

    /// Spins until every pin on the slice was released.
    pub fn wait_for_writers(&self) {
        let backoff = Backoff::new();
        while self.writers() != 0 {
            backoff.snooze();
        }
    }

    fn index(&self, side: usize, worker: usize) -> usize {
        side * self.workers + worker % self.workers
    }

    /// The map of `side` owned by `worker`.
    ///
    /// # Safety
    ///
    /// The caller must hold a pin on the slice and be the only thread
    /// acting as `worker`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn map_mut(&self, side: usize, worker: usize) -> &mut ChainedHashMap {
        &mut *self.maps[self.index(side, worker)].get()
    }

    /// Every worker's map of `side`.
    ///
    /// # Safety
    ///
    /// No pin may be held on the slice and none may be taken while the
    /// returned maps are alive.
    pub unsafe fn maps(&self, side: usize) -> impl Iterator<Item = &ChainedHashMap> + '_ {
        (0..self.workers).map(move |worker| &*self.maps[self.index(side, worker)].get())
    }
}

impl Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("writers", &self.writers())
            .finish_non_exhaustive()
    }
}

/// Permission to write into a slice, released on drop.
#[derive(Debug)]
pub struct SlicePin {
    slice: Arc<Slice>,
}

impl SlicePin {
    pub fn slice(&self) -> &Slice {
        &self.slice
    }
}

impl Drop for SlicePin {
    fn drop(&mut self) {
        self.slice.writers.fetch_sub(1, Ordering::SeqCst);
    }
}
