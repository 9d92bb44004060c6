use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    mem::ManuallyDrop,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tidal_types::query::OriginId;

/// Position of a buffer within the stream of its origin.
///
/// A single upstream buffer may be split into several chunks; all chunks
/// share the sequence number and the final one carries `last_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct SequenceData {
    pub sequence: u64,
    pub chunk: u64,
    pub last_chunk: bool,
}

impl SequenceData {
    pub const fn new(sequence: u64, chunk: u64, last_chunk: bool) -> Self {
        Self {
            sequence,
            chunk,
            last_chunk,
        }
    }

    /// A buffer that was not split.
    pub const fn single(sequence: u64) -> Self {
        Self::new(sequence, 1, true)
    }
}

/// An owned, 8-byte aligned allocation that can travel between threads.
pub(crate) struct Segment {
    ptr: NonNull<u64>,
    words: usize,
}

// Safety: a segment uniquely owns its allocation
unsafe impl Send for Segment {}

impl Segment {
    pub(crate) fn new(bytes: usize) -> Self {
        let words = bytes.div_ceil(8).max(1);
        let boxed = vec![0u64; words].into_boxed_slice();
        Self {
            ptr: NonNull::from(Box::leak(boxed)).cast::<u64>(),
            words,
        }
    }

    pub(crate) const fn len_bytes(&self) -> usize {
        self.words * 8
    }

    fn zero(&mut self) {
        // Safety: the segment owns `words` initialized u64s
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), 0, self.words) };
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Safety: the pointer and length came from a leaked `Box<[u64]>`
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.words,
            )));
        }
    }
}

struct Inner {
    segment: Option<Segment>,
    data: NonNull<u8>,
    capacity: usize,
    num_tuples: AtomicU64,
    sequence: AtomicU64,
    chunk: AtomicU64,
    last_chunk: AtomicBool,
    origin: AtomicU64,
    watermark: AtomicU64,
    creation_ts: AtomicU64,
    recycler: Option<Sender<Segment>>,
}

// Safety: the data region is written by a single producer before the buffer
// is published downstream and only read afterwards. All metadata is atomic.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        if let (Some(segment), Some(recycler)) = (self.segment.take(), self.recycler.as_ref()) {
            // If the pool is gone the segment is freed right here
            let _ = recycler.send(segment);
        }
    }
}

/// A reference counted, fixed capacity block of memory plus the metadata
/// describing its place in a stream.
///
/// Cloning a buffer is cheap and shares the underlying memory. When the last
/// clone of a pooled buffer is dropped its memory returns to the pool it was
/// allocated from.
#[derive(Clone)]
pub struct TupleBuffer {
    inner: Arc<Inner>,
}

impl TupleBuffer {
    pub(crate) fn from_segment(mut segment: Segment, recycler: Option<Sender<Segment>>) -> Self {
        segment.zero();
        let data = segment.ptr.cast::<u8>();
        let capacity = segment.len_bytes();
        Self {
            inner: Arc::new(Inner {
                segment: Some(segment),
                data,
                capacity,
                num_tuples: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                chunk: AtomicU64::new(1),
                last_chunk: AtomicBool::new(true),
                origin: AtomicU64::new(0),
                watermark: AtomicU64::new(0),
                creation_ts: AtomicU64::new(now_millis()),
                recycler,
            }),
        }
    }

    /// Allocates a buffer outside of any pool.
    pub fn unpooled(capacity: usize) -> Self {
        Self::from_segment(Segment::new(capacity), None)
    }

    /// The capacity of the buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Raw pointer to the start of the buffer's memory.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.data.as_ptr()
    }

    pub fn num_tuples(&self) -> u64 {
        self.inner.num_tuples.load(Ordering::Acquire)
    }

    pub fn set_num_tuples(&self, num_tuples: u64) {
        self.inner.num_tuples.store(num_tuples, Ordering::Release);
    }

    pub fn sequence_number(&self) -> u64 {
        self.inner.sequence.load(Ordering::Relaxed)
    }

    pub fn set_sequence_number(&self, sequence: u64) {
        self.inner.sequence.store(sequence, Ordering::Relaxed);
    }

    pub fn chunk_number(&self) -> u64 {
        self.inner.chunk.load(Ordering::Relaxed)
    }

    pub fn set_chunk_number(&self, chunk: u64) {
        self.inner.chunk.store(chunk, Ordering::Relaxed);
    }

    pub fn is_last_chunk(&self) -> bool {
        self.inner.last_chunk.load(Ordering::Relaxed)
    }

    pub fn set_last_chunk(&self, last_chunk: bool) {
        self.inner.last_chunk.store(last_chunk, Ordering::Relaxed);
    }

    pub fn sequence_data(&self) -> SequenceData {
        SequenceData::new(
            self.sequence_number(),
            self.chunk_number(),
            self.is_last_chunk(),
        )
    }

    pub fn set_sequence_data(&self, data: SequenceData) {
        self.set_sequence_number(data.sequence);
        self.set_chunk_number(data.chunk);
        self.set_last_chunk(data.last_chunk);
    }

    pub fn origin_id(&self) -> OriginId {
        OriginId(self.inner.origin.load(Ordering::Relaxed))
    }

    pub fn set_origin_id(&self, origin: OriginId) {
        self.inner.origin.store(origin.get(), Ordering::Relaxed);
    }

    pub fn watermark(&self) -> u64 {
        self.inner.watermark.load(Ordering::Relaxed)
    }

    pub fn set_watermark(&self, watermark: u64) {
        self.inner.watermark.store(watermark, Ordering::Relaxed);
    }

    /// Creation time in milliseconds since the unix epoch.
    pub fn creation_ts(&self) -> u64 {
        self.inner.creation_ts.load(Ordering::Relaxed)
    }

    pub fn set_creation_ts(&self, creation_ts: u64) {
        self.inner.creation_ts.store(creation_ts, Ordering::Relaxed);
    }

    /// Copies every metadata field except the tuple count from `other`.
    pub fn copy_metadata(&self, other: &TupleBuffer) {
        self.set_sequence_data(other.sequence_data());
        self.set_origin_id(other.origin_id());
        self.set_watermark(other.watermark());
        self.set_creation_ts(other.creation_ts());
    }

    /// Copies `len` bytes starting at `offset` into a new vector.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the buffer's capacity.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.read_into(offset, &mut out);
        out
    }

    pub(crate) fn read_into(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.capacity());
        // Safety: the range was checked against the allocation
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }

    pub(crate) fn write_from(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.capacity());
        // Safety: the range was checked against the allocation and writes
        // happen before the buffer is published
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr().add(offset), bytes.len());
        }
    }

    /// Returns `true` if both handles refer to the same memory.
    pub fn ptr_eq(&self, other: &TupleBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// An opaque integer identifying this buffer, suitable for passing
    /// through compiled code. Valid while any clone of the buffer is alive.
    pub fn handle(&self) -> u64 {
        Arc::as_ptr(&self.inner) as u64
    }

    /// Runs `f` with a borrowed view of the buffer behind `handle`.
    ///
    /// # Safety
    ///
    /// `handle` must come from [`TupleBuffer::handle`] on a buffer that stays
    /// alive for the duration of the call.
    pub unsafe fn with_handle<R>(handle: u64, f: impl FnOnce(&TupleBuffer) -> R) -> R {
        let buffer = ManuallyDrop::new(TupleBuffer {
            inner: Arc::from_raw(handle as *const Inner),
        });
        f(&buffer)
    }
}

impl Debug for TupleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("capacity", &self.capacity())
            .field("num_tuples", &self.num_tuples())
            .field("origin", &self.origin_id())
            .field("sequence", &self.sequence_data())
            .field("watermark", &self.watermark())
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrip() {
        let buffer = TupleBuffer::unpooled(30);
        assert_eq!(buffer.capacity(), 32);
        assert_eq!(buffer.as_ptr() as usize % 8, 0);

        buffer.set_num_tuples(3);
        buffer.set_sequence_data(SequenceData::new(9, 2, false));
        buffer.set_origin_id(OriginId(4));
        buffer.set_watermark(1_000);

        let copy = TupleBuffer::unpooled(8);
        copy.copy_metadata(&buffer);
        assert_eq!(copy.sequence_data(), SequenceData::new(9, 2, false));
        assert_eq!(copy.origin_id(), OriginId(4));
        assert_eq!(copy.watermark(), 1_000);
        assert_eq!(copy.num_tuples(), 0);
    }

    #[test]
    fn handles_borrow_without_changing_refcount() {
        let buffer = TupleBuffer::unpooled(16);
        buffer.write_from(0, &[1, 2, 3]);
        let handle = buffer.handle();
        let read = unsafe { TupleBuffer::with_handle(handle, |view| view.read_bytes(0, 3)) };
        assert_eq!(read, vec![1, 2, 3]);
        assert_eq!(Arc::strong_count(&buffer.inner), 1);
    }
}
