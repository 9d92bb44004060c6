use super::{
    buffer::{Segment, TupleBuffer},
    MemoryError,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::{
    fmt::{self, Debug},
    sync::Arc,
    time::Duration,
};
use tidal_types::config::BufferPoolConfig;
use tracing::{debug, trace, warn};

struct PoolInner {
    buffer_size: usize,
    num_buffers: usize,
    free_tx: Sender<Segment>,
    free_rx: Receiver<Segment>,
}

/// A fixed size pool of equally sized tuple buffers.
///
/// Buffers return to the pool when their last clone is dropped, waking up
/// any thread blocked in [`BufferManager::get_buffer_timeout`].
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<PoolInner>,
}

impl BufferManager {
    pub fn new(buffer_size: usize, num_buffers: usize) -> Self {
        let buffer_size = buffer_size.max(8).div_ceil(8) * 8;
        let (free_tx, free_rx) = channel::bounded(num_buffers.max(1));
        for _ in 0..num_buffers {
            // The channel was sized to hold every segment
            let _ = free_tx.send(Segment::new(buffer_size));
        }
        debug!("created buffer pool with {num_buffers} buffers of {buffer_size} bytes");

        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                num_buffers,
                free_tx,
                free_rx,
            }),
        }
    }

    pub fn from_config(config: &BufferPoolConfig) -> Self {
        Self::new(config.buffer_size, config.num_buffers)
    }

    /// The capacity in bytes of every pooled buffer.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn num_buffers(&self) -> usize {
        self.inner.num_buffers
    }

    /// Number of buffers currently sitting in the pool.
    pub fn available_buffers(&self) -> usize {
        self.inner.free_rx.len()
    }

    /// Takes a buffer from the pool without blocking.
    pub fn try_get_buffer(&self) -> Result<TupleBuffer, MemoryError> {
        match self.inner.free_rx.try_recv() {
            Ok(segment) => Ok(self.wrap(segment)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                trace!("buffer pool exhausted");
                Err(MemoryError::OutOfBuffers {
                    waited: Duration::ZERO,
                })
            }
        }
    }

    /// Takes a buffer from the pool, blocking for at most `timeout` until one
    /// is released.
    pub fn get_buffer_timeout(&self, timeout: Duration) -> Result<TupleBuffer, MemoryError> {
        match self.inner.free_rx.recv_timeout(timeout) {
            Ok(segment) => Ok(self.wrap(segment)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                warn!(
                    "buffer pool of {} buffers exhausted for {timeout:?}",
                    self.inner.num_buffers,
                );
                Err(MemoryError::OutOfBuffers { waited: timeout })
            }
        }
    }

    fn wrap(&self, segment: Segment) -> TupleBuffer {
        TupleBuffer::from_segment(segment, Some(self.inner.free_tx.clone()))
    }
}

impl Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("buffer_size", &self.inner.buffer_size)
            .field("num_buffers", &self.inner.num_buffers)
            .field("available", &self.available_buffers())
            .finish()
    }
}
