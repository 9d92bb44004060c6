use super::ConnectorError;
use crate::memory::{MemoryLayout, Record, TupleBuffer};
use std::{collections::VecDeque, thread, time::Duration};

/// Outcome of [`Source::fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// The buffer holds the next batch.
    Filled,
    /// Nothing arrived in time. The buffer is released and the source is
    /// asked again unless the query stops in the meantime.
    Idle,
    /// The source is exhausted, the buffer is dropped.
    Exhausted,
}

/// Produces the buffers of one origin.
///
/// Every source runs on a thread of its own. The engine stamps the origin
/// and sequence number of every buffer the source fills. Creation time
/// defaults to the moment the buffer left the pool.
pub trait Source: Send + 'static {
    fn open(&mut self, _layout: &MemoryLayout) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Writes the next batch of records into `buffer`. Should not block for
    /// long without returning [`FillStatus::Idle`], the engine only notices
    /// a stop request between calls.
    fn fill(&mut self, buffer: &TupleBuffer, layout: &MemoryLayout)
        -> Result<FillStatus, ConnectorError>;

    fn close(&mut self) {}
}

/// A source replaying batches of records, one buffer per batch.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    batches: VecDeque<(Vec<Record>, u64)>,
    hold_open: bool,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch whose buffer carries `watermark`.
    pub fn with_batch(mut self, records: Vec<Record>, watermark: u64) -> Self {
        self.push_batch(records, watermark);
        self
    }

    pub fn push_batch(&mut self, records: Vec<Record>, watermark: u64) {
        self.batches.push_back((records, watermark));
    }

    /// Keeps the source idle instead of exhausted once every batch was
    /// replayed, so the query only ends when it is stopped.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

impl Source for InMemorySource {
    fn fill(
        &mut self,
        buffer: &TupleBuffer,
        layout: &MemoryLayout,
    ) -> Result<FillStatus, ConnectorError> {
        let Some((records, watermark)) = self.batches.pop_front() else {
            if self.hold_open {
                thread::sleep(Duration::from_millis(5));
                return Ok(FillStatus::Idle);
            }
            return Ok(FillStatus::Exhausted);
        };
        let view = layout.bind(buffer)?;
        if records.len() as u64 > view.capacity() {
            return Err(ConnectorError::BatchTooLarge {
                records: records.len(),
                capacity: view.capacity(),
            });
        }
        for record in &records {
            view.push_record(record)?;
        }
        buffer.set_watermark(watermark);
        Ok(FillStatus::Filled)
    }
}
