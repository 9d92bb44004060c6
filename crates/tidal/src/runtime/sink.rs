use super::ConnectorError;
use crate::memory::{MemoryLayout, Record, TupleBuffer};
use std::sync::{Arc, Mutex, MutexGuard};
use tidal_types::query::OriginId;
use tracing::warn;

/// Receives the buffers emitted by a query's sink pipeline.
///
/// Writes are serialized by the engine but may come from any worker.
pub trait Sink: Send + 'static {
    fn open(&mut self, _layout: &MemoryLayout) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Consumes one non-empty buffer. Returning `false` fails the query.
    fn write(&mut self, buffer: &TupleBuffer) -> bool;

    fn close(&mut self) {}
}

/// Metadata of a buffer received by a [`CollectingSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedBuffer {
    pub origin: OriginId,
    pub sequence: u64,
    pub watermark: u64,
    pub num_tuples: u64,
}

#[derive(Debug, Default)]
struct Collected {
    layout: Option<MemoryLayout>,
    records: Vec<Record>,
    buffers: Vec<ReceivedBuffer>,
    closed: bool,
}

/// A sink keeping every record it receives in memory.
///
/// Clones share what was collected, keep one to inspect the output after
/// handing the other to the engine.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    inner: Arc<Mutex<Collected>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every record received so far, in arrival order.
    pub fn records(&self) -> Vec<Record> {
        self.lock().records.clone()
    }

    pub fn buffers(&self) -> Vec<ReceivedBuffer> {
        self.lock().buffers.clone()
    }

    pub fn layout(&self) -> Option<MemoryLayout> {
        self.lock().layout.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Sink for CollectingSink {
    fn open(&mut self, layout: &MemoryLayout) -> Result<(), ConnectorError> {
        self.lock().layout = Some(layout.clone());
        Ok(())
    }

    fn write(&mut self, buffer: &TupleBuffer) -> bool {
        let mut collected = self.lock();
        let Some(layout) = &collected.layout else {
            warn!("collecting sink received a buffer before it was opened");
            return false;
        };
        let records = match layout.bind(buffer).and_then(|view| view.records()) {
            Ok(records) => records,
            Err(error) => {
                warn!("collecting sink cannot read buffer: {error}");
                return false;
            }
        };
        collected.records.extend(records);
        collected.buffers.push(ReceivedBuffer {
            origin: buffer.origin_id(),
            sequence: buffer.sequence_number(),
            watermark: buffer.watermark(),
            num_tuples: buffer.num_tuples(),
        });
        true
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::Schema, types::Type};
    use pretty_assertions::assert_eq;

    #[test]
    fn clones_share_the_collected_records() {
        let layout = MemoryLayout::row(Schema::new().with("v", Type::U32), 32).unwrap();
        let observer = CollectingSink::new();
        let mut sink: Box<dyn Sink> = Box::new(observer.clone());

        let buffer = TupleBuffer::unpooled(32);
        layout
            .bind(&buffer)
            .unwrap()
            .push_record(&Record::new().with("v", 7u32))
            .unwrap();
        assert!(!sink.write(&buffer));

        sink.open(&layout).unwrap();
        assert!(sink.write(&buffer));
        sink.close();

        assert_eq!(observer.records(), [Record::new().with("v", 7u32)]);
        assert_eq!(observer.buffers()[0].num_tuples, 1);
        assert!(observer.is_closed());
    }
}
