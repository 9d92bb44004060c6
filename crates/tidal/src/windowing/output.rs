use super::{SliceStore, TriggerBatch};
use crate::{
    memory::{now_millis, MemoryLayout, SequenceData, TupleBuffer},
    pipeline::{PipelineError, PipelineExecutionContext, WorkerContext},
    types::Value,
};
use tidal_types::query::OriginId;
use tracing::debug;

/// Applies the watermark of the invocation that just ended to `store` and
/// collects the windows it finalizes. The batch is returned once nobody
/// writes into its slices anymore.
pub(crate) fn advance(store: &SliceStore, worker: &mut WorkerContext) -> Option<TriggerBatch> {
    worker.release_pins();
    let input = *worker.input();
    let Some(watermark) = store.observe(
        input.origin,
        input.sequence,
        worker.watermark(),
        input.creation_ts,
    ) else {
        debug!("ignoring watermark of untracked {}", input.origin);
        return None;
    };

    let batch = store.trigger(watermark, now_millis())?;
    batch.wait_for_writers();
    Some(batch)
}

/// Writes the results of one trigger batch into buffers of `layout`.
///
/// The buffers form one sequence of the handler's origin, a batch without
/// results still yields an empty buffer so that the watermark reaches the
/// next pipeline.
pub(crate) struct BatchWriter<'a> {
    ctx: &'a PipelineExecutionContext,
    layout: &'a MemoryLayout,
    buffers: Vec<TupleBuffer>,
}

impl<'a> BatchWriter<'a> {
    pub fn new(ctx: &'a PipelineExecutionContext, layout: &'a MemoryLayout) -> Self {
        Self {
            ctx,
            layout,
            buffers: Vec::new(),
        }
    }

    /// Appends one record, `values` in schema order.
    pub fn push(&mut self, values: &[Value]) -> Result<(), PipelineError> {
        let full = match self.buffers.last() {
            Some(buffer) => buffer.num_tuples() >= self.layout.bind(buffer)?.capacity(),
            None => true,
        };
        if full {
            self.buffers.push(self.ctx.allocate_buffer()?);
        }

        if let Some(buffer) = self.buffers.last() {
            let bound = self.layout.bind(buffer)?;
            let index = buffer.num_tuples();
            for (field, value) in values.iter().enumerate() {
                bound.write_field(index, field, *value)?;
            }
            buffer.set_num_tuples(index + 1);
        }
        Ok(())
    }

    /// Stamps the buffers as chunks of `sequence` and dispatches them.
    pub fn finish(mut self, origin: OriginId, sequence: u64, watermark: u64) -> Result<(), PipelineError> {
        if self.buffers.is_empty() {
            self.buffers.push(self.ctx.allocate_buffer()?);
        }

        let chunks = self.buffers.len() as u64;
        let creation_ts = now_millis();
        for (chunk, buffer) in (1..).zip(self.buffers) {
            buffer.set_origin_id(origin);
            buffer.set_sequence_data(SequenceData::new(sequence, chunk, chunk == chunks));
            buffer.set_watermark(watermark);
            buffer.set_creation_ts(creation_ts);
            self.ctx.emit(buffer)?;
        }
        Ok(())
    }
}
