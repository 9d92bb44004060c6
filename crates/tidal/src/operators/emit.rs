use super::{store_field, ExecutionContext, Flow, OperatorState, TracedRecord};
use crate::{
    memory::MemoryLayout,
    trace::{TraceContext, TraceError, TraceResult},
};
use serde::Serialize;

/// Writes records into output buffers of `layout` and emits every buffer
/// once it is full. Closing emits the last, possibly empty, buffer, so that
/// every input buffer is answered by at least one output buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Emit {
    pub layout: MemoryLayout,
}

impl Emit {
    pub const fn new(layout: MemoryLayout) -> Self {
        Self { layout }
    }

    pub(super) fn open(&self, ctx: &ExecutionContext, t: &mut TraceContext<'_>) -> TraceResult<OperatorState> {
        let buffer = ctx.allocate(t)?;
        let data = ctx.buffer_data(t, buffer)?;
        let zero = t.constant(0u64)?;
        Ok(OperatorState::Output {
            buffer: t.var(buffer)?,
            data: t.var(data)?,
            count: t.var(zero)?,
        })
    }

    pub(super) fn execute(
        &self,
        ctx: &ExecutionContext,
        t: &mut TraceContext<'_>,
        state: &OperatorState,
        record: &mut TracedRecord,
    ) -> TraceResult<Flow> {
        let &OperatorState::Output {
            buffer,
            data,
            count,
        } = state
        else {
            return Err(missing_output());
        };

        let written = t.get(count)?;
        let capacity = t.constant(self.layout.capacity())?;
        let full = t.ge(written, capacity)?;
        if t.branch(full)? {
            let full_buffer = t.get(buffer)?;
            ctx.emit(t, full_buffer, written, false)?;
            let next = ctx.allocate(t)?;
            t.set(buffer, next)?;
            let next_data = ctx.buffer_data(t, next)?;
            t.set(data, next_data)?;
            let zero = t.constant(0u64)?;
            t.set(count, zero)?;
        }

        let index = t.get(count)?;
        let base = t.get(data)?;
        for (i, field) in self.layout.schema().fields().iter().enumerate() {
            let value = record.get(&field.name)?;
            let value = t.frame(i as u32, |t| t.cast(value, field.ty))?;
            t.frame(i as u32, |t| store_field(t, &self.layout, base, index, i, value))?;
        }
        let one = t.constant(1u64)?;
        let next = t.add(index, one)?;
        t.set(count, next)?;
        Ok(Flow::Continue)
    }

    pub(super) fn close(&self, ctx: &ExecutionContext, t: &mut TraceContext<'_>, state: &OperatorState) -> TraceResult<()> {
        let &OperatorState::Output { buffer, count, .. } = state else {
            return Err(missing_output());
        };
        let buffer = t.get(buffer)?;
        let written = t.get(count)?;
        ctx.emit(t, buffer, written, true)
    }
}

fn missing_output() -> TraceError {
    TraceError::UndefinedValue {
        value: "output buffer".to_owned(),
    }
}
