use crate::{
    pipeline::ProxyIds,
    trace::{TraceContext, TraceError, TraceResult, Val},
    types::Type,
};
use indexmap::IndexMap;

/// Frames below this value belong to operator code.
const HELPER_FRAME: u32 = u32::MAX - 8;

/// A constant tagged with the caller's location and a helper frame, for
/// helpers that record more than one operation.
#[track_caller]
fn helper_constant(t: &mut TraceContext<'_>, frame: u32, value: u64) -> TraceResult<Val> {
    t.push_frame(HELPER_FRAME + frame);
    let result = t.constant(value);
    t.pop_frame();
    result
}

/// The arguments of a traced stage and the proxies operators call.
///
/// Every helper is `#[track_caller]` so that the operations it records are
/// tagged with the operator code calling it, not with the helper. Calling a
/// helper twice from the same line needs a frame around each call.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    buffer: Val,
    pipeline: Val,
    worker: Val,
    proxies: ProxyIds,
}

impl ExecutionContext {
    /// Types of the stage's parameters: the input buffer handle, the
    /// pipeline execution context and the worker context.
    pub const PARAMS: [Type; 3] = [Type::U64, Type::Ptr, Type::Ptr];

    pub fn new(t: &TraceContext<'_>, proxies: ProxyIds) -> Self {
        Self {
            buffer: t.arg(0),
            pipeline: t.arg(1),
            worker: t.arg(2),
            proxies,
        }
    }

    pub const fn buffer(&self) -> Val {
        self.buffer
    }

    pub const fn proxies(&self) -> &ProxyIds {
        &self.proxies
    }

    #[track_caller]
    pub fn buffer_data(&self, t: &mut TraceContext<'_>, buffer: Val) -> TraceResult<Val> {
        t.call_value(self.proxies.buffer_data, &[buffer], Type::Ptr)
    }

    #[track_caller]
    pub fn num_tuples(&self, t: &mut TraceContext<'_>, buffer: Val) -> TraceResult<Val> {
        t.call_value(self.proxies.buffer_num_tuples, &[buffer], Type::U64)
    }

    #[track_caller]
    pub fn creation_ts(&self, t: &mut TraceContext<'_>) -> TraceResult<Val> {
        t.call_value(self.proxies.buffer_creation_ts, &[self.buffer], Type::U64)
    }

    /// A new output buffer, returns its handle.
    #[track_caller]
    pub fn allocate(&self, t: &mut TraceContext<'_>) -> TraceResult<Val> {
        t.call_value(
            self.proxies.emit_allocate,
            &[self.pipeline, self.worker],
            Type::Ptr,
        )
    }

    #[track_caller]
    pub fn emit(&self, t: &mut TraceContext<'_>, buffer: Val, num_tuples: Val, last: bool) -> TraceResult<()> {
        let last = helper_constant(t, 0, u64::from(last))?;
        t.call(
            self.proxies.emit_buffer,
            &[self.pipeline, self.worker, buffer, num_tuples, last],
            None,
        )?;
        Ok(())
    }

    #[track_caller]
    pub fn set_watermark(&self, t: &mut TraceContext<'_>, watermark: Val) -> TraceResult<()> {
        t.call(self.proxies.set_watermark, &[self.worker, watermark], None)?;
        Ok(())
    }

    #[track_caller]
    pub fn scratch(&self, t: &mut TraceContext<'_>, handler: usize) -> TraceResult<Val> {
        let handler = helper_constant(t, 0, handler as u64)?;
        t.call_value(self.proxies.scratch, &[self.worker, handler], Type::Ptr)
    }

    #[track_caller]
    pub fn find_or_insert(&self, t: &mut TraceContext<'_>, handler: usize, ts: Val, key: Val) -> TraceResult<Val> {
        let handler = helper_constant(t, 0, handler as u64)?;
        t.call_value(
            self.proxies.window_find_or_insert,
            &[self.pipeline, self.worker, handler, ts, key],
            Type::Ptr,
        )
    }

    #[track_caller]
    pub fn join_insert(
        &self,
        t: &mut TraceContext<'_>,
        handler: usize,
        side: usize,
        ts: Val,
        key: Val,
    ) -> TraceResult<Val> {
        let handler = helper_constant(t, 0, handler as u64)?;
        let side = helper_constant(t, 1, side as u64)?;
        t.call_value(
            self.proxies.window_join_insert,
            &[self.pipeline, self.worker, handler, side, ts, key],
            Type::Ptr,
        )
    }

    #[track_caller]
    pub fn trigger(&self, t: &mut TraceContext<'_>, handler: usize) -> TraceResult<()> {
        let handler = helper_constant(t, 0, handler as u64)?;
        t.call(
            self.proxies.window_trigger,
            &[self.pipeline, self.worker, handler],
            None,
        )?;
        Ok(())
    }

    /// `base + offset` for a constant offset.
    #[track_caller]
    pub fn offset(&self, t: &mut TraceContext<'_>, base: Val, offset: usize) -> TraceResult<Val> {
        if offset == 0 {
            return Ok(base);
        }
        let offset = helper_constant(t, 0, offset as u64)?;
        t.ptr_add(base, offset)
    }
}

/// The traced fields of the record flowing through a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TracedRecord {
    fields: IndexMap<String, Val>,
}

impl TracedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> TraceResult<Val> {
        self.fields
            .get(name)
            .copied()
            .ok_or_else(|| TraceError::UndefinedValue {
                value: format!("field '{name}'"),
            })
    }

    /// Sets `name`, keeping its position if it exists.
    pub fn set(&mut self, name: impl Into<String>, value: Val) {
        self.fields.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Val)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), *value))
    }
}
