//! Engine functions called by compiled stages.
//!
//! Stages receive three pointers: the handle of the input buffer, the
//! [`PipelineExecutionContext`] and the [`WorkerContext`] of the calling
//! worker. Proxies never unwind into compiled code, failures are recorded in
//! the worker context and picked up by the runtime once the stage returns.

use super::{PipelineError, PipelineExecutionContext, WorkerContext};
use crate::{
    backend::{ProxyPtr, ProxyRegistry},
    ir::ProxyId,
    memory::TupleBuffer,
    types::Type,
    windowing::{AggregationHandler, JoinHandler},
};
use std::ptr;
use tracing::trace;

/// Ids of the builtin proxies within the registry they were registered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyIds {
    pub buffer_data: ProxyId,
    pub buffer_num_tuples: ProxyId,
    pub buffer_creation_ts: ProxyId,
    pub emit_allocate: ProxyId,
    pub emit_buffer: ProxyId,
    pub set_watermark: ProxyId,
    pub scratch: ProxyId,
    pub window_find_or_insert: ProxyId,
    pub window_join_insert: ProxyId,
    pub window_trigger: ProxyId,
}

/// Registers every builtin proxy into a new registry.
pub fn builtin_proxies() -> (ProxyRegistry, ProxyIds) {
    let mut registry = ProxyRegistry::new();
    let ids = ProxyIds {
        buffer_data: registry.register(
            "tidal_buffer_data",
            ProxyPtr::A1(tidal_buffer_data),
            Some(Type::Ptr),
        ),
        buffer_num_tuples: registry.register(
            "tidal_buffer_num_tuples",
            ProxyPtr::A1(tidal_buffer_num_tuples),
            Some(Type::U64),
        ),
        buffer_creation_ts: registry.register(
            "tidal_buffer_creation_ts",
            ProxyPtr::A1(tidal_buffer_creation_ts),
            Some(Type::U64),
        ),
        emit_allocate: registry.register(
            "tidal_emit_allocate",
            ProxyPtr::A2(tidal_emit_allocate),
            Some(Type::Ptr),
        ),
        emit_buffer: registry.register(
            "tidal_emit_buffer",
            ProxyPtr::A5(tidal_emit_buffer),
            None,
        ),
        set_watermark: registry.register(
            "tidal_set_watermark",
            ProxyPtr::A2(tidal_set_watermark),
            None,
        ),
        scratch: registry.register("tidal_scratch", ProxyPtr::A2(tidal_scratch), Some(Type::Ptr)),
        window_find_or_insert: registry.register(
            "tidal_window_find_or_insert",
            ProxyPtr::A5(tidal_window_find_or_insert),
            Some(Type::Ptr),
        ),
        window_join_insert: registry.register(
            "tidal_window_join_insert",
            ProxyPtr::A6(tidal_window_join_insert),
            Some(Type::Ptr),
        ),
        window_trigger: registry.register(
            "tidal_window_trigger",
            ProxyPtr::A3(tidal_window_trigger),
            None,
        ),
    };
    (registry, ids)
}

/// # Safety
///
/// Both pointers must come from the runtime invoking the current stage.
unsafe fn contexts<'a>(
    pctx: u64,
    wctx: u64,
) -> (&'a PipelineExecutionContext, &'a mut WorkerContext) {
    (
        &*(pctx as *const PipelineExecutionContext),
        &mut *(wctx as *mut WorkerContext),
    )
}

/// The value half of a handler's scratch memory, where updates of late
/// tuples are written to and forgotten.
unsafe fn discard(worker: &mut WorkerContext, handler: usize, key_size: usize) -> u64 {
    match worker.scratch(handler) {
        Some(scratch) => scratch.add(key_size.div_ceil(8) * 8) as u64,
        None => {
            worker.fail(PipelineError::HandlerNotReady { handler });
            ptr::null_mut::<u8>() as u64
        }
    }
}

unsafe extern "C" fn tidal_buffer_data(buffer: u64) -> u64 {
    TupleBuffer::with_handle(buffer, |buffer| buffer.as_ptr() as u64)
}

unsafe extern "C" fn tidal_buffer_num_tuples(buffer: u64) -> u64 {
    TupleBuffer::with_handle(buffer, TupleBuffer::num_tuples)
}

unsafe extern "C" fn tidal_buffer_creation_ts(buffer: u64) -> u64 {
    TupleBuffer::with_handle(buffer, TupleBuffer::creation_ts)
}

/// Allocates an output buffer owned by the worker until it is emitted.
///
/// Once the pool stays empty for the acquire timeout the invocation fails
/// with `OutOfBuffers` and the remaining output goes to the worker's
/// overflow buffer.
unsafe extern "C" fn tidal_emit_allocate(pctx: u64, wctx: u64) -> u64 {
    let (pctx, worker) = contexts(pctx, wctx);
    let size = pctx.buffer_manager().buffer_size();
    if worker.has_failed() {
        return worker.overflow_buffer(size);
    }
    match pctx.allocate_buffer() {
        Ok(buffer) => worker.track_buffer(buffer),
        Err(error) => {
            worker.fail(error);
            worker.overflow_buffer(size)
        }
    }
}

/// Stamps an output buffer with the input's metadata and dispatches it.
/// `last` marks the final output of the invocation.
unsafe extern "C" fn tidal_emit_buffer(
    pctx: u64,
    wctx: u64,
    buffer: u64,
    num_tuples: u64,
    last: u64,
) -> u64 {
    let (pctx, worker) = contexts(pctx, wctx);
    if worker.is_overflow_buffer(buffer) {
        return 0;
    }
    let Some(output) = worker.take_buffer(buffer) else {
        worker.fail(PipelineError::UnknownBuffer { handle: buffer });
        return 0;
    };

    let input = *worker.input();
    output.set_num_tuples(num_tuples);
    output.set_origin_id(input.origin);
    output.set_sequence_data(pctx.next_output_sequence(&input, last != 0));
    output.set_watermark(worker.watermark());
    output.set_creation_ts(input.creation_ts);
    trace!(
        "{} emits {num_tuples} tuples as {:?}",
        pctx.pipeline_id(),
        output.sequence_data(),
    );
    if let Err(error) = pctx.emit(output) {
        worker.fail(error);
    }
    0
}

unsafe extern "C" fn tidal_set_watermark(wctx: u64, watermark: u64) -> u64 {
    (*(wctx as *mut WorkerContext)).set_watermark(watermark);
    0
}

/// Scratch memory of a handler: the key region followed by the value region.
unsafe extern "C" fn tidal_scratch(wctx: u64, handler: u64) -> u64 {
    let worker = &mut *(wctx as *mut WorkerContext);
    let handler = handler as usize;
    match worker.scratch(handler) {
        Some(scratch) => scratch as u64,
        None => {
            worker.fail(PipelineError::HandlerNotReady { handler });
            ptr::null_mut::<u8>() as u64
        }
    }
}

/// The aggregation state of `key` in the slice holding `ts`.
unsafe extern "C" fn tidal_window_find_or_insert(
    pctx: u64,
    wctx: u64,
    handler: u64,
    ts: u64,
    key: u64,
) -> u64 {
    let (pctx, worker) = contexts(pctx, wctx);
    let handler = handler as usize;
    match pctx.handler_as::<AggregationHandler>(handler) {
        Ok(aggregation) => match aggregation.find_or_insert(worker, handler, ts, key as *const u8) {
            Ok(Some(state)) => state as u64,
            Ok(None) => discard(worker, handler, aggregation.key_size()),
            Err(error) => {
                worker.fail(error);
                discard(worker, handler, aggregation.key_size())
            }
        },
        Err(error) => {
            worker.fail(error);
            discard(worker, handler, 0)
        }
    }
}

/// A new entry for `key` on `side` of a join, the caller writes the record
/// into it.
unsafe extern "C" fn tidal_window_join_insert(
    pctx: u64,
    wctx: u64,
    handler: u64,
    side: u64,
    ts: u64,
    key: u64,
) -> u64 {
    let (pctx, worker) = contexts(pctx, wctx);
    let handler = handler as usize;
    match pctx.handler_as::<JoinHandler>(handler) {
        Ok(join) => match join.insert(worker, handler, side as usize, ts, key as *const u8) {
            Ok(Some(entry)) => entry as u64,
            Ok(None) => discard(worker, handler, join.key_size()),
            Err(error) => {
                worker.fail(error);
                discard(worker, handler, join.key_size())
            }
        },
        Err(error) => {
            worker.fail(error);
            discard(worker, handler, 0)
        }
    }
}

/// Ends a build invocation: releases the worker's slices, applies the
/// watermark and emits the windows it finalizes.
unsafe extern "C" fn tidal_window_trigger(pctx: u64, wctx: u64, handler: u64) -> u64 {
    let (pctx, worker) = contexts(pctx, wctx);
    let result = pctx
        .handler(handler as usize)
        .and_then(|window| window.trigger(pctx, worker));
    if let Err(error) = result {
        worker.fail(error);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryError,
        pipeline::{context::testing::*, ExecutionResult, StateManager},
    };
    use std::sync::Arc;
    use tidal_types::{config::SliceStoreConfig, query::OriginId};

    #[test]
    fn registry_names() {
        let (registry, ids) = builtin_proxies();
        assert_eq!(registry.len(), 10);
        assert_eq!(registry.lookup("tidal_window_trigger"), Some(ids.window_trigger));
        assert_eq!(registry.get(ids.emit_buffer).unwrap().ptr.arity(), 5);
    }

    #[test]
    fn emitted_buffers_carry_input_metadata() {
        let dispatch = Arc::new(CollectingDispatch::default());
        let ctx = context(Vec::new(), dispatch.clone(), 64);
        let mut worker = WorkerContext::new(0, &StateManager::new(1, SliceStoreConfig::default()));

        let input = TupleBuffer::unpooled(64);
        input.set_origin_id(OriginId(4));
        input.set_sequence_number(7);
        input.set_watermark(100);
        input.set_creation_ts(55);
        worker.begin(&input);
        worker.set_watermark(120);

        let pctx = &ctx as *const PipelineExecutionContext as u64;
        let wctx = &mut worker as *mut WorkerContext as u64;
        unsafe {
            let first = tidal_emit_allocate(pctx, wctx);
            let second = tidal_emit_allocate(pctx, wctx);
            assert_eq!(
                tidal_buffer_data(first),
                TupleBuffer::with_handle(first, |buffer| buffer.as_ptr() as u64)
            );
            tidal_emit_buffer(pctx, wctx, first, 3, 0);
            tidal_emit_buffer(pctx, wctx, second, 0, 1);
            // Emitting twice is an error
            tidal_emit_buffer(pctx, wctx, second, 0, 1);
        }

        let emitted = dispatch.take();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].num_tuples(), 3);
        assert_eq!(emitted[0].origin_id(), OriginId(4));
        assert_eq!(emitted[0].watermark(), 120);
        assert_eq!(emitted[0].creation_ts(), 55);
        assert_eq!(
            (emitted[0].sequence_number(), emitted[0].chunk_number(), emitted[0].is_last_chunk()),
            (7, 1, false)
        );
        assert_eq!(
            (emitted[1].sequence_number(), emitted[1].chunk_number(), emitted[1].is_last_chunk()),
            (7, 2, true)
        );
        assert!(matches!(
            worker.take_error(),
            Some(PipelineError::UnknownBuffer { .. })
        ));
    }

    #[test]
    fn exhausted_pool_diverts_output_to_the_overflow_buffer() {
        let dispatch = Arc::new(CollectingDispatch::default());
        let ctx = context(Vec::new(), dispatch.clone(), 64);
        let mut worker = WorkerContext::new(0, &StateManager::new(1, SliceStoreConfig::default()));
        worker.begin(&TupleBuffer::unpooled(64));
        let held: Vec<_> = (0..4).map(|_| ctx.allocate_buffer().unwrap()).collect();

        let pctx = &ctx as *const PipelineExecutionContext as u64;
        let wctx = &mut worker as *mut WorkerContext as u64;
        let (first, second) = unsafe {
            let first = tidal_emit_allocate(pctx, wctx);
            let second = tidal_emit_allocate(pctx, wctx);
            assert_ne!(tidal_buffer_data(first), 0);
            tidal_emit_buffer(pctx, wctx, first, 2, 0);
            tidal_emit_buffer(pctx, wctx, second, 0, 1);
            (first, second)
        };
        assert_eq!(first, second);
        assert!(dispatch.take().is_empty());
        assert_eq!(worker.status(), ExecutionResult::BufferFull);
        assert!(matches!(
            worker.take_error(),
            Some(PipelineError::Memory(MemoryError::OutOfBuffers { .. }))
        ));
        assert_eq!(held.len(), ctx.buffer_manager().num_buffers());
    }

    #[test]
    fn unknown_handlers_fail_the_worker() {
        let ctx = context(Vec::new(), Arc::default(), 64);
        let mut state = StateManager::new(1, SliceStoreConfig::default());
        state.register_scratch(0, 16);
        let mut worker = WorkerContext::new(0, &state);
        let pctx = &ctx as *const PipelineExecutionContext as u64;
        let wctx = &mut worker as *mut WorkerContext as u64;

        let scratch = unsafe { tidal_scratch(wctx, 0) };
        let slot = unsafe { tidal_window_find_or_insert(pctx, wctx, 0, 10, scratch) };
        assert_eq!(slot, scratch);
        assert_eq!(
            worker.take_error(),
            Some(PipelineError::UnknownHandler { handler: 0 })
        );

        unsafe { tidal_window_trigger(pctx, wctx, 3) };
        assert_eq!(
            worker.take_error(),
            Some(PipelineError::UnknownHandler { handler: 3 })
        );
    }
}
