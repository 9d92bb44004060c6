use super::{ExecutionResult, OperatorHandler, PipelineError, StateManager};
use crate::{
    memory::{BufferManager, MemoryError, SequenceData, TupleBuffer},
    windowing::{Slice, SlicePin, SliceStore},
};
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::{Arc, Mutex},
    time::Duration,
};
use tidal_types::query::{OriginId, PipelineId, QueryId};

/// Routes the buffers a pipeline produces.
pub trait Dispatch: Send + Sync {
    /// Hands `buffer`, produced by `pipeline`, to the pipeline's successors
    /// or to the sink if it has none. Must not block.
    fn dispatch(&self, pipeline: PipelineId, buffer: TupleBuffer) -> Result<(), PipelineError>;
}

/// Output chunks produced so far for one input sequence number.
#[derive(Debug, Default)]
struct SequenceState {
    chunks: u64,
    finished_inputs: u64,
    input_chunks: Option<u64>,
}

/// State shared by every worker executing one pipeline.
///
/// Compiled code receives a pointer to it and passes it on to proxies,
/// which use it to reach the query's operator handlers, allocate output
/// buffers and dispatch them.
pub struct PipelineExecutionContext {
    query: QueryId,
    pipeline: PipelineId,
    handlers: Arc<[Arc<dyn OperatorHandler>]>,
    buffers: Arc<BufferManager>,
    acquire_timeout: Duration,
    dispatch: Arc<dyn Dispatch>,
    sequences: Mutex<HashMap<(OriginId, u64), SequenceState>>,
}

impl PipelineExecutionContext {
    pub fn new(
        query: QueryId,
        pipeline: PipelineId,
        handlers: Arc<[Arc<dyn OperatorHandler>]>,
        buffers: Arc<BufferManager>,
        acquire_timeout: Duration,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            query,
            pipeline,
            handlers,
            buffers,
            acquire_timeout,
            dispatch,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub const fn query_id(&self) -> QueryId {
        self.query
    }

    pub const fn pipeline_id(&self) -> PipelineId {
        self.pipeline
    }

    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn handler(&self, index: usize) -> Result<&Arc<dyn OperatorHandler>, PipelineError> {
        self.handlers
            .get(index)
            .ok_or(PipelineError::UnknownHandler { handler: index })
    }

    /// The handler at `index` if it has type `T`.
    pub fn handler_as<T: OperatorHandler>(&self, index: usize) -> Result<&T, PipelineError> {
        self.handler(index)?
            .as_any()
            .downcast_ref::<T>()
            .ok_or(PipelineError::UnknownHandler { handler: index })
    }

    /// Takes an output buffer from the pool, waiting at most the configured
    /// acquire timeout for one to be released.
    pub fn allocate_buffer(&self) -> Result<TupleBuffer, PipelineError> {
        Ok(self.buffers.get_buffer_timeout(self.acquire_timeout)?)
    }

    pub fn emit(&self, buffer: TupleBuffer) -> Result<(), PipelineError> {
        self.dispatch.dispatch(self.pipeline, buffer)
    }

    /// Sequence data for the next output buffer derived from `input`.
    ///
    /// Outputs keep the sequence number of their input and are numbered as
    /// chunks of it. Several workers may process chunks of the same input
    /// sequence, so the last output chunk is the one emitted when the final
    /// invocation for the sequence ends.
    pub fn next_output_sequence(&self, input: &InputMetadata, finishes_input: bool) -> SequenceData {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = (input.origin, input.sequence.sequence);
        let state = sequences.entry(key).or_default();
        state.chunks += 1;
        let chunk = state.chunks;

        let mut last_chunk = false;
        if finishes_input {
            state.finished_inputs += 1;
            if input.sequence.last_chunk {
                state.input_chunks = Some(input.sequence.chunk);
            }
            if state.input_chunks == Some(state.finished_inputs) {
                last_chunk = true;
                sequences.remove(&key);
            }
        }
        SequenceData::new(input.sequence.sequence, chunk, last_chunk)
    }
}

impl Debug for PipelineExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExecutionContext")
            .field("query", &self.query)
            .field("pipeline", &self.pipeline)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Metadata of the buffer a worker is processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputMetadata {
    pub origin: OriginId,
    pub sequence: SequenceData,
    pub watermark: u64,
    pub creation_ts: u64,
}

impl InputMetadata {
    pub fn of(buffer: &TupleBuffer) -> Self {
        Self {
            origin: buffer.origin_id(),
            sequence: buffer.sequence_data(),
            watermark: buffer.watermark(),
            creation_ts: buffer.creation_ts(),
        }
    }
}

impl Default for InputMetadata {
    fn default() -> Self {
        Self {
            origin: OriginId(0),
            sequence: SequenceData::single(0),
            watermark: 0,
            creation_ts: 0,
        }
    }
}

/// Per worker state of one query, only ever used by the worker's thread.
///
/// Holds what compiled code needs besides the input buffer: the watermark
/// of the current invocation, slice pins and scratch memory of every
/// handler, output buffers that were allocated but not yet emitted, and the
/// first error a proxy ran into.
pub struct WorkerContext {
    worker_id: usize,
    input: InputMetadata,
    watermark: u64,
    pins: Vec<Option<SlicePin>>,
    scratch: Vec<Box<[u64]>>,
    buffers: Vec<TupleBuffer>,
    overflow: Option<TupleBuffer>,
    error: Option<PipelineError>,
}

impl WorkerContext {
    pub fn new(worker_id: usize, state: &StateManager) -> Self {
        Self {
            worker_id,
            input: InputMetadata::default(),
            watermark: 0,
            pins: Vec::new(),
            scratch: state
                .scratch_sizes()
                .iter()
                .map(|&bytes| vec![0u64; bytes.div_ceil(8).max(1)].into_boxed_slice())
                .collect(),
            buffers: Vec::new(),
            overflow: None,
            error: None,
        }
    }

    pub const fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Prepares an invocation on `buffer`.
    pub fn begin(&mut self, buffer: &TupleBuffer) {
        self.input = InputMetadata::of(buffer);
        self.watermark = self.input.watermark;
    }

    /// Releases everything the last invocation held on to.
    pub fn end(&mut self) {
        self.release_pins();
        self.buffers.clear();
    }

    pub const fn input(&self) -> &InputMetadata {
        &self.input
    }

    /// The watermark of the current invocation, the input's watermark unless
    /// a watermark assignment replaced it.
    pub const fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn set_watermark(&mut self, watermark: u64) {
        self.watermark = watermark;
    }

    /// The slice of `store` holding `ts`, pinned until the end of the
    /// invocation. Returns `None` for late tuples.
    pub fn pin(&mut self, handler: usize, store: &SliceStore, ts: u64) -> Option<&Slice> {
        if self.pins.len() <= handler {
            self.pins.resize_with(handler + 1, || None);
        }
        let cached = matches!(&self.pins[handler], Some(pin) if pin.slice().contains(ts));
        if !cached {
            self.pins[handler] = Some(store.pin(ts)?);
        }
        self.pins[handler].as_ref().map(SlicePin::slice)
    }

    pub fn release_pins_of(&mut self, handler: usize) {
        if let Some(pin) = self.pins.get_mut(handler) {
            *pin = None;
        }
    }

    pub fn release_pins(&mut self) {
        self.pins.iter_mut().for_each(|pin| *pin = None);
    }

    /// Scratch memory registered by `handler` during setup, 8 byte aligned.
    pub fn scratch(&mut self, handler: usize) -> Option<*mut u8> {
        self.scratch
            .get_mut(handler)
            .map(|words| words.as_mut_ptr().cast::<u8>())
    }

    /// Keeps `buffer` alive until it is emitted and returns its handle.
    pub fn track_buffer(&mut self, buffer: TupleBuffer) -> u64 {
        let handle = buffer.handle();
        self.buffers.push(buffer);
        handle
    }

    pub fn take_buffer(&mut self, handle: u64) -> Option<TupleBuffer> {
        let index = self
            .buffers
            .iter()
            .position(|buffer| buffer.handle() == handle)?;
        Some(self.buffers.swap_remove(index))
    }

    /// Handle of a worker-private buffer of `size` bytes that compiled code
    /// writes into once no output buffer could be allocated. Its contents
    /// are never emitted.
    pub fn overflow_buffer(&mut self, size: usize) -> u64 {
        self.overflow
            .get_or_insert_with(|| TupleBuffer::unpooled(size))
            .handle()
    }

    pub fn is_overflow_buffer(&self, handle: u64) -> bool {
        self.overflow
            .as_ref()
            .is_some_and(|buffer| buffer.handle() == handle)
    }

    /// Records `error` unless an earlier one is pending.
    pub fn fail(&mut self, error: PipelineError) {
        self.error.get_or_insert(error);
    }

    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn take_error(&mut self) -> Option<PipelineError> {
        self.error.take()
    }

    /// Outcome of the current invocation as far as proxies reported it.
    pub fn status(&self) -> ExecutionResult {
        match &self.error {
            None => ExecutionResult::Ok,
            Some(PipelineError::Memory(MemoryError::OutOfBuffers { .. })) => ExecutionResult::BufferFull,
            Some(_) => ExecutionResult::Error,
        }
    }
}

impl Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker_id", &self.worker_id)
            .field("input", &self.input)
            .field("watermark", &self.watermark)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};

    fn input(origin: u64, sequence: SequenceData) -> InputMetadata {
        InputMetadata {
            origin: OriginId(origin),
            sequence,
            ..InputMetadata::default()
        }
    }

    #[test]
    fn single_input_chunk() {
        let ctx = context(Vec::new(), Arc::default(), 64);
        let input = input(1, SequenceData::single(5));
        assert_eq!(
            ctx.next_output_sequence(&input, false),
            SequenceData::new(5, 1, false)
        );
        assert_eq!(
            ctx.next_output_sequence(&input, true),
            SequenceData::new(5, 2, true)
        );
    }

    #[test]
    fn chunked_input_finishes_with_its_last_invocation() {
        let ctx = context(Vec::new(), Arc::default(), 64);
        // The last input chunk is processed before the first one
        let second = input(1, SequenceData::new(3, 2, true));
        let first = input(1, SequenceData::new(3, 1, false));
        assert_eq!(
            ctx.next_output_sequence(&second, true),
            SequenceData::new(3, 1, false)
        );
        assert_eq!(
            ctx.next_output_sequence(&first, false),
            SequenceData::new(3, 2, false)
        );
        assert_eq!(
            ctx.next_output_sequence(&first, true),
            SequenceData::new(3, 3, true)
        );
        // Other origins are numbered independently
        assert_eq!(
            ctx.next_output_sequence(&input(2, SequenceData::single(3)), true),
            SequenceData::new(3, 1, true)
        );
    }

    #[test]
    fn worker_tracks_buffers_and_errors() {
        let mut worker = WorkerContext::new(0, &StateManager::new(1, Default::default()));
        let buffer = TupleBuffer::unpooled(16);
        let handle = worker.track_buffer(buffer.clone());
        assert!(worker.take_buffer(handle).unwrap().ptr_eq(&buffer));
        assert!(worker.take_buffer(handle).is_none());

        worker.fail(PipelineError::UnknownBuffer { handle: 1 });
        worker.fail(PipelineError::UnknownBuffer { handle: 2 });
        assert_eq!(
            worker.take_error(),
            Some(PipelineError::UnknownBuffer { handle: 1 })
        );
        assert!(!worker.has_failed());
    }

    #[test]
    fn allocation_is_bounded_by_the_pool() {
        let ctx = context(Vec::new(), Arc::default(), 64);
        let held: Vec<_> = (0..4).map(|_| ctx.allocate_buffer().unwrap()).collect();
        assert_eq!(
            ctx.allocate_buffer().unwrap_err(),
            PipelineError::Memory(MemoryError::OutOfBuffers {
                waited: Duration::from_millis(10)
            })
        );
        assert_eq!(ctx.buffer_manager().available_buffers(), 0);

        drop(held);
        assert!(ctx.allocate_buffer().is_ok());
    }

    #[test]
    fn exhausted_pool_reports_buffer_full() {
        let mut worker = WorkerContext::new(0, &StateManager::new(1, Default::default()));
        assert_eq!(worker.status(), ExecutionResult::Ok);

        let overflow = worker.overflow_buffer(64);
        assert_eq!(worker.overflow_buffer(64), overflow);
        assert!(worker.is_overflow_buffer(overflow));
        assert!(worker.take_buffer(overflow).is_none());

        worker.fail(PipelineError::Memory(MemoryError::OutOfBuffers {
            waited: Duration::from_millis(10),
        }));
        assert_eq!(worker.status(), ExecutionResult::BufferFull);
        worker.take_error();
        worker.fail(PipelineError::UnknownHandler { handler: 2 });
        assert_eq!(worker.status(), ExecutionResult::Error);
    }
}
