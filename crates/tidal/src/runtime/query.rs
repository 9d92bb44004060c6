use super::{FillStatus, RuntimeError, Sink, Source};
use crate::{
    backend::Executable,
    memory::{BufferManager, MemoryLayout, SequenceData, TupleBuffer},
    pipeline::{
        Dispatch, ExecutionResult, OperatorHandler, PipelineError, PipelineExecutionContext,
        PipelinedQueryPlan, StateManager, WorkerContext,
    },
    windowing::SliceState,
};
use crossbeam::channel::{SendTimeoutError, Sender};
use std::{
    mem, ptr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tidal_types::{
    config::{EngineConfig, SliceStoreConfig},
    error::ErrorResponse,
    query::{OriginId, PipelineId, QueryId, QueryStatistics, QueryStatus, QueryTerminationType},
};
use tracing::{debug, info, trace, warn};

/// How often a source blocked on a full admission queue checks whether it
/// was asked to stop.
const ADMISSION_POLL: Duration = Duration::from_millis(50);

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A source with the index and input layout of the pipeline it feeds.
type RoutedSource = (OriginId, usize, MemoryLayout, Box<dyn Source>);

/// One buffer to run through one pipeline of a query.
pub(super) struct Task {
    pub query: Arc<RunningQuery>,
    pub pipeline: usize,
    pub buffer: TupleBuffer,
}

/// The sending ends of the engine's task queues.
#[derive(Clone)]
pub(super) struct Queues {
    /// Buffers produced inside a query, never blocks.
    pub internal: Sender<Task>,
    /// Source buffers, bounded to throttle sources.
    pub admission: Sender<Task>,
}

/// Routes buffers emitted by the pipelines of one query.
struct QueryDispatch {
    query: Weak<RunningQuery>,
}

impl Dispatch for QueryDispatch {
    fn dispatch(&self, pipeline: PipelineId, buffer: TupleBuffer) -> Result<(), PipelineError> {
        let query = self.query.upgrade().ok_or_else(|| PipelineError::Dispatch {
            message: format!("the query of {pipeline} was dropped"),
        })?;
        query.route(pipeline, buffer)
    }
}

/// A registered query and everything needed to run it.
pub(super) struct RunningQuery {
    id: QueryId,
    plan: PipelinedQueryPlan,
    stages: Vec<Arc<dyn Executable>>,
    /// One per pipeline, in plan order.
    contexts: Vec<PipelineExecutionContext>,
    buffers: Arc<BufferManager>,
    queues: Queues,
    workers: usize,
    slice_store: SliceStoreConfig,
    acquire_timeout: Duration,
    state: OnceLock<StateManager>,

    sink: Mutex<Box<dyn Sink>>,
    sink_open: AtomicBool,
    sources: Mutex<Vec<(OriginId, Box<dyn Source>)>>,
    source_threads: Mutex<Vec<JoinHandle<()>>>,
    running_sources: AtomicUsize,

    status: Mutex<QueryStatus>,
    status_changed: Condvar,
    /// Tasks queued or executing.
    pending: Mutex<usize>,
    idle: Condvar,
    stop_sources: AtomicBool,
    /// Set once the query stops for any reason but a graceful one, tasks
    /// are dropped unprocessed from then on.
    discarding: AtomicBool,
    /// Set by whoever tears the query down.
    terminating: AtomicBool,
    failure: Mutex<Option<String>>,

    processed_buffers: AtomicU64,
    processed_tuples: AtomicU64,
    emitted_buffers: AtomicU64,
}

impl RunningQuery {
    pub(super) fn new(
        plan: PipelinedQueryPlan,
        stages: Vec<Arc<dyn Executable>>,
        sources: Vec<(OriginId, Box<dyn Source>)>,
        sink: Box<dyn Sink>,
        buffers: Arc<BufferManager>,
        queues: Queues,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|query: &Weak<Self>| {
            let handlers: Arc<[Arc<dyn OperatorHandler>]> = plan.handlers().to_vec().into();
            let dispatch: Arc<dyn Dispatch> = Arc::new(QueryDispatch {
                query: query.clone(),
            });
            let contexts = plan
                .pipelines()
                .iter()
                .map(|pipeline| {
                    PipelineExecutionContext::new(
                        plan.query_id(),
                        pipeline.id,
                        handlers.clone(),
                        buffers.clone(),
                        config.buffer_pool.acquire_timeout(),
                        dispatch.clone(),
                    )
                })
                .collect();

            Self {
                id: plan.query_id(),
                plan,
                stages,
                contexts,
                buffers,
                queues,
                workers: config.workers.max(1),
                slice_store: config.slice_store.clone(),
                acquire_timeout: config.buffer_pool.acquire_timeout(),
                state: OnceLock::new(),
                sink: Mutex::new(sink),
                sink_open: AtomicBool::new(false),
                sources: Mutex::new(sources),
                source_threads: Mutex::new(Vec::new()),
                running_sources: AtomicUsize::new(0),
                status: Mutex::new(QueryStatus::Registered),
                status_changed: Condvar::new(),
                pending: Mutex::new(0),
                idle: Condvar::new(),
                stop_sources: AtomicBool::new(false),
                discarding: AtomicBool::new(false),
                terminating: AtomicBool::new(false),
                failure: Mutex::new(None),
                processed_buffers: AtomicU64::new(0),
                processed_tuples: AtomicU64::new(0),
                emitted_buffers: AtomicU64::new(0),
            }
        })
    }

    pub(super) const fn id(&self) -> QueryId {
        self.id
    }

    pub(super) const fn plan(&self) -> &PipelinedQueryPlan {
        &self.plan
    }

    pub(super) fn state(&self) -> Option<&StateManager> {
        self.state.get()
    }

    pub(super) fn is_discarding(&self) -> bool {
        self.discarding.load(Ordering::Acquire)
    }

    pub(super) fn status(&self) -> QueryStatus {
        lock(&self.status).clone()
    }

    fn set_status(&self, status: QueryStatus) {
        *lock(&self.status) = status;
        self.status_changed.notify_all();
    }

    pub(super) fn statistics(&self) -> QueryStatistics {
        QueryStatistics {
            processed_buffers: self.processed_buffers.load(Ordering::Relaxed),
            processed_tuples: self.processed_tuples.load(Ordering::Relaxed),
            late_tuples: self.plan.handlers().iter().map(|h| h.late_tuples()).sum(),
            emitted_buffers: self.emitted_buffers.load(Ordering::Relaxed),
        }
    }

    /// `(start, end, state)` of the slices of every handler, in handler
    /// order.
    pub(super) fn slices(&self) -> Vec<Vec<(u64, u64, SliceState)>> {
        self.plan.handlers().iter().map(|h| h.slices()).collect()
    }

    /// Waits until the query reached a terminal status or `timeout`
    /// elapsed, and returns the status at that point.
    pub(super) fn wait_terminal(&self, timeout: Option<Duration>) -> QueryStatus {
        let status = lock(&self.status);
        let status = match timeout {
            None => self
                .status_changed
                .wait_while(status, |status| !status.is_terminal())
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            Some(timeout) => {
                self.status_changed
                    .wait_timeout_while(status, timeout, |status| !status.is_terminal())
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0
            }
        };
        status.clone()
    }

    fn index_of(&self, pipeline: PipelineId) -> Result<usize, PipelineError> {
        self.plan
            .pipelines()
            .iter()
            .position(|candidate| candidate.id == pipeline)
            .ok_or_else(|| PipelineError::Dispatch {
                message: format!("{pipeline} is not part of {}", self.id),
            })
    }

    /// The context a handler is set up and stopped with.
    fn owner_context(&self, handler: usize) -> Option<&PipelineExecutionContext> {
        let owner = self.plan.handler_owner(handler)?;
        let index = self.index_of(owner.id).ok()?;
        self.contexts.get(index)
    }

    fn begin_task(&self) {
        *lock(&self.pending) += 1;
    }

    pub(super) fn task_done(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let pending = lock(&self.pending);
        let _idle = self
            .idle
            .wait_while(pending, |pending| *pending > 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }

    fn route(self: &Arc<Self>, pipeline: PipelineId, buffer: TupleBuffer) -> Result<(), PipelineError> {
        if self.is_discarding() {
            return Ok(());
        }
        let index = self.index_of(pipeline)?;
        let successors = &self.plan.pipelines()[index].successors;
        if successors.is_empty() {
            return self.write_to_sink(pipeline, &buffer);
        }
        for &successor in successors {
            let task = Task {
                query: self.clone(),
                pipeline: self.index_of(successor)?,
                buffer: buffer.clone(),
            };
            self.begin_task();
            if self.queues.internal.send(task).is_err() {
                self.task_done();
                return Err(PipelineError::Dispatch {
                    message: "the engine is shutting down".to_owned(),
                });
            }
        }
        Ok(())
    }

    fn write_to_sink(&self, pipeline: PipelineId, buffer: &TupleBuffer) -> Result<(), PipelineError> {
        if buffer.num_tuples() == 0 {
            return Ok(());
        }
        if !lock(&self.sink).write(buffer) {
            return Err(PipelineError::SinkRejected { pipeline });
        }
        self.emitted_buffers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Runs the stage of `pipeline` on `buffer`.
    pub(super) fn execute(
        &self,
        pipeline: usize,
        buffer: &TupleBuffer,
        worker: &mut WorkerContext,
    ) -> Result<(), PipelineError> {
        let (Some(stage), Some(ctx)) = (self.stages.get(pipeline), self.contexts.get(pipeline)) else {
            return Err(PipelineError::Dispatch {
                message: format!("{} has no pipeline {pipeline}", self.id),
            });
        };
        trace!(
            "worker {} runs {} on {} tuples of {}",
            worker.worker_id(),
            ctx.pipeline_id(),
            buffer.num_tuples(),
            buffer.origin_id(),
        );

        worker.begin(buffer);
        // Safety: stages take `[buffer, pipeline context, worker context]`.
        // All three outlive the call and the worker context is exclusive
        // to this thread.
        let code = unsafe {
            stage.invoke(&[
                buffer.handle(),
                ptr::from_ref(ctx) as u64,
                ptr::from_mut(worker) as u64,
            ])
        };
        worker.end();

        self.processed_buffers.fetch_add(1, Ordering::Relaxed);
        self.processed_tuples
            .fetch_add(buffer.num_tuples(), Ordering::Relaxed);
        let status = worker.status();
        if let Some(error) = worker.take_error() {
            if status == ExecutionResult::BufferFull {
                // Outputs emitted before the pool ran dry are already
                // downstream, so the buffer cannot be replayed.
                warn!(
                    "{} of {} ran out of output buffers, {} buffers in the pool",
                    ctx.pipeline_id(),
                    self.id,
                    self.buffers.num_buffers(),
                );
            }
            return Err(error);
        }
        match ExecutionResult::from_code(code) {
            Some(ExecutionResult::Ok) => Ok(()),
            _ => Err(PipelineError::Stage {
                pipeline: ctx.pipeline_id(),
                code,
            }),
        }
    }

    /// Sets up the operator handlers, opens the sink and starts a thread for
    /// every source.
    pub(super) fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let status = self.status();
        if status != QueryStatus::Registered {
            return Err(RuntimeError::InvalidState {
                query: self.id,
                status,
                action: "start".to_owned(),
            });
        }
        let started = Instant::now();
        let sources = match self.prepare() {
            Ok(sources) => sources,
            Err(error) => {
                self.fail(error.clone());
                return Err(error);
            }
        };
        self.set_status(QueryStatus::Running);

        let total = sources.len();
        self.running_sources.store(total, Ordering::Release);
        for (spawned, (origin, pipeline, layout, source)) in sources.into_iter().enumerate() {
            let query = self.clone();
            let result = thread::Builder::new()
                .name(format!("tidal-source-{}-{origin}", self.id))
                .spawn(move || query.run_source(origin, pipeline, layout, source));
            match result {
                Ok(handle) => lock(&self.source_threads).push(handle),
                Err(error) => {
                    // Sources that never ran must not hold up termination
                    self.running_sources
                        .fetch_sub(total - spawned, Ordering::AcqRel);
                    let error = RuntimeError::Spawn {
                        message: error.to_string(),
                    };
                    self.fail(error.clone());
                    return Err(error);
                }
            }
        }
        info!(
            "started {} with {total} sources in {:?}",
            self.id,
            started.elapsed()
        );
        Ok(())
    }

    /// Routes the sources to their pipelines, sets up the handlers and
    /// opens the sink.
    fn prepare(&self) -> Result<Vec<RoutedSource>, RuntimeError> {
        let sources = mem::take(&mut *lock(&self.sources))
            .into_iter()
            .map(|(origin, source)| {
                let (pipeline, layout) = self.source_pipeline(origin)?;
                Ok((origin, pipeline, layout, source))
            })
            .collect::<Result<Vec<_>, RuntimeError>>()?;

        let mut state = StateManager::new(self.workers, self.slice_store.clone());
        for (index, handler) in self.plan.handlers().iter().enumerate() {
            let ctx = self
                .owner_context(index)
                .ok_or(PipelineError::UnknownHandler { handler: index })?;
            handler.setup(ctx, &mut state, index)?;
        }
        // Only `start` sets the state, and only once
        let _ = self.state.set(state);

        if let Some(layout) = self.plan.sink_pipeline().and_then(|p| p.output_layout()) {
            lock(&self.sink).open(layout)?;
            self.sink_open.store(true, Ordering::Release);
        }
        Ok(sources)
    }

    fn source_pipeline(&self, origin: OriginId) -> Result<(usize, MemoryLayout), RuntimeError> {
        self.plan
            .source_pipelines()
            .find(|(candidate, _)| *candidate == origin)
            .and_then(|(_, pipeline)| {
                let index = self.index_of(pipeline.id).ok()?;
                Some((index, pipeline.input_layout()?.clone()))
            })
            .ok_or(RuntimeError::UnknownOrigin { origin })
    }

    fn run_source(
        self: Arc<Self>,
        origin: OriginId,
        pipeline: usize,
        layout: MemoryLayout,
        mut source: Box<dyn Source>,
    ) {
        debug!("{}: source {origin} started", self.id);
        if let Err(error) = source.open(&layout) {
            self.fail(error.into());
        }

        let mut sequence = 0;
        while !self.stop_sources.load(Ordering::Acquire) {
            let buffer = match self.buffers.get_buffer_timeout(self.acquire_timeout) {
                Ok(buffer) => buffer,
                Err(error) => {
                    debug!("{}: source {origin} waits for a buffer: {error}", self.id);
                    continue;
                }
            };
            match source.fill(&buffer, &layout) {
                Ok(FillStatus::Filled) => {}
                Ok(FillStatus::Idle) => continue,
                Ok(FillStatus::Exhausted) => {
                    debug!("{}: source {origin} is exhausted after {sequence} buffers", self.id);
                    break;
                }
                Err(error) => {
                    self.fail(error.into());
                    break;
                }
            }
            sequence += 1;
            buffer.set_origin_id(origin);
            buffer.set_sequence_data(SequenceData::single(sequence));
            if let Err(error) = self.admit(pipeline, buffer) {
                self.fail(error);
                break;
            }
        }

        source.close();
        self.source_finished();
    }

    /// Queues a source buffer, blocking while the admission queue is full.
    fn admit(self: &Arc<Self>, pipeline: usize, buffer: TupleBuffer) -> Result<(), RuntimeError> {
        let mut task = Task {
            query: self.clone(),
            pipeline,
            buffer,
        };
        self.begin_task();
        loop {
            match self.queues.admission.send_timeout(task, ADMISSION_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.stop_sources.load(Ordering::Acquire) {
                        drop(returned);
                        self.task_done();
                        return Ok(());
                    }
                    task = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.task_done();
                    return Err(RuntimeError::ShuttingDown);
                }
            }
        }
    }

    /// The last source to finish stops the query gracefully, unless someone
    /// else already stops it.
    fn source_finished(&self) {
        if self.running_sources.fetch_sub(1, Ordering::AcqRel) != 1
            || self.stop_sources.load(Ordering::Acquire)
        {
            return;
        }
        info!("{}: all sources are exhausted", self.id);
        if !self.terminating.swap(true, Ordering::AcqRel) {
            self.drain();
            self.teardown(QueryTerminationType::Graceful);
        }
    }

    fn join_sources(&self) {
        let threads = mem::take(&mut *lock(&self.source_threads));
        for handle in threads {
            if handle.join().is_err() {
                warn!("{}: a source thread panicked", self.id);
            }
        }
    }

    /// Stops the query from a thread that is neither a worker nor a source
    /// and waits for it to reach a terminal status.
    pub(super) fn stop(&self, termination: QueryTerminationType) -> QueryStatus {
        self.stop_sources.store(true, Ordering::Release);
        if termination != QueryTerminationType::Graceful {
            self.discarding.store(true, Ordering::Release);
        }
        self.join_sources();
        if !self.terminating.swap(true, Ordering::AcqRel) {
            match termination {
                QueryTerminationType::Graceful => self.drain(),
                QueryTerminationType::HardStop | QueryTerminationType::Failure => self.wait_idle(),
            }
            self.teardown(termination);
        }
        self.wait_terminal(None)
    }

    /// Finishes all queued work, then flushes the handlers upstream first so
    /// every flushed window reaches the handlers downstream of it.
    fn drain(&self) {
        self.wait_idle();
        for (index, handler) in self.plan.handlers().iter().enumerate() {
            if self.is_discarding() {
                return;
            }
            let Some(ctx) = self.owner_context(index) else {
                continue;
            };
            if let Err(error) = handler.stop(QueryTerminationType::Graceful, ctx) {
                let response = ErrorResponse::from_error(&RuntimeError::from(error));
                self.record_failure(response.message);
                return;
            }
            self.wait_idle();
        }
    }

    /// Stops whatever handlers are left, closes the sink and publishes the
    /// terminal status. A recorded failure overrides `requested`.
    fn teardown(&self, requested: QueryTerminationType) {
        let failure = lock(&self.failure).clone();
        let termination = if failure.is_some() {
            QueryTerminationType::Failure
        } else {
            requested
        };

        for (index, handler) in self.plan.handlers().iter().enumerate() {
            let Some(ctx) = self.owner_context(index) else {
                continue;
            };
            if let Err(error) = handler.stop(termination, ctx) {
                warn!("{}: stopping handler {index} failed: {error}", self.id);
            }
        }
        if self.sink_open.swap(false, Ordering::AcqRel) {
            lock(&self.sink).close();
        }

        let status = match (termination, failure) {
            (_, Some(message)) => QueryStatus::Failed(message),
            (QueryTerminationType::Failure, None) => QueryStatus::Failed("terminated on request".to_owned()),
            _ => QueryStatus::Stopped,
        };
        info!("{} {status} ({termination:?})", self.id);
        self.set_status(status);
    }

    fn record_failure(&self, message: String) {
        lock(&self.failure).get_or_insert(message);
        self.discarding.store(true, Ordering::Release);
        self.stop_sources.store(true, Ordering::Release);
    }

    /// Fails the query. Safe to call from workers and sources: it never
    /// waits for other tasks.
    pub(super) fn fail(&self, error: RuntimeError) {
        let response = ErrorResponse::from_error(&error);
        self.record_failure(response.message);
        if !self.terminating.swap(true, Ordering::AcqRel) {
            self.teardown(QueryTerminationType::Failure);
        }
    }
}
