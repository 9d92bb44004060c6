use super::{
    query::{lock, Queues, RunningQuery, Task},
    RuntimeError, Sink, Source,
};
use crate::{
    backend::{CacheStats, CompilationCache, ProxyRegistry},
    memory::BufferManager,
    pipeline::{
        builtin_proxies, compile_pipeline, PhysicalOperatorNode, PipelinedQueryPlan, PlanError,
        PlanOptions, ProxyIds, WorkerContext,
    },
    windowing::SliceState,
};
use crossbeam::channel::{self, select, Receiver, Sender};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tidal_types::{
    config::EngineConfig,
    query::{OriginId, QueryId, QueryStatistics, QueryStatus, QueryTerminationType},
};
use tracing::{debug, info, warn};

/// Executes pipelined queries on a fixed pool of worker threads.
///
/// Queries are registered with their sources and sink, compiled right away
/// and started separately. Dropping the engine hard-stops every query that
/// is still running.
pub struct NodeEngine {
    config: EngineConfig,
    buffers: Arc<BufferManager>,
    registry: ProxyRegistry,
    proxies: ProxyIds,
    cache: CompilationCache,
    queries: Mutex<BTreeMap<QueryId, Arc<RunningQuery>>>,
    next_query: AtomicU64,
    queues: Option<Queues>,
    /// Dropped to make the workers exit.
    shutdown: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl NodeEngine {
    pub fn new(config: EngineConfig) -> Result<Self, RuntimeError> {
        let num_workers = config.workers.max(1);
        let buffers = Arc::new(BufferManager::from_config(&config.buffer_pool));
        let (registry, proxies) = builtin_proxies();
        let cache = CompilationCache::new(config.compiler.cache_capacity);

        let (internal_tx, internal_rx) = channel::unbounded();
        let (admission_tx, admission_rx) = channel::bounded(config.task_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        let workers = (0..num_workers)
            .map(|worker_id| {
                let receivers = (internal_rx.clone(), admission_rx.clone(), shutdown_rx.clone());
                thread::Builder::new()
                    .name(format!("tidal-worker-{worker_id}"))
                    .spawn(move || run_worker(worker_id, receivers.0, receivers.1, receivers.2))
                    .map_err(|error| RuntimeError::Spawn {
                        message: error.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "started node engine with {num_workers} workers, {} backend",
            config.compiler.backend
        );
        Ok(Self {
            config,
            buffers,
            registry,
            proxies,
            cache,
            queries: Mutex::new(BTreeMap::new()),
            next_query: AtomicU64::new(1),
            queues: Some(Queues {
                internal: internal_tx,
                admission: admission_tx,
            }),
            shutdown: Some(shutdown_tx),
            workers,
        })
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn query(&self, query: QueryId) -> Result<Arc<RunningQuery>, RuntimeError> {
        lock(&self.queries)
            .get(&query)
            .cloned()
            .ok_or(RuntimeError::UnknownQuery { query })
    }

    /// Ids of every registered query, in registration order.
    pub fn queries(&self) -> Vec<QueryId> {
        lock(&self.queries).keys().copied().collect()
    }

    /// Lowers `plan` into pipelines and compiles them. `sources` must hold
    /// exactly one source per origin the plan reads.
    pub fn register(
        &self,
        plan: &PhysicalOperatorNode,
        sources: Vec<(OriginId, Box<dyn Source>)>,
        sink: Box<dyn Sink>,
    ) -> Result<QueryId, RuntimeError> {
        let queues = self.queues.as_ref().ok_or(RuntimeError::ShuttingDown)?;
        let id = QueryId(self.next_query.fetch_add(1, Ordering::Relaxed));
        let started = Instant::now();

        let plan = PipelinedQueryPlan::build(id, plan, &PlanOptions::from_config(&self.config))?;
        check_sources(&plan, &sources)?;
        let stages = plan
            .pipelines()
            .iter()
            .map(|pipeline| {
                compile_pipeline(
                    pipeline,
                    &self.proxies,
                    &self.registry,
                    &self.config.compiler,
                    &self.cache,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!("{plan}");
        info!(
            "registered {id}: {} pipelines compiled in {:?}",
            stages.len(),
            started.elapsed()
        );

        let query = RunningQuery::new(
            plan,
            stages,
            sources,
            sink,
            self.buffers.clone(),
            queues.clone(),
            &self.config,
        );
        lock(&self.queries).insert(id, query);
        Ok(id)
    }

    pub fn start(&self, query: QueryId) -> Result<(), RuntimeError> {
        self.query(query)?.start()
    }

    /// Stops `query` and blocks until it reached a terminal status.
    ///
    /// A graceful stop stops reading the sources, processes every buffer
    /// already read and flushes all open windows. The other termination
    /// types drop whatever is in flight. Stopping a terminated query only
    /// returns its status.
    pub fn stop(
        &self,
        query: QueryId,
        termination: QueryTerminationType,
    ) -> Result<QueryStatus, RuntimeError> {
        let query = self.query(query)?;
        let status = query.status();
        if status.is_terminal() {
            return Ok(status);
        }
        info!("stopping {} ({termination:?})", query.id());
        Ok(query.stop(termination))
    }

    pub fn status(&self, query: QueryId) -> Result<QueryStatus, RuntimeError> {
        Ok(self.query(query)?.status())
    }

    pub fn statistics(&self, query: QueryId) -> Result<QueryStatistics, RuntimeError> {
        Ok(self.query(query)?.statistics())
    }

    /// The slices held by the window handlers of `query`, one list per
    /// handler.
    pub fn slices(&self, query: QueryId) -> Result<Vec<Vec<(u64, u64, SliceState)>>, RuntimeError> {
        Ok(self.query(query)?.slices())
    }

    /// Waits at most `timeout` for `query` to terminate on its own, e.g.
    /// because its sources are exhausted. Returns the status it ended up
    /// in, which is not terminal if the timeout elapsed.
    pub fn wait(&self, query: QueryId, timeout: Duration) -> Result<QueryStatus, RuntimeError> {
        Ok(self.query(query)?.wait_terminal(Some(timeout)))
    }

    /// The pipelines of `query`, one per line.
    pub fn explain(&self, query: QueryId) -> Result<String, RuntimeError> {
        Ok(self.query(query)?.plan().to_string())
    }

    /// Forgets a terminated query.
    pub fn unregister(&self, query: QueryId) -> Result<(), RuntimeError> {
        let mut queries = lock(&self.queries);
        let status = queries
            .get(&query)
            .map(|running| running.status())
            .ok_or(RuntimeError::UnknownQuery { query })?;
        if !status.is_terminal() {
            return Err(RuntimeError::InvalidState {
                query,
                status,
                action: "unregister".to_owned(),
            });
        }
        queries.remove(&query);
        Ok(())
    }

    /// Hard-stops every query that is still running and joins the workers.
    pub fn shutdown(mut self) {
        self.shutdown_workers();
    }

    fn shutdown_workers(&mut self) {
        if self.shutdown.is_none() {
            return;
        }
        let queries: Vec<_> = lock(&self.queries).values().cloned().collect();
        for query in queries {
            if !query.status().is_terminal() {
                query.stop(QueryTerminationType::HardStop);
            }
        }

        self.queues = None;
        self.shutdown = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("a worker thread panicked");
            }
        }
        info!("node engine shut down");
    }
}

impl Drop for NodeEngine {
    fn drop(&mut self) {
        self.shutdown_workers();
    }
}

impl Debug for NodeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEngine")
            .field("workers", &self.workers.len())
            .field("queries", &self.queries())
            .field("buffers", &self.buffers)
            .finish_non_exhaustive()
    }
}

fn check_sources(
    plan: &PipelinedQueryPlan,
    sources: &[(OriginId, Box<dyn Source>)],
) -> Result<(), RuntimeError> {
    let expected: BTreeSet<OriginId> = plan.source_pipelines().map(|(origin, _)| origin).collect();
    let mut seen = BTreeSet::new();
    for &(origin, _) in sources {
        if !expected.contains(&origin) {
            return Err(RuntimeError::UnknownOrigin { origin });
        }
        if !seen.insert(origin) {
            return Err(PlanError::DuplicateOrigin { origin }.into());
        }
    }
    match expected.difference(&seen).next() {
        Some(&origin) => Err(RuntimeError::MissingSource { origin }),
        None => Ok(()),
    }
}

/// Worker contexts are created on a query's first task on this worker.
type WorkerContexts = HashMap<QueryId, (Weak<RunningQuery>, WorkerContext)>;

fn run_worker(
    worker_id: usize,
    internal: Receiver<Task>,
    admission: Receiver<Task>,
    shutdown: Receiver<()>,
) {
    debug!("worker {worker_id} started");
    let mut contexts = WorkerContexts::new();
    loop {
        let task = match internal.try_recv() {
            Ok(task) => task,
            Err(_) => select! {
                recv(internal) -> task => match task {
                    Ok(task) => task,
                    Err(_) => break,
                },
                recv(admission) -> task => match task {
                    Ok(task) => task,
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            },
        };
        process(worker_id, &mut contexts, task);
    }
    debug!("worker {worker_id} exits");
}

fn process(worker_id: usize, contexts: &mut WorkerContexts, task: Task) {
    let Task {
        query,
        pipeline,
        buffer,
    } = task;

    if let (false, Some(state)) = (query.is_discarding(), query.state()) {
        if !contexts.contains_key(&query.id()) {
            // Forget the queries that are gone before adding a new one
            contexts.retain(|_, (running, _)| {
                running
                    .upgrade()
                    .is_some_and(|running| !running.status().is_terminal())
            });
        }
        let (_, worker) = contexts
            .entry(query.id())
            .or_insert_with(|| (Arc::downgrade(&query), WorkerContext::new(worker_id, state)));
        if let Err(error) = query.execute(pipeline, &buffer, worker) {
            query.fail(error.into());
        }
    }

    drop(buffer);
    query.task_done();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{Record, Schema},
        operators::Expression,
        pipeline::AggregationDescriptor,
        runtime::{CollectingSink, ConnectorError, FillStatus, InMemorySource},
        types::Type,
        windowing::{TimeCharacteristic, WindowType},
    };
    use pretty_assertions::assert_eq;
    use tidal_types::config::BackendKind;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn engine(workers: usize) -> NodeEngine {
        crate::init_test_logger();
        let config = EngineConfig::default()
            .with_workers(workers)
            .with_backend(BackendKind::Interpreter)
            .with_buffer_pool(256, 16);
        NodeEngine::new(config).unwrap()
    }

    fn schema() -> Schema {
        Schema::new().with("ts", Type::U64).with("v", Type::I64)
    }

    fn record(ts: u64, v: i64) -> Record {
        Record::new().with("ts", ts).with("v", v)
    }

    fn filter_plan() -> PhysicalOperatorNode {
        PhysicalOperatorNode::source(OriginId(1), schema())
            .selection(Expression::field("v").gt(Expression::constant(0i64)))
            .sink()
    }

    fn sum_plan() -> PhysicalOperatorNode {
        PhysicalOperatorNode::source(OriginId(1), schema())
            .window_aggregation(
                WindowType::Tumbling { size: 1000 },
                TimeCharacteristic::EventTime { field: "ts".into() },
                &[],
                vec![AggregationDescriptor::sum("v", "total")],
            )
            .sink()
    }

    fn source(batches: Vec<(Vec<Record>, u64)>) -> Box<dyn Source> {
        let mut source = InMemorySource::new();
        for (records, watermark) in batches {
            source.push_batch(records, watermark);
        }
        Box::new(source)
    }

    /// Polls `condition` until it holds or the test times out.
    fn eventually(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in {TIMEOUT:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn stateless_query_runs_until_its_source_is_exhausted() {
        let engine = engine(2);
        let sink = CollectingSink::new();
        let batches = (0..10)
            .map(|batch| ((0..5).map(|i| record(batch * 5 + i, i as i64 - 2)).collect(), 0))
            .collect();
        let query = engine
            .register(&filter_plan(), vec![(OriginId(1), source(batches))], Box::new(sink.clone()))
            .unwrap();
        assert_eq!(engine.status(query).unwrap(), QueryStatus::Registered);

        engine.start(query).unwrap();
        assert_eq!(engine.wait(query, TIMEOUT).unwrap(), QueryStatus::Stopped);

        let mut records = sink.records();
        records.sort_by(|a, b| a.get("ts").partial_cmp(&b.get("ts")).unwrap());
        let expected: Vec<_> = (0..10u64)
            .flat_map(|batch| [record(batch * 5 + 3, 1), record(batch * 5 + 4, 2)])
            .collect();
        assert_eq!(records, expected);
        assert!(sink.is_closed());

        let statistics = engine.statistics(query).unwrap();
        assert_eq!(statistics.processed_buffers, 10);
        assert_eq!(statistics.processed_tuples, 50);
        assert_eq!(statistics.emitted_buffers, 10);
    }

    #[test]
    fn graceful_stop_flushes_open_windows() {
        let engine = engine(2);
        let sink = CollectingSink::new();
        let batches = vec![
            (vec![record(10, 1), record(500, 2)], 600),
            (vec![record(1500, 5)], 1600),
        ];
        let query = engine
            .register(&sum_plan(), vec![(OriginId(1), source(batches))], Box::new(sink.clone()))
            .unwrap();
        engine.start(query).unwrap();
        assert_eq!(engine.wait(query, TIMEOUT).unwrap(), QueryStatus::Stopped);

        let mut totals: Vec<_> = sink
            .records()
            .iter()
            .map(|record| (record.get("window_start").copied(), record.get("total").copied()))
            .collect();
        totals.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(
            totals,
            [
                (Some(0u64.into()), Some(3i64.into())),
                (Some(1000u64.into()), Some(5i64.into())),
            ]
        );
    }

    #[test]
    fn hard_stop_discards_open_windows() {
        let engine = engine(1);
        let sink = CollectingSink::new();
        let source = InMemorySource::new()
            .with_batch(vec![record(10, 1), record(500, 2)], 600)
            .with_batch(vec![record(1500, 5)], 1600)
            .hold_open();
        let query = engine
            .register(&sum_plan(), vec![(OriginId(1), Box::new(source))], Box::new(sink.clone()))
            .unwrap();
        engine.start(query).unwrap();

        // The watermark passed the end of [0, 1000) but not of [1000, 2000)
        eventually(|| !sink.records().is_empty());
        assert_eq!(engine.status(query).unwrap(), QueryStatus::Running);
        let open: Vec<_> = engine.slices(query).unwrap()[0]
            .iter()
            .filter(|(_, _, state)| *state == SliceState::Open)
            .map(|&(start, end, _)| (start, end))
            .collect();
        assert_eq!(open, [(1000, 2000)]);
        assert_eq!(
            engine.stop(query, QueryTerminationType::HardStop).unwrap(),
            QueryStatus::Stopped
        );
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("total"), Some(&3i64.into()));
        assert!(sink.is_closed());

        // Stopping again only reports the status
        assert_eq!(
            engine.stop(query, QueryTerminationType::Graceful).unwrap(),
            QueryStatus::Stopped
        );
    }

    #[test]
    fn failure_termination_reports_failed() {
        let engine = engine(1);
        let source = InMemorySource::new().hold_open();
        let query = engine
            .register(
                &filter_plan(),
                vec![(OriginId(1), Box::new(source))],
                Box::new(CollectingSink::new()),
            )
            .unwrap();
        engine.start(query).unwrap();
        let status = engine.stop(query, QueryTerminationType::Failure).unwrap();
        assert!(matches!(status, QueryStatus::Failed(_)), "{status}");
    }

    #[test]
    fn lifecycle_errors() {
        let engine = engine(1);
        let unknown = QueryId(99);
        assert_eq!(
            engine.start(unknown),
            Err(RuntimeError::UnknownQuery { query: unknown })
        );

        let missing = engine.register(&filter_plan(), Vec::new(), Box::new(CollectingSink::new()));
        assert_eq!(
            missing,
            Err(RuntimeError::MissingSource {
                origin: OriginId(1)
            })
        );
        let stray = engine.register(
            &filter_plan(),
            vec![(OriginId(1), source(Vec::new())), (OriginId(2), source(Vec::new()))],
            Box::new(CollectingSink::new()),
        );
        assert_eq!(
            stray,
            Err(RuntimeError::UnknownOrigin {
                origin: OriginId(2)
            })
        );

        let query = engine
            .register(
                &filter_plan(),
                vec![(OriginId(1), Box::new(InMemorySource::new().hold_open()))],
                Box::new(CollectingSink::new()),
            )
            .unwrap();
        assert!(matches!(
            engine.unregister(query),
            Err(RuntimeError::InvalidState { .. })
        ));
        engine.start(query).unwrap();
        assert!(matches!(
            engine.start(query),
            Err(RuntimeError::InvalidState {
                status: QueryStatus::Running,
                ..
            })
        ));
        assert_eq!(
            engine.stop(query, QueryTerminationType::Graceful).unwrap(),
            QueryStatus::Stopped
        );
        engine.unregister(query).unwrap();
        assert!(engine.queries().is_empty());
    }

    #[test]
    fn registered_queries_can_be_stopped_before_they_start() {
        let engine = engine(1);
        let sink = CollectingSink::new();
        let query = engine
            .register(
                &filter_plan(),
                vec![(OriginId(1), source(vec![(vec![record(1, 1)], 0)]))],
                Box::new(sink.clone()),
            )
            .unwrap();
        assert_eq!(
            engine.stop(query, QueryTerminationType::Graceful).unwrap(),
            QueryStatus::Stopped
        );
        assert!(sink.records().is_empty());
        assert!(!sink.is_closed());
    }

    struct RejectingSink;

    impl Sink for RejectingSink {
        fn write(&mut self, _buffer: &crate::memory::TupleBuffer) -> bool {
            false
        }
    }

    #[test]
    fn rejected_buffers_fail_the_query() {
        let engine = engine(2);
        let query = engine
            .register(
                &filter_plan(),
                vec![(OriginId(1), source(vec![(vec![record(1, 1)], 0)]))],
                Box::new(RejectingSink),
            )
            .unwrap();
        engine.start(query).unwrap();
        let status = engine.wait(query, TIMEOUT).unwrap();
        assert_eq!(
            status,
            QueryStatus::Failed("sink rejected a buffer emitted by p1".to_owned())
        );
    }

    struct BrokenSource;

    impl Source for BrokenSource {
        fn fill(
            &mut self,
            _buffer: &crate::memory::TupleBuffer,
            _layout: &crate::memory::MemoryLayout,
        ) -> Result<FillStatus, ConnectorError> {
            Err(ConnectorError::Other {
                message: "connection reset".to_owned(),
            })
        }
    }

    #[test]
    fn source_errors_fail_the_query() {
        let engine = engine(1);
        let query = engine
            .register(
                &filter_plan(),
                vec![(OriginId(1), Box::new(BrokenSource))],
                Box::new(CollectingSink::new()),
            )
            .unwrap();
        engine.start(query).unwrap();
        assert_eq!(
            engine.wait(query, TIMEOUT).unwrap(),
            QueryStatus::Failed("connection reset".to_owned())
        );
    }

    #[test]
    fn identical_queries_reuse_compiled_stages() {
        let engine = engine(1);
        for _ in 0..2 {
            engine
                .register(
                    &filter_plan(),
                    vec![(OriginId(1), source(Vec::new()))],
                    Box::new(CollectingSink::new()),
                )
                .unwrap();
        }
        let stats = engine.cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(engine.queries().len(), 2);
        assert!(engine.explain(QueryId(1)).unwrap().contains("p1 (source o1)"));
    }
}
