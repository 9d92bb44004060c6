use pretty_assertions::assert_eq;
use std::time::Duration;
use tidal::{
    operators::Expression,
    runtime::RuntimeError,
    windowing::{TimeCharacteristic, WindowType},
    AggregationDescriptor, CollectingSink, InMemorySource, NodeEngine, PhysicalOperatorNode,
    Record, Schema, Type,
};
use tidal_types::{
    config::EngineConfig,
    error::{DetailedError, ErrorResponse},
    query::{OriginId, QueryStatus, QueryTerminationType},
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(workers: usize) -> EngineConfig {
    EngineConfig::from_json(&format!(
        r#"{{
            "workers": {workers},
            "buffer_pool": {{ "buffer_size": 256, "num_buffers": 16 }},
            "compiler": {{ "backend": "interpreter" }}
        }}"#
    ))
    .unwrap()
}

fn schema() -> Schema {
    Schema::new()
        .with("ts", Type::U64)
        .with("k", Type::U32)
        .with("v", Type::I64)
}

fn record(ts: u64, k: u32, v: i64) -> Record {
    Record::new().with("ts", ts).with("k", k).with("v", v)
}

fn keyed_plan() -> PhysicalOperatorNode {
    PhysicalOperatorNode::source(OriginId(1), schema())
        .window_aggregation(
            WindowType::Tumbling { size: 1000 },
            TimeCharacteristic::EventTime { field: "ts".into() },
            &["k"],
            vec![
                AggregationDescriptor::count("n"),
                AggregationDescriptor::max("v", "top"),
            ],
        )
        .sink()
}

#[test]
fn late_tuples_are_counted_and_dropped() {
    // One worker keeps the buffers in order
    let engine = NodeEngine::new(config(1)).unwrap();
    let source = InMemorySource::new()
        .with_batch(vec![record(100, 1, 4), record(200, 1, 9), record(300, 2, 1)], 2000)
        .with_batch(vec![record(50, 1, 100)], 2000);
    let sink = CollectingSink::new();
    let query = engine
        .register(&keyed_plan(), vec![(OriginId(1), Box::new(source))], Box::new(sink.clone()))
        .unwrap();
    engine.start(query).unwrap();
    assert_eq!(engine.wait(query, TIMEOUT).unwrap(), QueryStatus::Stopped);

    let mut records = sink.records();
    records.sort_by(|a, b| a.get("k").partial_cmp(&b.get("k")).unwrap());
    let window = |k: u32, n: u64, top: i64| {
        Record::new()
            .with("window_start", 0u64)
            .with("window_end", 1000u64)
            .with("k", k)
            .with("n", n)
            .with("top", top)
    };
    assert_eq!(records, [window(1, 2, 9), window(2, 1, 1)]);

    let statistics = engine.statistics(query).unwrap();
    assert_eq!(statistics.late_tuples, 1);
    assert!(statistics.processed_tuples >= 4, "{statistics:?}");
}

#[test]
fn every_termination_type_ends_in_a_terminal_status() {
    let engine = NodeEngine::new(config(2)).unwrap();
    let cases = [
        (QueryTerminationType::Graceful, QueryStatus::Stopped),
        (QueryTerminationType::HardStop, QueryStatus::Stopped),
        (
            QueryTerminationType::Failure,
            QueryStatus::Failed("terminated on request".to_owned()),
        ),
    ];
    for (termination, expected) in cases {
        let source = InMemorySource::new()
            .with_batch(vec![record(10, 1, 1)], 0)
            .hold_open();
        let sink = CollectingSink::new();
        let query = engine
            .register(&keyed_plan(), vec![(OriginId(1), Box::new(source))], Box::new(sink.clone()))
            .unwrap();
        engine.start(query).unwrap();
        assert_eq!(engine.wait(query, Duration::from_millis(50)).unwrap(), QueryStatus::Running);

        assert_eq!(engine.stop(query, termination).unwrap(), expected);
        assert!(sink.is_closed());
        // Only a graceful stop flushes the open window
        let flushed = termination == QueryTerminationType::Graceful;
        assert_eq!(!sink.records().is_empty(), flushed, "{termination:?}");
        engine.unregister(query).unwrap();
    }
    assert!(engine.queries().is_empty());
}

#[test]
fn invalid_plans_are_rejected_at_registration() {
    let engine = NodeEngine::new(config(1)).unwrap();
    let plan = PhysicalOperatorNode::source(OriginId(1), schema())
        .selection(Expression::field("missing").gt(Expression::constant(0i64)))
        .sink();
    let error = engine
        .register(
            &plan,
            vec![(OriginId(1), Box::new(InMemorySource::new()))],
            Box::new(CollectingSink::new()),
        )
        .unwrap_err();
    assert!(matches!(error, RuntimeError::Plan(_)), "{error}");
    assert_eq!(error.error_code(), "UnknownField");
    let response = ErrorResponse::from_error_nolog(&error);
    assert!(response.message.contains("missing"), "{}", response.message);
}

#[test]
fn dropping_the_engine_stops_running_queries() {
    let engine = NodeEngine::new(config(2)).unwrap();
    let sink = CollectingSink::new();
    let query = engine
        .register(
            &keyed_plan(),
            vec![(OriginId(1), Box::new(InMemorySource::new().hold_open()))],
            Box::new(sink.clone()),
        )
        .unwrap();
    engine.start(query).unwrap();
    drop(engine);
    assert!(sink.is_closed());
    assert!(sink.records().is_empty());
}

#[test]
fn exhausted_output_pool_fails_the_query() {
    // The only buffer holds the input while the stage needs an output buffer
    let config = EngineConfig::from_json(
        r#"{
            "workers": 1,
            "buffer_pool": { "buffer_size": 256, "num_buffers": 1, "acquire_timeout_ms": 20 },
            "compiler": { "backend": "interpreter" }
        }"#,
    )
    .unwrap();
    let engine = NodeEngine::new(config).unwrap();
    let plan = PhysicalOperatorNode::source(OriginId(1), schema())
        .selection(Expression::field("v").gt(Expression::constant(0i64)))
        .sink();
    let source = InMemorySource::new().with_batch(vec![record(10, 1, 1)], 0);
    let sink = CollectingSink::new();
    let query = engine
        .register(&plan, vec![(OriginId(1), Box::new(source))], Box::new(sink.clone()))
        .unwrap();
    engine.start(query).unwrap();

    assert_eq!(
        engine.wait(query, TIMEOUT).unwrap(),
        QueryStatus::Failed("buffer pool exhausted: no buffer became available within 20ms".to_owned())
    );
    assert!(sink.records().is_empty());
}
