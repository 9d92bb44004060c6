//! End to end scenarios: window aggregation, buffer pool back pressure,
//! record layouts and window joins.

use pretty_assertions::assert_eq;
use std::{
    sync::Once,
    thread,
    time::{Duration, Instant},
};
use tidal::{
    memory::MemoryLayout,
    windowing::{SliceState, TimeCharacteristic, WindowType},
    AggregationDescriptor, BufferManager, CollectingSink, InMemorySource, NodeEngine,
    PhysicalOperatorNode, Record, Schema, Type, Value,
};
use tidal_types::{
    config::{BackendKind, EngineConfig},
    query::{OriginId, QueryStatus, QueryTerminationType},
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("TIDAL_LOG"))
            .with_test_writer()
            .try_init();
    });
}

fn engine(workers: usize) -> NodeEngine {
    init_logger();
    let config = EngineConfig::default()
        .with_workers(workers)
        .with_backend(BackendKind::Interpreter)
        .with_buffer_pool(512, 32);
    NodeEngine::new(config).unwrap()
}

fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in {TIMEOUT:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn by_window(records: &mut [Record]) {
    records.sort_by(|a, b| {
        a.get("window_start")
            .partial_cmp(&b.get("window_start"))
            .unwrap()
    });
}

#[test]
fn tumbling_window_closes_once_the_watermark_passes_its_end() {
    let engine = engine(2);
    let schema = Schema::new().with("ts", Type::U64).with("v", Type::I64);
    let plan = PhysicalOperatorNode::source(OriginId(1), schema)
        .window_aggregation(
            WindowType::Tumbling { size: 1000 },
            TimeCharacteristic::EventTime { field: "ts".into() },
            &[],
            vec![AggregationDescriptor::sum("v", "sum")],
        )
        .sink();
    let records = vec![
        Record::new().with("ts", 100u64).with("v", 1i64),
        Record::new().with("ts", 999u64).with("v", 2i64),
        Record::new().with("ts", 1000u64).with("v", 3i64),
    ];
    let source = InMemorySource::new().with_batch(records, 1000).hold_open();
    let sink = CollectingSink::new();
    let query = engine
        .register(&plan, vec![(OriginId(1), Box::new(source))], Box::new(sink.clone()))
        .unwrap();
    engine.start(query).unwrap();

    eventually(|| !sink.records().is_empty());
    let first = Record::new()
        .with("window_start", 0u64)
        .with("window_end", 1000u64)
        .with("sum", 3i64);
    assert_eq!(sink.records(), [first.clone()]);
    let slices = engine.slices(query).unwrap();
    assert!(slices[0].contains(&(1000, 2000, SliceState::Open)), "{slices:?}");

    // A graceful stop flushes the window that is still open
    assert_eq!(
        engine.stop(query, QueryTerminationType::Graceful).unwrap(),
        QueryStatus::Stopped
    );
    let mut records = sink.records();
    by_window(&mut records);
    let second = Record::new()
        .with("window_start", 1000u64)
        .with("window_end", 2000u64)
        .with("sum", 3i64);
    assert_eq!(records, [first, second]);
}

#[test]
fn exhausted_buffer_pool_blocks_until_a_buffer_is_released() {
    let pool = BufferManager::new(64, 2);
    let first = pool.try_get_buffer().unwrap();
    let _second = pool.try_get_buffer().unwrap();
    assert!(pool.try_get_buffer().is_err());

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let buffer = pool.get_buffer_timeout(TIMEOUT);
            (buffer.is_ok(), started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    drop(first);

    let (acquired, waited) = waiter.join().unwrap();
    assert!(acquired);
    assert!(waited >= Duration::from_millis(40), "{waited:?}");
    assert!(waited < TIMEOUT);
}

#[test]
fn row_and_columnar_layouts_place_fields() {
    let schema = Schema::new().with("a", Type::I64).with("b", Type::I32);
    let record = Record::new().with("a", 7i64).with("b", 3i32);

    let row = MemoryLayout::row(schema.clone(), 64).unwrap();
    assert_eq!(row.record_size(), 12);
    let buffer = BufferManager::new(64, 1).try_get_buffer().unwrap();
    let view = row.bind(&buffer).unwrap();
    view.write_record(0, &record).unwrap();
    buffer.set_num_tuples(1);
    let expected: Vec<u8> = 7i64
        .to_le_bytes()
        .into_iter()
        .chain(3i32.to_le_bytes())
        .collect();
    assert_eq!(buffer.read_bytes(0, 12), expected);
    assert_eq!(view.read_record(0).unwrap(), record);

    // Columns are `capacity` values long
    let columnar = MemoryLayout::columnar(schema, 64).unwrap();
    assert_eq!(columnar.capacity(), 5);
    let buffer = BufferManager::new(64, 1).try_get_buffer().unwrap();
    let view = columnar.bind(&buffer).unwrap();
    view.push_record(&record).unwrap();
    view.push_record(&record).unwrap();
    assert_eq!(buffer.read_bytes(8, 8), 7i64.to_le_bytes());
    assert_eq!(buffer.read_bytes(44, 4), 3i32.to_le_bytes());
    assert_eq!(view.records().unwrap(), [record.clone(), record]);
}

#[test]
fn window_join_emits_matching_pairs() {
    let engine = engine(2);
    let schema = |value: &str| {
        Schema::new()
            .with("ts", Type::U64)
            .with("k", Type::U64)
            .with(value, Type::I64)
    };
    let plan = PhysicalOperatorNode::source(OriginId(1), schema("left"))
        .window_join(
            PhysicalOperatorNode::source(OriginId(2), schema("right")),
            WindowType::Tumbling { size: 1000 },
            ("ts", "ts"),
            (&["k"], &["k"]),
        )
        .sink();

    let record = |ts: u64, k: u64, name: &str, value: i64| {
        Record::new().with("ts", ts).with("k", k).with(name, value)
    };
    let left = InMemorySource::new().with_batch(
        vec![record(100, 1, "left", 5), record(300, 2, "left", 6)],
        1000,
    );
    let right = InMemorySource::new().with_batch(
        vec![record(200, 1, "right", 9), record(400, 3, "right", 7)],
        1000,
    );
    let sink = CollectingSink::new();
    let query = engine
        .register(
            &plan,
            vec![(OriginId(1), Box::new(left)), (OriginId(2), Box::new(right))],
            Box::new(sink.clone()),
        )
        .unwrap();
    engine.start(query).unwrap();
    assert_eq!(engine.wait(query, TIMEOUT).unwrap(), QueryStatus::Stopped);

    let joined = Record::new()
        .with("window_start", 0u64)
        .with("window_end", 1000u64)
        .with("k", 1u64)
        .with("ts", 100u64)
        .with("left", 5i64)
        .with("right_ts", 200u64)
        .with("right", 9i64);
    assert_eq!(sink.records(), [joined]);
    assert_eq!(
        sink.layout().unwrap().schema().fields()[2].name,
        "k".to_owned()
    );
    assert_eq!(sink.records()[0].get("right"), Some(&Value::I64(9)));
}
