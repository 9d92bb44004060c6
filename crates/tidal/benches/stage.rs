use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;
use tidal::{
    operators::Expression,
    windowing::{TimeCharacteristic, WindowType},
    AggregationDescriptor, CollectingSink, InMemorySource, NodeEngine, PhysicalOperatorNode,
    Record, Schema, Type,
};
use tidal_types::{
    config::{BackendKind, EngineConfig},
    query::OriginId,
};

const BATCHES: usize = 64;
const BATCH_SIZE: usize = 256;

fn schema() -> Schema {
    Schema::new()
        .with("ts", Type::U64)
        .with("k", Type::U32)
        .with("v", Type::I64)
}

fn batches() -> Vec<(Vec<Record>, u64)> {
    let mut rng = StdRng::seed_from_u64(0x7f_c3_59_18);
    (0..BATCHES)
        .map(|batch| {
            let base = (batch * BATCH_SIZE) as u64;
            let records = (0..BATCH_SIZE as u64)
                .map(|i| {
                    Record::new()
                        .with("ts", base + i)
                        .with("k", rng.gen_range(0..64u32))
                        .with("v", rng.gen_range(-1000..1000i64))
                })
                .collect();
            (records, base)
        })
        .collect()
}

fn filter_map() -> PhysicalOperatorNode {
    PhysicalOperatorNode::source(OriginId(1), schema())
        .selection(Expression::field("v").gt(Expression::constant(0i64)))
        .map("v", Expression::field("v").mul(Expression::constant(2i64)))
        .sink()
}

fn keyed_sum() -> PhysicalOperatorNode {
    PhysicalOperatorNode::source(OriginId(1), schema())
        .window_aggregation(
            WindowType::Tumbling { size: 1024 },
            TimeCharacteristic::EventTime { field: "ts".into() },
            &["k"],
            vec![AggregationDescriptor::sum("v", "total")],
        )
        .sink()
}

fn run(engine: &NodeEngine, plan: &PhysicalOperatorNode, batches: Vec<(Vec<Record>, u64)>) {
    let mut source = InMemorySource::new();
    for (records, watermark) in batches {
        source.push_batch(records, watermark);
    }
    let query = engine
        .register(
            plan,
            vec![(OriginId(1), Box::new(source))],
            Box::new(CollectingSink::new()),
        )
        .unwrap();
    engine.start(query).unwrap();
    engine.wait(query, Duration::from_secs(60)).unwrap();
    engine.unregister(query).unwrap();
}

fn stage_throughput(c: &mut Criterion) {
    let input = batches();
    let mut backends = vec![BackendKind::Interpreter];
    if cfg!(feature = "cranelift") {
        backends.push(BackendKind::Cranelift);
    }

    for (name, plan) in [("filter_map", filter_map()), ("keyed_sum", keyed_sum())] {
        let mut group = c.benchmark_group(name);
        group.throughput(Throughput::Elements((BATCHES * BATCH_SIZE) as u64));
        for &backend in &backends {
            let config = EngineConfig::default()
                .with_backend(backend)
                .with_buffer_pool(8192, 256);
            let engine = NodeEngine::new(config).unwrap();
            group.bench_with_input(BenchmarkId::from_parameter(backend), &plan, |b, plan| {
                b.iter_batched(|| input.clone(), |input| run(&engine, plan, input), BatchSize::LargeInput)
            });
        }
        group.finish();
    }
}

criterion_group!(benches, stage_throughput);
criterion_main!(benches);
