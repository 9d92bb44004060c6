//! Every backend must produce the same output for the same pipeline.

use proptest::prelude::*;
use std::time::Duration;
use tidal::{
    backend::available_backends, operators::Expression, CollectingSink, InMemorySource,
    NodeEngine, PhysicalOperatorNode, Record, Schema, Type, Value,
};
use tidal_types::{
    config::{BackendKind, EngineConfig},
    query::{OriginId, QueryStatus},
};

fn plan() -> PhysicalOperatorNode {
    let schema = Schema::new().with("a", Type::I64).with("b", Type::I32);
    let quotient = Expression::field("a").div(Expression::field("b").cast(Type::I64));
    let scaled = Expression::field("b")
        .cast(Type::I64)
        .mul(Expression::field("a"))
        .sub(Expression::constant(3i64));
    PhysicalOperatorNode::source(OriginId(1), schema)
        .selection(Expression::field("a").gt(Expression::constant(0i64)))
        .map("q", quotient)
        .map("b", scaled)
        .sink()
}

type Output = (i64, i64, i64);

fn run(backend: BackendKind, input: &[(i64, i32)]) -> Vec<Output> {
    let config = EngineConfig::default()
        .with_workers(2)
        .with_backend(backend)
        .with_buffer_pool(256, 16);
    let engine = NodeEngine::new(config).unwrap();
    let mut source = InMemorySource::new();
    // 12 byte input records, 21 to a buffer
    for chunk in input.chunks(16) {
        let records = chunk
            .iter()
            .map(|&(a, b)| Record::new().with("a", a).with("b", b))
            .collect();
        source.push_batch(records, 0);
    }
    let sink = CollectingSink::new();
    let query = engine
        .register(&plan(), vec![(OriginId(1), Box::new(source))], Box::new(sink.clone()))
        .unwrap();
    engine.start(query).unwrap();
    assert_eq!(
        engine.wait(query, Duration::from_secs(10)).unwrap(),
        QueryStatus::Stopped,
        "{backend}"
    );

    let mut output: Vec<Output> = sink
        .records()
        .iter()
        .map(|record| match (record.get("a"), record.get("b"), record.get("q")) {
            (Some(&Value::I64(a)), Some(&Value::I64(b)), Some(&Value::I64(q))) => (a, b, q),
            other => panic!("unexpected output {other:?} from {backend}"),
        })
        .collect();
    output.sort_unstable();
    output
}

fn expected(input: &[(i64, i32)]) -> Vec<Output> {
    let mut output: Vec<Output> = input
        .iter()
        .filter(|&&(a, _)| a > 0)
        .map(|&(a, b)| {
            // Division by zero yields zero
            let q = if b == 0 { 0 } else { a / i64::from(b) };
            (a, i64::from(b) * a - 3, q)
        })
        .collect();
    output.sort_unstable();
    output
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn backends_agree(
        input in prop::collection::vec(
            (-1000i64..1000, prop_oneof![-2i32..=2, -1000i32..1000]),
            0..100,
        )
    ) {
        let expected = expected(&input);
        for backend in available_backends() {
            prop_assert_eq!(run(backend, &input), expected.clone(), "{}", backend);
        }
    }
}
