//! Pipelined, compiled execution of streaming queries.
//!
//! A query arrives as a tree of [`PhysicalOperatorNode`]s. The
//! [`NodeEngine`] cuts it into pipelines at every operator that has to
//! materialize its input, traces every pipeline into an SSA
//! [`Function`](ir::Function) and compiles it with one of the
//! [backends](backend): Cranelift, a C compiler, or the IR interpreter.
//! Worker threads then run the compiled stages on [`TupleBuffer`]s coming
//! from the query's sources, window state lives in slice stores that close
//! windows as the watermark advances.
//!
//! ```no_run
//! use tidal::{
//!     CollectingSink, InMemorySource, NodeEngine, PhysicalOperatorNode, Record, Schema, Type,
//! };
//! use tidal::operators::Expression;
//! use tidal_types::{config::EngineConfig, query::OriginId};
//! use std::time::Duration;
//!
//! let engine = NodeEngine::new(EngineConfig::default())?;
//! let schema = Schema::new().with("ts", Type::U64).with("v", Type::I64);
//! let plan = PhysicalOperatorNode::source(OriginId(1), schema)
//!     .selection(Expression::field("v").gt(Expression::constant(0i64)))
//!     .sink();
//! let source = InMemorySource::new()
//!     .with_batch(vec![Record::new().with("ts", 1u64).with("v", 5i64)], 0);
//! let sink = CollectingSink::new();
//!
//! let query = engine.register(&plan, vec![(OriginId(1), Box::new(source))], Box::new(sink.clone()))?;
//! engine.start(query)?;
//! engine.wait(query, Duration::from_secs(1))?;
//! assert_eq!(sink.records().len(), 1);
//! # Ok::<(), tidal::Error>(())
//! ```

pub mod backend;
mod error;
pub mod ir;
pub mod memory;
pub mod operators;
pub mod pipeline;
pub mod runtime;
pub mod trace;
pub mod types;
pub mod windowing;

pub use error::Error;
pub use memory::{BufferManager, MemoryLayout, Record, Schema, TupleBuffer};
pub use pipeline::{AggregationDescriptor, PhysicalOperatorNode, PipelinedQueryPlan};
pub use runtime::{CollectingSink, InMemorySource, NodeEngine, Sink, Source};
pub use types::{Type, Value};

#[cfg(test)]
pub(crate) fn init_test_logger() {
    use std::sync::Once;
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("TIDAL_LOG")
            .or_else(|_| EnvFilter::try_new("info,cranelift_codegen=off,cranelift_jit=off"))
            .unwrap();
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
