//! Tracing and compilation of pipeline stages.
//!
//! A stage runs the whole operator chain of a pipeline on one input buffer:
//!
//! ```text
//! open every operator
//! for index in 0..num_tuples {
//!     record = source.read(index)
//!     execute every other operator on record, until one discards it
//! }
//! close every operator
//! return Ok
//! ```
//!
//! The three phases and every operator within a phase trace in frames of
//! their own, so operators never have to care about tag collisions with
//! their neighbours.

use super::{ExecutionResult, Pipeline, ProxyIds};
use crate::{
    backend::{CompilationCache, CompileError, Executable, ProxyRegistry},
    ir::Function,
    operators::{ExecutionContext, Flow, OperatorState},
    trace::{trace_function, TraceError, TraceOptions},
    types::Type,
};
use std::sync::Arc;
use tidal_types::config::CompilerConfig;
use tracing::debug;

const OPEN: u32 = 0;
const EXECUTE: u32 = 1;
const CLOSE: u32 = 2;

/// Traces the stage of `pipeline` into an SSA function.
pub fn trace_pipeline(
    pipeline: &Pipeline,
    proxies: &ProxyIds,
    options: &TraceOptions,
) -> Result<Function, CompileError> {
    let operators = &pipeline.operators;
    let trace = trace_function(&ExecutionContext::PARAMS, Some(Type::U64), options, |t| {
        let ctx = ExecutionContext::new(t, *proxies);

        let states = t.frame(OPEN, |t| {
            operators
                .iter()
                .enumerate()
                .map(|(i, operator)| t.frame(i as u32, |t| operator.open(&ctx, t)))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let (Some(source), Some(&OperatorState::Input { count, .. })) =
            (operators.first(), states.first())
        else {
            return Err(TraceError::UndefinedValue {
                value: format!("source operator of {}", pipeline.id),
            });
        };

        t.frame(EXECUTE, |t| {
            let zero = t.constant(0u64)?;
            let index = t.var(zero)?;
            loop {
                let current = t.get(index)?;
                let more = t.lt(current, count)?;
                if !t.branch(more)? {
                    break;
                }

                let mut record = t.frame(0, |t| source.read(t, &states[0], current))?;
                for (i, operator) in operators.iter().enumerate().skip(1) {
                    let flow = t.frame(i as u32, |t| operator.execute(&ctx, t, &states[i], &mut record))?;
                    if flow == Flow::Discard {
                        break;
                    }
                }

                let one = t.constant(1u64)?;
                let next = t.add(current, one)?;
                t.set(index, next)?;
            }
            Ok(())
        })?;

        t.frame(CLOSE, |t| {
            for (i, operator) in operators.iter().enumerate() {
                t.frame(i as u32, |t| operator.close(&ctx, t, &states[i]))?;
            }
            Ok(())
        })?;

        Ok(Some(t.constant(ExecutionResult::Ok.code())?))
    })?;

    let function = trace.to_ssa(&format!("stage_{}", pipeline.id))?;
    debug!(
        "traced {} into {} blocks with {} instructions",
        pipeline.id,
        function.blocks().len(),
        function.instruction_count(),
    );
    Ok(function)
}

/// Compiles the stage of `pipeline`, reusing a cached executable for
/// pipelines with the same operators.
pub fn compile_pipeline(
    pipeline: &Pipeline,
    proxies: &ProxyIds,
    registry: &ProxyRegistry,
    config: &CompilerConfig,
    cache: &CompilationCache,
) -> Result<Arc<dyn Executable>, CompileError> {
    let key = CompilationCache::key(&pipeline.operators, config.backend)?;
    let options = TraceOptions::from_config(config);
    cache.get_or_compile(key, || trace_pipeline(pipeline, proxies, &options), config, registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::available_backends,
        ir::validate,
        memory::{Record, TupleBuffer},
        operators::Expression,
        pipeline::{
            builtin_proxies, context::testing::*, PhysicalOperatorNode, PipelineExecutionContext,
            PipelinedQueryPlan, PlanOptions, StateManager, WorkerContext,
        },
    };
    use pretty_assertions::assert_eq;
    use tidal_types::{
        config::{BackendKind, MemoryLayoutKind, SliceStoreConfig},
        query::{OriginId, QueryId},
    };

    const BUFFER_SIZE: usize = 192;

    /// `a > 2` over `(a: i64, b: i32)`, widening `b` to `i64`.
    fn plan() -> PipelinedQueryPlan {
        let schema = crate::memory::Schema::new().with("a", Type::I64).with("b", Type::I32);
        let root = PhysicalOperatorNode::source(OriginId(1), schema)
            .selection(Expression::field("a").gt(Expression::constant(2i64)))
            .map("b", Expression::field("b").cast(Type::I64).add(Expression::field("a")))
            .sink();
        let options = PlanOptions {
            buffer_size: BUFFER_SIZE,
            layout: MemoryLayoutKind::Row,
        };
        PipelinedQueryPlan::build(QueryId(1), &root, &options).unwrap()
    }

    fn config(backend: BackendKind) -> CompilerConfig {
        CompilerConfig {
            backend,
            ..CompilerConfig::default()
        }
    }

    /// Runs the stage once on `input` and returns the dispatched buffers.
    fn run(executable: &dyn Executable, input: &TupleBuffer) -> Vec<TupleBuffer> {
        let dispatch = Arc::new(CollectingDispatch::default());
        let ctx = context(Vec::new(), dispatch.clone(), BUFFER_SIZE);
        let mut worker = WorkerContext::new(0, &StateManager::new(1, SliceStoreConfig::default()));
        worker.begin(input);
        let code = unsafe {
            executable.invoke(&[
                input.handle(),
                &ctx as *const PipelineExecutionContext as u64,
                &mut worker as *mut WorkerContext as u64,
            ])
        };
        worker.end();
        assert_eq!(ExecutionResult::from_code(code), Some(ExecutionResult::Ok));
        assert_eq!(worker.take_error(), None);
        dispatch.take()
    }

    #[test]
    fn stage_contains_the_record_loop() {
        let (_, proxies) = builtin_proxies();
        let plan = plan();
        let function = trace_pipeline(&plan.pipelines()[0], &proxies, &TraceOptions::default()).unwrap();
        validate(&function).unwrap();
        assert_eq!(function.name(), "stage_p1");
        assert_eq!(function.loop_headers().len(), 1);
    }

    #[test]
    fn stages_filter_map_and_emit_on_every_backend() {
        let (registry, proxies) = builtin_proxies();
        let plan = plan();
        let pipeline = &plan.pipelines()[0];
        let input_layout = pipeline.input_layout().unwrap();
        let output_layout = pipeline.output_layout().unwrap();
        // 16 input records, 12 output records per buffer
        assert_eq!((input_layout.capacity(), output_layout.capacity()), (16, 12));

        let input = TupleBuffer::unpooled(BUFFER_SIZE);
        input.set_origin_id(OriginId(1));
        input.set_sequence_number(3);
        let view = input_layout.bind(&input).unwrap();
        for a in 0..16i64 {
            view.push_record(&Record::new().with("a", a).with("b", 100i32)).unwrap();
        }

        for backend in available_backends() {
            let cache = CompilationCache::new(4);
            let executable = compile_pipeline(pipeline, &proxies, &registry, &config(backend), &cache).unwrap();
            let emitted = run(executable.as_ref(), &input);

            // Records 3..16 pass, they overflow the first output buffer
            let counts: Vec<_> = emitted.iter().map(TupleBuffer::num_tuples).collect();
            assert_eq!(counts, [12, 1], "{backend}");
            let chunks: Vec<_> = emitted
                .iter()
                .map(|buffer| (buffer.sequence_number(), buffer.chunk_number(), buffer.is_last_chunk()))
                .collect();
            assert_eq!(chunks, [(3, 1, false), (3, 2, true)], "{backend}");

            let records: Vec<_> = emitted
                .iter()
                .flat_map(|buffer| output_layout.bind(buffer).unwrap().records().unwrap())
                .collect();
            let expected: Vec<_> = (3..16i64)
                .map(|a| Record::new().with("a", a).with("b", 100 + a))
                .collect();
            assert_eq!(records, expected, "{backend}");
        }
    }

    #[test]
    fn empty_inputs_still_emit_a_last_chunk() {
        let (registry, proxies) = builtin_proxies();
        let plan = plan();
        let pipeline = &plan.pipelines()[0];
        let cache = CompilationCache::new(4);
        let executable =
            compile_pipeline(pipeline, &proxies, &registry, &config(BackendKind::Interpreter), &cache)
                .unwrap();

        let input = TupleBuffer::unpooled(BUFFER_SIZE);
        input.set_sequence_number(9);
        input.set_watermark(42);
        let emitted = run(executable.as_ref(), &input);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].num_tuples(), 0);
        assert!(emitted[0].is_last_chunk());
        assert_eq!(emitted[0].watermark(), 42);
    }

    #[test]
    fn identical_pipelines_share_an_executable() {
        let (registry, proxies) = builtin_proxies();
        let cache = CompilationCache::new(4);
        let config = config(BackendKind::Interpreter);
        let (first, second) = (plan(), plan());
        let a = compile_pipeline(&first.pipelines()[0], &proxies, &registry, &config, &cache).unwrap();
        let b = compile_pipeline(&second.pipelines()[0], &proxies, &registry, &config, &cache).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }
}
