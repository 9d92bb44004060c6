//! Physical operators.
//!
//! A pipeline is a chain of operators: a source operator reading records out
//! of the input buffer, any number of record-at-a-time operators and a sink
//! operator that either writes records into output buffers or hands them to
//! a window handler. Operators are never executed directly. The stage tracer
//! runs their lifecycle hooks once on traced values and compiles the
//! resulting IR:
//!
//! * `open` once per input buffer, before any record,
//! * `execute` once per record,
//! * `close` once per input buffer, after all records.
//!
//! Dispatch over operator kinds is a plain `match` that is fully resolved
//! while tracing, no dynamic dispatch is left in compiled code.

mod context;
mod emit;
mod expression;
mod relational;
mod scan;
mod watermark;
mod window;

pub use context::{ExecutionContext, TracedRecord};
pub use emit::Emit;
pub use expression::Expression;
pub use relational::{Map, Selection};
pub use scan::{AggregationProbe, JoinProbe, Scan};
pub(crate) use watermark::check_timestamp_field;
pub use watermark::{WatermarkAssignment, WatermarkStrategy};
pub use window::{AggregationBuild, JoinBuild};

use crate::{
    memory::{MemoryLayout, Schema},
    trace::{TraceContext, TraceResult, Val, Var},
};
use serde::Serialize;
use std::fmt::{self, Display};

/// What an operator keeps between its lifecycle hooks within one traced
/// invocation.
#[derive(Debug, Clone, Copy, Default)]
pub enum OperatorState {
    #[default]
    None,
    /// Start of the input data and the number of records in it.
    Input { data: Val, count: Val },
    /// The output buffer being filled.
    Output { buffer: Var, data: Var, count: Var },
    /// Scratch memory of a window handler and the ingestion timestamp of
    /// the input, if tuples are timestamped by it.
    Window { scratch: Val, ingestion_ts: Option<Val> },
    /// Largest event timestamp seen so far.
    Watermark { max_ts: Var },
}

/// Whether a record continues down the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalOperator {
    Scan(Scan),
    AggregationProbe(AggregationProbe),
    JoinProbe(JoinProbe),
    Selection(Selection),
    Map(Map),
    WatermarkAssignment(WatermarkAssignment),
    Emit(Emit),
    AggregationBuild(AggregationBuild),
    JoinBuild(JoinBuild),
}

impl PhysicalOperator {
    /// Whether the operator reads records out of the input buffer.
    pub const fn is_source(&self) -> bool {
        matches!(
            self,
            Self::Scan(_) | Self::AggregationProbe(_) | Self::JoinProbe(_)
        )
    }

    /// Whether the operator consumes records without passing them on.
    pub const fn is_sink(&self) -> bool {
        matches!(
            self,
            Self::Emit(_) | Self::AggregationBuild(_) | Self::JoinBuild(_)
        )
    }

    /// Index of the window handler the operator uses.
    pub const fn handler(&self) -> Option<usize> {
        match self {
            Self::AggregationBuild(build) => Some(build.handler),
            Self::JoinBuild(build) => Some(build.handler),
            _ => None,
        }
    }

    /// Layout of the buffers a source operator reads.
    pub const fn input_layout(&self) -> Option<&MemoryLayout> {
        match self {
            Self::Scan(scan) => Some(&scan.layout),
            Self::AggregationProbe(probe) => Some(&probe.input),
            Self::JoinProbe(probe) => Some(&probe.layout),
            _ => None,
        }
    }

    /// Schema of the records leaving the operator, given the schema of the
    /// records entering it.
    pub fn output_schema(&self, input: &Schema) -> Schema {
        match self {
            Self::Scan(scan) => scan.layout.schema().clone(),
            Self::AggregationProbe(probe) => probe.output_schema(),
            Self::JoinProbe(probe) => probe.layout.schema().clone(),
            Self::Map(map) => map.output_schema(input),
            Self::Selection(_) | Self::WatermarkAssignment(_) => input.clone(),
            Self::Emit(emit) => emit.layout.schema().clone(),
            Self::AggregationBuild(_) | Self::JoinBuild(_) => Schema::new(),
        }
    }

    pub fn open(&self, ctx: &ExecutionContext, t: &mut TraceContext<'_>) -> TraceResult<OperatorState> {
        match self {
            Self::Scan(_) | Self::AggregationProbe(_) | Self::JoinProbe(_) => {
                scan::open_input(ctx, t)
            }
            Self::WatermarkAssignment(watermark) => watermark.open(t),
            Self::Emit(emit) => emit.open(ctx, t),
            Self::AggregationBuild(build) => window::open_window(ctx, t, build.handler, &build.time),
            Self::JoinBuild(build) => window::open_window(ctx, t, build.handler, &build.time),
            Self::Selection(_) | Self::Map(_) => Ok(OperatorState::None),
        }
    }

    /// Reads the record at `index`, only called on source operators.
    pub fn read(
        &self,
        t: &mut TraceContext<'_>,
        state: &OperatorState,
        index: Val,
    ) -> TraceResult<TracedRecord> {
        match self {
            Self::Scan(scan) => scan.read(t, state, index),
            Self::AggregationProbe(probe) => probe.read(t, state, index),
            Self::JoinProbe(probe) => probe.read(t, state, index),
            _ => Ok(TracedRecord::new()),
        }
    }

    pub fn execute(
        &self,
        ctx: &ExecutionContext,
        t: &mut TraceContext<'_>,
        state: &OperatorState,
        record: &mut TracedRecord,
    ) -> TraceResult<Flow> {
        match self {
            Self::Scan(_) | Self::AggregationProbe(_) | Self::JoinProbe(_) => Ok(Flow::Continue),
            Self::Selection(selection) => selection.execute(t, record),
            Self::Map(map) => map.execute(t, record),
            Self::WatermarkAssignment(watermark) => watermark.execute(t, state, record),
            Self::Emit(emit) => emit.execute(ctx, t, state, record),
            Self::AggregationBuild(build) => build.execute(ctx, t, state, record),
            Self::JoinBuild(build) => build.execute(ctx, t, state, record),
        }
    }

    pub fn close(&self, ctx: &ExecutionContext, t: &mut TraceContext<'_>, state: &OperatorState) -> TraceResult<()> {
        match self {
            Self::WatermarkAssignment(watermark) => watermark.close(ctx, t, state),
            Self::Emit(emit) => emit.close(ctx, t, state),
            Self::AggregationBuild(build) => ctx.trigger(t, build.handler),
            Self::JoinBuild(build) => ctx.trigger(t, build.handler),
            _ => Ok(()),
        }
    }
}

impl Display for PhysicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan(scan) => write!(f, "Scan({})", scan.layout.schema()),
            Self::AggregationProbe(_) => f.write_str("AggregationProbe"),
            Self::JoinProbe(_) => f.write_str("JoinProbe"),
            Self::Selection(selection) => write!(f, "Selection({})", selection.predicate),
            Self::Map(map) => write!(f, "Map({} = {})", map.field, map.expression),
            Self::WatermarkAssignment(watermark) => write!(f, "WatermarkAssignment({})", watermark.strategy),
            Self::Emit(emit) => write!(f, "Emit({:?})", emit.layout.kind()),
            Self::AggregationBuild(build) => write!(f, "AggregationBuild(handler {})", build.handler),
            Self::JoinBuild(build) => write!(f, "JoinBuild(handler {}, {:?})", build.handler, build.side),
        }
    }
}

/// Loads field `field` of the record at `index` of `layout`. Callers trace
/// every field in its own frame.
fn load_field(
    t: &mut TraceContext<'_>,
    layout: &MemoryLayout,
    data: Val,
    index: Val,
    field: usize,
) -> TraceResult<Val> {
    let address = t.frame(0, |t| field_address(t, layout, data, index, field))?;
    t.frame(2, |t| t.load(address, layout.schema().field(field).ty))
}

/// Stores `value` into field `field` of the record at `index` of `layout`.
fn store_field(
    t: &mut TraceContext<'_>,
    layout: &MemoryLayout,
    data: Val,
    index: Val,
    field: usize,
    value: Val,
) -> TraceResult<()> {
    let address = t.frame(1, |t| field_address(t, layout, data, index, field))?;
    t.frame(2, |t| t.store(address, value))
}

/// `data + base + index * stride` of the field.
fn field_address(
    t: &mut TraceContext<'_>,
    layout: &MemoryLayout,
    data: Val,
    index: Val,
    field: usize,
) -> TraceResult<Val> {
    let (base, stride) = layout.field_stride(field);
    let stride = t.const_bits(index.ty(), stride as u64)?;
    let offset = t.mul(index, stride)?;
    let base = t.const_bits(index.ty(), base as u64)?;
    let offset = t.add(offset, base)?;
    t.ptr_add(data, offset)
}
