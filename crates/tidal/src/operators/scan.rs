use super::{load_field, ExecutionContext, OperatorState, TracedRecord};
use crate::{
    memory::{MemoryLayout, Schema},
    trace::{TraceContext, TraceError, TraceResult, Val},
    types::Type,
    windowing::{AggregationFunction, AggregationState, WINDOW_END, WINDOW_START},
};
use serde::Serialize;

pub(super) fn open_input(ctx: &ExecutionContext, t: &mut TraceContext<'_>) -> TraceResult<OperatorState> {
    let data = ctx.buffer_data(t, ctx.buffer())?;
    let count = ctx.num_tuples(t, ctx.buffer())?;
    Ok(OperatorState::Input { data, count })
}

fn input_data(state: &OperatorState) -> TraceResult<Val> {
    match state {
        OperatorState::Input { data, .. } => Ok(*data),
        _ => Err(TraceError::UndefinedValue {
            value: "input buffer".to_owned(),
        }),
    }
}

fn read_all(
    t: &mut TraceContext<'_>,
    layout: &MemoryLayout,
    state: &OperatorState,
    index: Val,
) -> TraceResult<TracedRecord> {
    let data = input_data(state)?;
    let mut record = TracedRecord::new();
    for (i, field) in layout.schema().fields().iter().enumerate() {
        let value = t.frame(i as u32, |t| load_field(t, layout, data, index, i))?;
        record.set(field.name.clone(), value);
    }
    Ok(record)
}

/// Reads the records of an input buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scan {
    pub layout: MemoryLayout,
}

impl Scan {
    pub const fn new(layout: MemoryLayout) -> Self {
        Self { layout }
    }

    pub(super) fn read(&self, t: &mut TraceContext<'_>, state: &OperatorState, index: Val) -> TraceResult<TracedRecord> {
        read_all(t, &self.layout, state, index)
    }
}

/// Reads the joined records a join handler emits for closed windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinProbe {
    pub handler: usize,
    pub layout: MemoryLayout,
}

impl JoinProbe {
    pub(super) fn read(&self, t: &mut TraceContext<'_>, state: &OperatorState, index: Val) -> TraceResult<TracedRecord> {
        read_all(t, &self.layout, state, index)
    }
}

/// Finalizes the partial aggregates an aggregation handler emits for closed
/// windows.
///
/// Records leave with the window bounds, the keys and one field per
/// aggregate. Averages divide the sum by the count slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationProbe {
    pub handler: usize,
    /// Layout of the partial records, see
    /// [`AggregationHandler::partial_schema`](crate::windowing::AggregationHandler::partial_schema).
    pub input: MemoryLayout,
    pub keys: Schema,
    pub state: AggregationState,
}

impl AggregationProbe {
    pub fn output_schema(&self) -> Schema {
        let mut schema = Schema::new()
            .with(WINDOW_START, Type::U64)
            .with(WINDOW_END, Type::U64);
        for field in self.keys.fields() {
            schema.push(field.name.clone(), field.ty);
        }
        for aggregate in self.state.aggregates() {
            let ty = aggregate.result_type().unwrap_or(Type::U64);
            schema.push(aggregate.output.clone(), ty);
        }
        schema
    }

    pub(super) fn read(&self, t: &mut TraceContext<'_>, state: &OperatorState, index: Val) -> TraceResult<TracedRecord> {
        let partial = read_all(t, &self.input, state, index)?;
        let mut record = TracedRecord::new();
        for name in [WINDOW_START, WINDOW_END] {
            record.set(name, partial.get(name)?);
        }
        for field in self.keys.fields() {
            record.set(field.name.clone(), partial.get(&field.name)?);
        }

        for (i, aggregate) in self.state.aggregates().iter().enumerate() {
            let (_, slots) = self.state.slots_of(i);
            let value = match (aggregate.function, slots) {
                (AggregationFunction::Avg, [sum, count]) => {
                    let sum = partial.get(&sum.name)?;
                    let count = partial.get(&count.name)?;
                    t.frame(i as u32, |t| {
                        let count = t.cast(count, Type::F64)?;
                        t.div(sum, count)
                    })?
                }
                (_, [slot]) => partial.get(&slot.name)?,
                _ => {
                    return Err(TraceError::UndefinedValue {
                        value: format!("state of {}", aggregate.output),
                    })
                }
            };
            record.set(aggregate.output.clone(), value);
        }
        Ok(record)
    }
}
