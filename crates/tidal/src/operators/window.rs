use super::{ExecutionContext, Flow, OperatorState, TracedRecord};
use crate::{
    ir::CompareOp,
    memory::Schema,
    trace::{TraceContext, TraceError, TraceResult, Val},
    types::Type,
    windowing::{AggregationState, JoinSide, SlotUpdate, TimeCharacteristic},
};
use serde::Serialize;

pub(super) fn open_window(
    ctx: &ExecutionContext,
    t: &mut TraceContext<'_>,
    handler: usize,
    time: &TimeCharacteristic,
) -> TraceResult<OperatorState> {
    let scratch = ctx.scratch(t, handler)?;
    let ingestion_ts = match time {
        TimeCharacteristic::IngestionTime => Some(ctx.creation_ts(t)?),
        TimeCharacteristic::EventTime { .. } => None,
    };
    Ok(OperatorState::Window {
        scratch,
        ingestion_ts,
    })
}

fn window_state(state: &OperatorState) -> TraceResult<(Val, Option<Val>)> {
    match *state {
        OperatorState::Window {
            scratch,
            ingestion_ts,
        } => Ok((scratch, ingestion_ts)),
        _ => Err(TraceError::UndefinedValue {
            value: "window scratch memory".to_owned(),
        }),
    }
}

/// Packs the key fields of `record` into the key region of the scratch
/// memory.
fn write_key(
    ctx: &ExecutionContext,
    t: &mut TraceContext<'_>,
    keys: &Schema,
    scratch: Val,
    record: &TracedRecord,
) -> TraceResult<()> {
    let offsets = keys.packed_offsets();
    for (i, field) in keys.fields().iter().enumerate() {
        let value = record.get(&field.name)?;
        t.frame(i as u32, |t| {
            let address = ctx.offset(t, scratch, offsets[i])?;
            t.store(address, value)
        })?;
    }
    Ok(())
}

fn timestamp(
    t: &mut TraceContext<'_>,
    time: &TimeCharacteristic,
    ingestion_ts: Option<Val>,
    record: &TracedRecord,
) -> TraceResult<Val> {
    match (time, ingestion_ts) {
        (TimeCharacteristic::EventTime { field }, _) => {
            let ts = record.get(field)?;
            t.cast(ts, Type::U64)
        }
        (TimeCharacteristic::IngestionTime, Some(ts)) => Ok(ts),
        (TimeCharacteristic::IngestionTime, None) => Err(TraceError::UndefinedValue {
            value: "ingestion timestamp".to_owned(),
        }),
    }
}

/// Folds records into the per worker state of their window slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationBuild {
    pub handler: usize,
    pub time: TimeCharacteristic,
    pub keys: Schema,
    pub state: AggregationState,
}

impl AggregationBuild {
    pub(super) fn execute(
        &self,
        ctx: &ExecutionContext,
        t: &mut TraceContext<'_>,
        state: &OperatorState,
        record: &mut TracedRecord,
    ) -> TraceResult<Flow> {
        let (scratch, ingestion_ts) = window_state(state)?;
        write_key(ctx, t, &self.keys, scratch, record)?;
        let ts = timestamp(t, &self.time, ingestion_ts, record)?;
        let group = ctx.find_or_insert(t, self.handler, ts, scratch)?;

        for (a, aggregate) in self.state.aggregates().iter().enumerate() {
            let (first, slots) = self.state.slots_of(a);
            for (j, slot) in slots.iter().enumerate() {
                let index = first + j;
                let input = match (&aggregate.input, slot.update) {
                    (Some(input), SlotUpdate::Add | SlotUpdate::Min | SlotUpdate::Max) => {
                        Some(record.get(&input.name)?)
                    }
                    _ => None,
                };
                t.frame(index as u32, |t| {
                    let address = ctx.offset(t, group, AggregationState::slot_offset(index))?;
                    let current = t.load(address, slot.ty)?;
                    let input = match input {
                        Some(input) => t.cast(input, slot.ty)?,
                        None => t.const_bits(slot.ty, 1)?,
                    };
                    match slot.update {
                        SlotUpdate::Count | SlotUpdate::Add => {
                            let updated = t.add(current, input)?;
                            t.store(address, updated)
                        }
                        SlotUpdate::Min | SlotUpdate::Max => {
                            let op = if slot.update == SlotUpdate::Min {
                                CompareOp::Lt
                            } else {
                                CompareOp::Gt
                            };
                            let replaces = t.compare(op, input, current)?;
                            if t.branch(replaces)? {
                                t.store(address, input)?;
                            }
                            Ok(())
                        }
                    }
                })?;
            }
        }
        Ok(Flow::Continue)
    }
}

/// Inserts the records of one join input into the per worker state of
/// their window slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinBuild {
    pub handler: usize,
    pub side: JoinSide,
    pub time: TimeCharacteristic,
    pub keys: Schema,
    /// Every field of the input, stored packed
    pub schema: Schema,
}

impl JoinBuild {
    pub(super) fn execute(
        &self,
        ctx: &ExecutionContext,
        t: &mut TraceContext<'_>,
        state: &OperatorState,
        record: &mut TracedRecord,
    ) -> TraceResult<Flow> {
        let (scratch, ingestion_ts) = window_state(state)?;
        write_key(ctx, t, &self.keys, scratch, record)?;
        let ts = timestamp(t, &self.time, ingestion_ts, record)?;
        let entry = ctx.join_insert(t, self.handler, self.side.index(), ts, scratch)?;

        let offsets = self.schema.packed_offsets();
        for (i, field) in self.schema.fields().iter().enumerate() {
            let value = record.get(&field.name)?;
            t.frame(i as u32, |t| {
                let address = ctx.offset(t, entry, offsets[i])?;
                t.store(address, value)
            })?;
        }
        Ok(Flow::Continue)
    }
}
