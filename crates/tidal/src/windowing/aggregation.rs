use super::{
    output::{advance, BatchWriter},
    ChainedHashMap, MapShape, SliceAssigner, SliceState, SliceStore, SliceStoreStats,
    TriggerBatch, WindowType, WINDOW_END, WINDOW_START,
};
use crate::{
    ir::{eval, BinaryOp, CompareOp},
    memory::{Field, MemoryLayout, Schema},
    pipeline::{
        OperatorHandler, PipelineError, PipelineExecutionContext, PlanError, StateManager,
        WorkerContext,
    },
    types::{Type, Value},
};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    fmt::{self, Display},
    slice,
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};
use tidal_types::{
    config::MemoryLayoutKind,
    query::{OriginId, QueryTerminationType},
};
use tracing::{debug, info};

/// Width of every state slot, whatever the type stored in it.
pub const SLOT_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFunction {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl AggregationFunction {
    /// Type of the final result over inputs of type `input`, `None` if the
    /// function does not apply to it.
    pub const fn result_type(self, input: Type) -> Option<Type> {
        match self {
            Self::Count => Some(Type::U64),
            _ if !input.is_numeric() || matches!(input, Type::Ptr) => None,
            Self::Sum => Some(input.widened()),
            Self::Min | Self::Max => Some(input),
            Self::Avg => Some(Type::F64),
        }
    }

    pub const fn takes_input(self) -> bool {
        !matches!(self, Self::Count)
    }
}

impl Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
        })
    }
}

/// How a tuple updates a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotUpdate {
    /// Adds one.
    Count,
    /// Adds the input, cast to the slot's type.
    Add,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StateSlot {
    pub name: String,
    pub ty: Type,
    pub update: SlotUpdate,
}

impl StateSlot {
    fn new(name: impl Into<String>, ty: Type, update: SlotUpdate) -> Self {
        Self {
            name: name.into(),
            ty,
            update,
        }
    }

    /// Canonical bits of the slot's neutral element.
    fn initial_bits(&self) -> u64 {
        let value = match (self.update, self.ty) {
            (SlotUpdate::Count | SlotUpdate::Add, _) => return 0,
            (SlotUpdate::Min, Type::F32) => Value::F32(f32::INFINITY),
            (SlotUpdate::Min, Type::F64) => Value::F64(f64::INFINITY),
            (SlotUpdate::Max, Type::F32) => Value::F32(f32::NEG_INFINITY),
            (SlotUpdate::Max, Type::F64) => Value::F64(f64::NEG_INFINITY),
            (SlotUpdate::Min, ty) if ty.is_signed_int() => return ty.mask() >> 1,
            (SlotUpdate::Min, ty) => return ty.mask(),
            (SlotUpdate::Max, ty) if ty.is_signed_int() => return ty.mask() ^ (ty.mask() >> 1),
            (SlotUpdate::Max, _) => return 0,
        };
        value.to_bits()
    }

    /// Canonical bits of two partial states combined.
    fn combine(&self, existing: u64, incoming: u64) -> u64 {
        match self.update {
            SlotUpdate::Count | SlotUpdate::Add => {
                eval::binary(BinaryOp::Add, self.ty, existing, incoming)
            }
            SlotUpdate::Min if eval::compare(CompareOp::Lt, self.ty, incoming, existing) => incoming,
            SlotUpdate::Max if eval::compare(CompareOp::Gt, self.ty, incoming, existing) => incoming,
            SlotUpdate::Min | SlotUpdate::Max => existing,
        }
    }
}

/// One aggregate computed by a window aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Aggregate {
    pub function: AggregationFunction,
    /// The aggregated field, absent for `count`.
    pub input: Option<Field>,
    pub output: String,
}

impl Aggregate {
    pub fn result_type(&self) -> Option<Type> {
        self.function
            .result_type(self.input.as_ref().map_or(Type::U64, |field| field.ty))
    }
}

/// Layout of the state kept per group and window.
///
/// Every aggregate owns one or more consecutive slots of [`SLOT_SIZE`]
/// bytes, values are stored little endian in the low bytes of their slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AggregationState {
    aggregates: Vec<Aggregate>,
    slots: Vec<StateSlot>,
    /// Index of the first slot of every aggregate, plus the total
    first_slot: Vec<usize>,
}

impl AggregationState {
    pub fn new(aggregates: Vec<Aggregate>) -> Result<Self, PlanError> {
        let mut slots = Vec::new();
        let mut first_slot = Vec::with_capacity(aggregates.len() + 1);
        for aggregate in &aggregates {
            first_slot.push(slots.len());
            let input = match (&aggregate.input, aggregate.function.takes_input()) {
                (Some(field), true) => field.ty,
                (None, false) => Type::U64,
                (input, _) => {
                    return Err(PlanError::TypeMismatch {
                        message: format!(
                            "{} '{}' {} an input field",
                            aggregate.function,
                            aggregate.output,
                            if input.is_some() { "takes no" } else { "needs" },
                        ),
                    })
                }
            };
            let Some(result) = aggregate.function.result_type(input) else {
                return Err(PlanError::TypeMismatch {
                    message: format!("cannot compute {} over {input}", aggregate.function),
                });
            };

            let output = &aggregate.output;
            match aggregate.function {
                AggregationFunction::Sum => slots.push(StateSlot::new(output, result, SlotUpdate::Add)),
                AggregationFunction::Count => {
                    slots.push(StateSlot::new(output, result, SlotUpdate::Count))
                }
                AggregationFunction::Min => slots.push(StateSlot::new(output, result, SlotUpdate::Min)),
                AggregationFunction::Max => slots.push(StateSlot::new(output, result, SlotUpdate::Max)),
                AggregationFunction::Avg => {
                    slots.push(StateSlot::new(format!("{output}$sum"), Type::F64, SlotUpdate::Add));
                    slots.push(StateSlot::new(
                        format!("{output}$count"),
                        Type::U64,
                        SlotUpdate::Count,
                    ));
                }
            }
        }
        first_slot.push(slots.len());

        Ok(Self {
            aggregates,
            slots,
            first_slot,
        })
    }

    pub fn aggregates(&self) -> &[Aggregate] {
        &self.aggregates
    }

    pub fn slots(&self) -> &[StateSlot] {
        &self.slots
    }

    /// Index of the first slot of aggregate `index` and its slots.
    pub fn slots_of(&self, index: usize) -> (usize, &[StateSlot]) {
        let (first, end) = (self.first_slot[index], self.first_slot[index + 1]);
        (first, &self.slots[first..end])
    }

    pub const fn slot_offset(slot: usize) -> usize {
        slot * SLOT_SIZE
    }

    /// Bytes of state per group.
    pub fn size(&self) -> usize {
        self.slots.len() * SLOT_SIZE
    }

    /// The state of a group that did not see a tuple yet.
    pub fn initial(&self) -> Vec<u8> {
        let mut state = vec![0; self.size()];
        for (index, slot) in self.slots.iter().enumerate() {
            let offset = Self::slot_offset(index);
            Value::from_bits(slot.ty, slot.initial_bits()).write_le(&mut state[offset..]);
        }
        state
    }

    /// Folds the partial state `incoming` into `existing`.
    pub fn combine(&self, existing: &mut [u8], incoming: &[u8]) {
        for (index, slot) in self.slots.iter().enumerate() {
            let offset = Self::slot_offset(index);
            let lhs = Value::read_le(slot.ty, &existing[offset..]).to_bits();
            let rhs = Value::read_le(slot.ty, &incoming[offset..]).to_bits();
            Value::from_bits(slot.ty, slot.combine(lhs, rhs)).write_le(&mut existing[offset..]);
        }
    }

    /// Reads every slot of `state`.
    pub fn read(&self, state: &[u8]) -> Vec<Value> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| Value::read_le(slot.ty, &state[Self::slot_offset(index)..]))
            .collect()
    }
}

/// Window aggregation state shared by the build pipeline, which folds tuples
/// into per worker hash maps, and the probe pipeline, which finalizes the
/// partial results the handler emits for every closed window.
///
/// Emitted records hold the window bounds, the group key and the raw state
/// slots, see [`AggregationHandler::partial_schema`].
pub struct AggregationHandler {
    id: usize,
    window: WindowType,
    origins: Vec<OriginId>,
    keys: Schema,
    state: AggregationState,
    initial: Box<[u8]>,
    output: MemoryLayout,
    store: OnceLock<SliceStore>,
    stopped: AtomicBool,
}

impl AggregationHandler {
    pub fn new(
        id: usize,
        window: WindowType,
        origins: Vec<OriginId>,
        keys: Schema,
        state: AggregationState,
        layout: MemoryLayoutKind,
        buffer_size: usize,
    ) -> Result<Self, PlanError> {
        if !window.is_valid() {
            return Err(PlanError::InvalidWindow {
                window: window.to_string(),
            });
        }
        let output = MemoryLayout::new(layout, Self::partial_schema(&keys, &state), buffer_size)?;
        Ok(Self {
            id,
            window,
            origins,
            initial: state.initial().into_boxed_slice(),
            keys,
            state,
            output,
            store: OnceLock::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// `window_start`, `window_end`, the keys and the state slots.
    pub fn partial_schema(keys: &Schema, state: &AggregationState) -> Schema {
        let mut schema = Schema::new()
            .with(WINDOW_START, Type::U64)
            .with(WINDOW_END, Type::U64);
        for field in keys.fields() {
            schema.push(field.name.clone(), field.ty);
        }
        for slot in state.slots() {
            schema.push(slot.name.clone(), slot.ty);
        }
        schema
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    pub const fn window(&self) -> WindowType {
        self.window
    }

    pub const fn keys(&self) -> &Schema {
        &self.keys
    }

    pub fn key_size(&self) -> usize {
        self.keys.record_size()
    }

    pub const fn state(&self) -> &AggregationState {
        &self.state
    }

    /// Layout of the buffers the handler emits.
    pub const fn output_layout(&self) -> &MemoryLayout {
        &self.output
    }

    pub fn stats(&self) -> Option<SliceStoreStats> {
        self.store.get().map(SliceStore::stats)
    }

    /// The state of the group keyed by the `key_size()` bytes at `key` in
    /// the slice holding `ts`, `None` for late tuples.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` readable bytes. The returned state
    /// may only be written until the worker's pins are released.
    pub(crate) unsafe fn find_or_insert(
        &self,
        worker: &mut WorkerContext,
        handler: usize,
        ts: u64,
        key: *const u8,
    ) -> Result<Option<*mut u8>, PipelineError> {
        let store = self
            .store
            .get()
            .ok_or(PipelineError::HandlerNotReady { handler })?;
        let key = slice::from_raw_parts(key, self.key_size());
        let worker_id = worker.worker_id();
        Ok(worker.pin(handler, store, ts).map(|slice| {
            let map = slice.map_mut(0, worker_id);
            map.find_or_insert(key, &self.initial).0.as_mut_ptr()
        }))
    }

    /// Merges the per worker maps of every slice of a window.
    fn merge(&self, window: &super::ClosedWindow) -> Option<ChainedHashMap> {
        let mut merged: Option<ChainedHashMap> = None;
        for slice in &window.slices {
            // Safety: the batch waited for all writers and closing slices
            // cannot be pinned anymore
            for map in unsafe { slice.maps(0) } {
                merged
                    .get_or_insert_with(|| map.empty_like())
                    .merge(map, |existing, incoming| self.state.combine(existing, incoming));
            }
        }
        merged
    }

    fn emit(&self, ctx: &PipelineExecutionContext, batch: &TriggerBatch) -> Result<(), PipelineError> {
        let mut writer = BatchWriter::new(ctx, &self.output);
        let mut values = Vec::with_capacity(self.output.schema().len());
        let mut groups = 0;
        for window in &batch.windows {
            let Some(merged) = self.merge(window) else {
                continue;
            };
            for (key, state) in merged.entries() {
                values.clear();
                values.push(Value::U64(window.start));
                values.push(Value::U64(window.end));
                let mut offset = 0;
                for field in self.keys.fields() {
                    values.push(Value::read_le(field.ty, &key[offset..]));
                    offset += field.ty.size();
                }
                values.extend(self.state.read(state));
                writer.push(&values)?;
                groups += 1;
            }
        }
        debug!(
            "aggregation {} emits {groups} groups of {} windows at watermark {}",
            self.id,
            batch.windows.len(),
            batch.watermark,
        );
        writer.finish(OriginId::for_handler(self.id), batch.sequence, batch.watermark)
    }

    /// `(start, end, state)` of the slices, empty before setup.
    pub fn slice_states(&self) -> Vec<(u64, u64, SliceState)> {
        self.store.get().map(SliceStore::slices).unwrap_or_default()
    }
}

impl OperatorHandler for AggregationHandler {
    fn setup(
        &self,
        _ctx: &PipelineExecutionContext,
        state: &mut StateManager,
        local_state_variable_id: usize,
    ) -> Result<(), PipelineError> {
        let key_size = self.key_size();
        state.register_scratch(
            local_state_variable_id,
            key_size.div_ceil(SLOT_SIZE) * SLOT_SIZE + self.state.size(),
        );
        let store = SliceStore::new(
            SliceAssigner::new(self.window),
            vec![MapShape::new(key_size, self.state.size())],
            self.origins.iter().copied(),
            state.workers(),
            state.slice_store_config().clone(),
        );
        if self.store.set(store).is_ok() {
            info!(
                "set up aggregation {} over {} windows for {} origins",
                self.id,
                self.window,
                self.origins.len(),
            );
        }
        Ok(())
    }

    fn trigger(
        &self,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> Result<(), PipelineError> {
        let store = self
            .store
            .get()
            .ok_or(PipelineError::HandlerNotReady { handler: self.id })?;
        let Some(batch) = advance(store, worker) else {
            return Ok(());
        };
        let result = self.emit(ctx, &batch);
        store.finish(batch);
        result
    }

    fn stop(
        &self,
        termination: QueryTerminationType,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), PipelineError> {
        let Some(store) = self.store.get() else {
            return Ok(());
        };
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if termination != QueryTerminationType::Graceful {
            debug!("aggregation {} discards its state on {termination:?}", self.id);
            store.clear();
            return Ok(());
        }
        let Some(batch) = store.flush() else {
            return Ok(());
        };
        batch.wait_for_writers();
        let result = self.emit(ctx, &batch);
        store.finish(batch);
        result
    }

    fn late_tuples(&self) -> u64 {
        self.store.get().map_or(0, SliceStore::late_tuples)
    }

    fn slices(&self) -> Vec<(u64, u64, SliceState)> {
        self.slice_states()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
