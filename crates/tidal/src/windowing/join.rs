use super::{
    output::{advance, BatchWriter},
    ChainedHashMap, ClosedWindow, MapShape, SliceAssigner, SliceState, SliceStore,
    SliceStoreStats, TriggerBatch, WindowType, WINDOW_END, WINDOW_START,
};
use crate::{
    memory::{MemoryLayout, Schema},
    pipeline::{
        OperatorHandler, PipelineError, PipelineExecutionContext, PlanError, StateManager,
        WorkerContext,
    },
    types::{Type, Value},
};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSide {
    Left,
    Right,
}

impl JoinSide {
    /// Index of the side's hash maps within a slice.
    pub const fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }

    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Left),
            1 => Some(Self::Right),
            _ => None,
        }
    }
}

/// One input of a join: its schema and the positions of its key fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JoinInput {
    pub schema: Schema,
    pub keys: Vec<usize>,
}

impl JoinInput {
    pub fn new(schema: Schema, keys: &[String]) -> Result<Self, PlanError> {
        let keys = keys
            .iter()
            .map(|key| {
                schema.index_of(key).ok_or_else(|| PlanError::UnknownField {
                    field: key.clone(),
                    schema: schema.to_string(),
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { schema, keys })
    }

    /// The key fields packed in key order.
    pub fn key_schema(&self) -> Schema {
        self.keys
            .iter()
            .map(|&index| self.schema.field(index).clone())
            .collect()
    }

    fn non_keys(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.schema.len()).filter(|index| !self.keys.contains(index))
    }
}

/// Decodes packed records of one join input.
#[derive(Debug, Clone)]
struct RecordReader {
    types: Vec<Type>,
    offsets: Vec<usize>,
}

impl RecordReader {
    fn new(schema: &Schema) -> Self {
        Self {
            types: schema.fields().iter().map(|field| field.ty).collect(),
            offsets: schema.packed_offsets(),
        }
    }

    fn read(&self, record: &[u8], field: usize) -> Value {
        Value::read_le(self.types[field], &record[self.offsets[field]..])
    }
}

/// Window join state.
///
/// Both build pipelines insert complete records, keyed by their join key,
/// into the map of their side. When a window closes, the left entries of all
/// its slices form the build side and every right entry probes it for
/// matching keys.
///
/// Joined records hold the window bounds, the left keys, the remaining left
/// fields and then the remaining right fields. Right fields whose name is
/// already taken are prefixed with `right_`.
pub struct JoinHandler {
    id: usize,
    window: WindowType,
    origins: Vec<OriginId>,
    left: JoinInput,
    right: JoinInput,
    readers: [RecordReader; 2],
    key_size: usize,
    empty: Box<[u8]>,
    output: MemoryLayout,
    store: OnceLock<SliceStore>,
    stopped: AtomicBool,
}

impl JoinHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        window: WindowType,
        origins: Vec<OriginId>,
        left: JoinInput,
        right: JoinInput,
        layout: MemoryLayoutKind,
        buffer_size: usize,
    ) -> Result<Self, PlanError> {
        if !window.is_valid() {
            return Err(PlanError::InvalidWindow {
                window: window.to_string(),
            });
        }
        let (left_keys, right_keys) = (left.key_schema(), right.key_schema());
        let left_types: Vec<_> = left_keys.fields().iter().map(|field| field.ty).collect();
        let right_types: Vec<_> = right_keys.fields().iter().map(|field| field.ty).collect();
        if left_types != right_types {
            return Err(PlanError::JoinKeyMismatch {
                message: format!("{left_keys} cannot be compared with {right_keys}"),
            });
        }

        let output = MemoryLayout::new(layout, Self::output_schema(&left, &right)?, buffer_size)?;
        let value_size = left.schema.record_size().max(right.schema.record_size());
        Ok(Self {
            id,
            window,
            origins,
            readers: [RecordReader::new(&left.schema), RecordReader::new(&right.schema)],
            key_size: left_keys.record_size(),
            empty: vec![0; value_size].into_boxed_slice(),
            left,
            right,
            output,
            store: OnceLock::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Schema of the joined records.
    pub fn output_schema(left: &JoinInput, right: &JoinInput) -> Result<Schema, PlanError> {
        let mut schema = Schema::new()
            .with(WINDOW_START, Type::U64)
            .with(WINDOW_END, Type::U64);
        let left_fields = left.keys.iter().copied().chain(left.non_keys());
        for index in left_fields {
            let field = left.schema.field(index);
            if schema.contains(&field.name) {
                return Err(PlanError::DuplicateField {
                    field: field.name.clone(),
                    schema: schema.to_string(),
                });
            }
            schema.push(field.name.clone(), field.ty);
        }
        for index in right.non_keys() {
            let field = right.schema.field(index);
            let name = if schema.contains(&field.name) {
                format!("right_{}", field.name)
            } else {
                field.name.clone()
            };
            if schema.contains(&name) {
                return Err(PlanError::DuplicateField {
                    field: name,
                    schema: schema.to_string(),
                });
            }
            schema.push(name, field.ty);
        }
        Ok(schema)
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    pub const fn window(&self) -> WindowType {
        self.window
    }

    pub const fn input(&self, side: JoinSide) -> &JoinInput {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    pub const fn key_size(&self) -> usize {
        self.key_size
    }

    pub const fn output_layout(&self) -> &MemoryLayout {
        &self.output
    }

    pub fn stats(&self) -> Option<SliceStoreStats> {
        self.store.get().map(SliceStore::stats)
    }

    /// A zeroed entry for `key` in the map of `side` of the slice holding
    /// `ts`, `None` for late tuples. The caller writes the packed record of
    /// its side into it.
    ///
    /// # Safety
    ///
    /// `key` must point to `key_size()` readable bytes. The returned entry
    /// may only be written until the worker's pins are released.
    pub(crate) unsafe fn insert(
        &self,
        worker: &mut WorkerContext,
        handler: usize,
        side: usize,
        ts: u64,
        key: *const u8,
    ) -> Result<Option<*mut u8>, PipelineError> {
        let store = self
            .store
            .get()
            .ok_or(PipelineError::HandlerNotReady { handler })?;
        let side = JoinSide::from_index(side).ok_or(PipelineError::UnknownHandler { handler })?;
        let value_size = self.input(side).schema.record_size();
        let key = slice::from_raw_parts(key, self.key_size);
        let worker_id = worker.worker_id();
        Ok(worker.pin(handler, store, ts).map(|slice| {
            let map = slice.map_mut(side.index(), worker_id);
            map.insert(key, &self.empty[..value_size]).as_mut_ptr()
        }))
    }

    /// Every left entry of the window's slices.
    fn build_side(window: &ClosedWindow) -> Option<ChainedHashMap> {
        let mut build: Option<ChainedHashMap> = None;
        for slice in &window.slices {
            // Safety: the batch waited for all writers and closing slices
            // cannot be pinned anymore
            for map in unsafe { slice.maps(JoinSide::Left.index()) } {
                build.get_or_insert_with(|| map.empty_like()).append(map);
            }
        }
        build.filter(|build| !build.is_empty())
    }

    fn emit(&self, ctx: &PipelineExecutionContext, batch: &TriggerBatch) -> Result<(), PipelineError> {
        let mut writer = BatchWriter::new(ctx, &self.output);
        let mut values = Vec::with_capacity(self.output.schema().len());
        let [left_reader, right_reader] = &self.readers;
        let mut joined = 0;
        for window in &batch.windows {
            let Some(build) = Self::build_side(window) else {
                continue;
            };
            for slice in &window.slices {
                for map in unsafe { slice.maps(JoinSide::Right.index()) } {
                    for (key, right) in map.entries() {
                        for left in build.matches(key) {
                            values.clear();
                            values.push(Value::U64(window.start));
                            values.push(Value::U64(window.end));
                            let left_fields = self.left.keys.iter().copied().chain(self.left.non_keys());
                            values.extend(left_fields.map(|field| left_reader.read(left, field)));
                            values.extend(self.right.non_keys().map(|field| right_reader.read(right, field)));
                            writer.push(&values)?;
                            joined += 1;
                        }
                    }
                }
            }
        }
        debug!(
            "join {} emits {joined} records of {} windows at watermark {}",
            self.id,
            batch.windows.len(),
            batch.watermark,
        );
        writer.finish(OriginId::for_handler(self.id), batch.sequence, batch.watermark)
    }

    pub fn slice_states(&self) -> Vec<(u64, u64, SliceState)> {
        self.store.get().map(SliceStore::slices).unwrap_or_default()
    }
}

impl OperatorHandler for JoinHandler {
    fn setup(
        &self,
        _ctx: &PipelineExecutionContext,
        state: &mut StateManager,
        local_state_variable_id: usize,
    ) -> Result<(), PipelineError> {
        state.register_scratch(
            local_state_variable_id,
            self.key_size.div_ceil(8) * 8 + self.empty.len(),
        );
        let store = SliceStore::new(
            SliceAssigner::new(self.window),
            vec![
                MapShape::new(self.key_size, self.left.schema.record_size()),
                MapShape::new(self.key_size, self.right.schema.record_size()),
            ],
            self.origins.iter().copied(),
            state.workers(),
            state.slice_store_config().clone(),
        );
        if self.store.set(store).is_ok() {
            info!("set up join {} over {} windows", self.id, self.window);
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
            debug!("join {} discards its state on {termination:?}", self.id);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{Record, SequenceData, TupleBuffer},
        pipeline::context::testing::*,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tidal_types::config::SliceStoreConfig;

    fn handler() -> JoinHandler {
        let left = Schema::new()
            .with("k", Type::U64)
            .with("ts", Type::U64)
            .with("left", Type::I32);
        let right = Schema::new()
            .with("ts", Type::U64)
            .with("k", Type::U64)
            .with("right", Type::I32);
        JoinHandler::new(
            0,
            WindowType::Tumbling { size: 1000 },
            vec![OriginId(1), OriginId(2)],
            JoinInput::new(left, &["k".to_owned()]).unwrap(),
            JoinInput::new(right, &["k".to_owned()]).unwrap(),
            MemoryLayoutKind::Row,
            256,
        )
        .unwrap()
    }

    fn insert(handler: &JoinHandler, worker: &mut WorkerContext, side: JoinSide, values: &[Value]) {
        let input = handler.input(side);
        let reader = RecordReader::new(&input.schema);
        let key = values[input.keys[0]].to_bits().to_le_bytes();
        let ts = values[input.schema.index_of("ts").unwrap()].as_u64().unwrap();
        let entry = unsafe { handler.insert(worker, 0, side.index(), ts, key.as_ptr()) }
            .unwrap()
            .expect("tuple is not late");
        let entry = unsafe { slice::from_raw_parts_mut(entry, input.schema.record_size()) };
        for (field, value) in values.iter().enumerate() {
            value.write_le(&mut entry[reader.offsets[field]..]);
        }
    }

    #[test]
    fn output_schema_renames_collisions() {
        let handler = handler();
        let names: Vec<_> = handler
            .output_layout()
            .schema()
            .fields()
            .iter()
            .map(|field| field.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["window_start", "window_end", "k", "ts", "left", "right_ts", "right"]
        );
    }

    #[test]
    fn key_types_must_match() {
        let left = JoinInput::new(Schema::new().with("k", Type::U64), &["k".to_owned()]).unwrap();
        let right = JoinInput::new(Schema::new().with("k", Type::I32), &["k".to_owned()]).unwrap();
        let result = JoinHandler::new(
            0,
            WindowType::Tumbling { size: 10 },
            vec![],
            left,
            right,
            MemoryLayoutKind::Row,
            64,
        );
        assert!(matches!(result, Err(PlanError::JoinKeyMismatch { .. })));
        assert!(matches!(
            JoinInput::new(Schema::new(), &["k".to_owned()]),
            Err(PlanError::UnknownField { .. })
        ));
    }

    #[test]
    fn matching_keys_join_when_the_window_closes() {
        let dispatch = Arc::new(CollectingDispatch::default());
        let handler = Arc::new(handler());
        let ctx = context(vec![handler.clone()], dispatch.clone(), 256);
        let mut state = StateManager::new(2, SliceStoreConfig::default());
        handler.setup(&ctx, &mut state, 0).unwrap();
        let mut left_worker = WorkerContext::new(0, &state);
        let mut right_worker = WorkerContext::new(1, &state);

        let left_input = TupleBuffer::unpooled(16);
        left_input.set_origin_id(OriginId(1));
        left_input.set_sequence_data(SequenceData::single(1));
        left_input.set_watermark(1000);
        left_worker.begin(&left_input);
        insert(&handler, &mut left_worker, JoinSide::Left, &[Value::U64(1), Value::U64(10), Value::I32(5)]);
        insert(&handler, &mut left_worker, JoinSide::Left, &[Value::U64(2), Value::U64(20), Value::I32(6)]);
        handler.trigger(&ctx, &mut left_worker).unwrap();
        // The right origin holds the watermark back
        assert!(dispatch.take().is_empty());

        let right_input = TupleBuffer::unpooled(16);
        right_input.set_origin_id(OriginId(2));
        right_input.set_sequence_data(SequenceData::single(1));
        right_input.set_watermark(1000);
        right_worker.begin(&right_input);
        insert(&handler, &mut right_worker, JoinSide::Right, &[Value::U64(30), Value::U64(1), Value::I32(9)]);
        insert(&handler, &mut right_worker, JoinSide::Right, &[Value::U64(40), Value::U64(3), Value::I32(7)]);
        handler.trigger(&ctx, &mut right_worker).unwrap();

        let emitted = dispatch.take();
        assert_eq!(emitted.len(), 1);
        let records = handler.output_layout().bind(&emitted[0]).unwrap().records().unwrap();
        assert_eq!(
            records,
            vec![Record::new()
                .with("window_start", 0u64)
                .with("window_end", 1000u64)
                .with("k", 1u64)
                .with("ts", 10u64)
                .with("left", 5i32)
                .with("right_ts", 30u64)
                .with("right", 9i32)]
        );
        assert!(handler.slices().is_empty());

        handler.stop(QueryTerminationType::Graceful, &ctx).unwrap();
        let flushed = dispatch.take();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].num_tuples(), 0);
        assert_eq!(flushed[0].sequence_number(), 2);
    }
}
