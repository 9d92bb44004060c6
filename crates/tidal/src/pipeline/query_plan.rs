use super::{
    plan::{AggregationDescriptor, PhysicalOperatorNode},
    OperatorHandler, PipelineBuilder, PlanError,
};
use crate::{
    memory::{Field, MemoryLayout, Schema},
    operators::{
        check_timestamp_field, AggregationBuild, AggregationProbe, Emit, JoinBuild, JoinProbe, Map,
        PhysicalOperator, Scan, Selection, WatermarkAssignment,
    },
    windowing::{
        Aggregate, AggregationHandler, AggregationState, JoinHandler, JoinInput, JoinSide,
        TimeCharacteristic,
    },
};
use itertools::Itertools;
use serde::Serialize;
use std::{
    collections::HashSet,
    fmt::{self, Debug, Display},
    sync::Arc,
};
use tidal_types::{
    config::{BufferPoolConfig, EngineConfig, MemoryLayoutKind},
    query::{OriginId, PipelineId, QueryId},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Reads the buffers of a source. A plan without pipeline breakers is a
    /// single source pipeline.
    Source { origin: OriginId },
    Intermediate,
    /// Emits into the query's sink.
    Sink,
}

/// One compiled unit of a query: a chain of operators from a source operator
/// to a sink operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub kind: PipelineKind,
    pub operators: Vec<PhysicalOperator>,
    /// Pipelines receiving the buffers this one emits, directly or through
    /// its window handler.
    pub successors: Vec<PipelineId>,
    pub predecessors: Vec<PipelineId>,
}

impl Pipeline {
    /// Layout of the buffers the pipeline consumes.
    pub fn input_layout(&self) -> Option<&MemoryLayout> {
        self.operators.first().and_then(PhysicalOperator::input_layout)
    }

    /// Layout of the buffers the pipeline emits, `None` if it ends in a
    /// window build.
    pub fn output_layout(&self) -> Option<&MemoryLayout> {
        match self.operators.last() {
            Some(PhysicalOperator::Emit(emit)) => Some(&emit.layout),
            _ => None,
        }
    }

    /// The window handler the pipeline builds into.
    pub fn handler(&self) -> Option<usize> {
        self.operators.last().and_then(PhysicalOperator::handler)
    }

    pub fn is_sink(&self) -> bool {
        self.successors.is_empty()
    }
}

impl Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PipelineKind::Source { origin } => write!(f, "{} (source {origin}): ", self.id)?,
            PipelineKind::Intermediate => write!(f, "{} (intermediate): ", self.id)?,
            PipelineKind::Sink => write!(f, "{} (sink): ", self.id)?,
        }
        write!(f, "{}", self.operators.iter().join(" -> "))?;
        if !self.successors.is_empty() {
            write!(f, " => {}", self.successors.iter().join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Size of the buffers every layout is computed for.
    pub buffer_size: usize,
    /// Layout of the buffers pipelines emit, unless swapped.
    pub layout: MemoryLayoutKind,
}

impl PlanOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            buffer_size: config.buffer_pool.buffer_size,
            layout: config.layout,
        }
    }
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            buffer_size: BufferPoolConfig::default().buffer_size,
            layout: MemoryLayoutKind::default(),
        }
    }
}

/// A pipeline whose sink operator is not known yet.
struct OpenPipeline {
    kind: PipelineKind,
    builder: PipelineBuilder,
    /// Schema of the records leaving the last appended operator
    schema: Schema,
    layout: MemoryLayoutKind,
    origins: Vec<OriginId>,
    predecessors: Vec<usize>,
}

impl OpenPipeline {
    fn append(&mut self, operator: PhysicalOperator) -> Result<(), PlanError> {
        self.builder.append_operator(operator)?;
        Ok(())
    }
}

struct ClosedPipeline {
    kind: PipelineKind,
    operators: Vec<PhysicalOperator>,
    predecessors: Vec<usize>,
}

/// Cuts an operator tree into pipelines, children first.
struct Lowering<'a> {
    options: &'a PlanOptions,
    pipelines: Vec<ClosedPipeline>,
    handlers: Vec<Arc<dyn OperatorHandler>>,
    origins: HashSet<OriginId>,
}

impl Lowering<'_> {
    /// Every origin may feed the plan once, otherwise watermarks and
    /// sequence numbers of different inputs would get mixed up.
    fn claim_origin(&mut self, origin: OriginId) -> Result<(), PlanError> {
        if self.origins.insert(origin) {
            Ok(())
        } else {
            Err(PlanError::DuplicateOrigin { origin })
        }
    }

    fn layout(&self, kind: MemoryLayoutKind, schema: Schema) -> Result<MemoryLayout, PlanError> {
        check_unique_fields(&schema)?;
        Ok(MemoryLayout::new(kind, schema, self.options.buffer_size)?)
    }

    fn start(
        kind: PipelineKind,
        source: PhysicalOperator,
        origins: Vec<OriginId>,
        predecessors: Vec<usize>,
    ) -> Result<OpenPipeline, PlanError> {
        let layout = source
            .input_layout()
            .map(MemoryLayout::kind)
            .unwrap_or_default();
        let schema = source.output_schema(&Schema::new());
        let mut builder = PipelineBuilder::new();
        builder.append_source(source)?;
        Ok(OpenPipeline {
            kind,
            builder,
            schema,
            layout,
            origins,
            predecessors,
        })
    }

    fn close(&mut self, mut open: OpenPipeline, sink: PhysicalOperator) -> Result<usize, PlanError> {
        open.builder.append_sink(sink)?;
        self.pipelines.push(ClosedPipeline {
            kind: open.kind,
            operators: open.builder.finish()?,
            predecessors: open.predecessors,
        });
        Ok(self.pipelines.len() - 1)
    }

    fn lower(&mut self, node: &PhysicalOperatorNode) -> Result<OpenPipeline, PlanError> {
        match node {
            PhysicalOperatorNode::Source { origin, schema } => {
                self.claim_origin(*origin)?;
                let layout = self.layout(self.options.layout, schema.clone())?;
                Self::start(
                    PipelineKind::Source { origin: *origin },
                    PhysicalOperator::Scan(Scan::new(layout)),
                    vec![*origin],
                    Vec::new(),
                )
            }

            PhysicalOperatorNode::Selection { input, predicate } => {
                let mut open = self.lower(input)?;
                let selection = Selection::new(predicate.clone(), &open.schema)?;
                open.append(PhysicalOperator::Selection(selection))?;
                Ok(open)
            }

            PhysicalOperatorNode::Map {
                input,
                field,
                expression,
            } => {
                let mut open = self.lower(input)?;
                let map = Map::new(field.clone(), expression.clone(), &open.schema)?;
                open.schema = map.output_schema(&open.schema);
                open.append(PhysicalOperator::Map(map))?;
                Ok(open)
            }

            PhysicalOperatorNode::WatermarkAssignment { input, strategy } => {
                let mut open = self.lower(input)?;
                let watermark = WatermarkAssignment::new(strategy.clone(), &open.schema)?;
                open.append(PhysicalOperator::WatermarkAssignment(watermark))?;
                Ok(open)
            }

            PhysicalOperatorNode::LayoutSwap { input, layout } => {
                let open = self.lower(input)?;
                if open.layout == *layout {
                    return Ok(open);
                }
                let swapped = self.layout(*layout, open.schema.clone())?;
                let origins = open.origins.clone();
                let upstream = self.close(open, PhysicalOperator::Emit(Emit::new(swapped.clone())))?;
                Self::start(
                    PipelineKind::Intermediate,
                    PhysicalOperator::Scan(Scan::new(swapped)),
                    origins,
                    vec![upstream],
                )
            }

            PhysicalOperatorNode::WindowAggregation {
                input,
                window,
                time,
                keys,
                aggregations,
            } => {
                let open = self.lower(input)?;
                check_time(&open.schema, time)?;
                let handler = self.handlers.len();
                let keys: Schema = keys
                    .iter()
                    .map(|key| field_of(&open.schema, key))
                    .collect::<Result<_, _>>()?;
                let aggregates = aggregations
                    .iter()
                    .map(|aggregation| aggregate(&open.schema, aggregation))
                    .collect::<Result<Vec<_>, _>>()?;
                let state = AggregationState::new(aggregates)?;

                let aggregation = AggregationHandler::new(
                    handler,
                    *window,
                    open.origins.clone(),
                    keys.clone(),
                    state.clone(),
                    open.layout,
                    self.options.buffer_size,
                )?;
                check_unique_fields(aggregation.output_layout().schema())?;
                let probe = AggregationProbe {
                    handler,
                    input: aggregation.output_layout().clone(),
                    keys: keys.clone(),
                    state: state.clone(),
                };
                check_unique_fields(&probe.output_schema())?;

                let build = AggregationBuild {
                    handler,
                    time: time.clone(),
                    keys,
                    state,
                };
                let build = self.close(open, PhysicalOperator::AggregationBuild(build))?;
                self.handlers.push(Arc::new(aggregation));

                let origin = OriginId::for_handler(handler);
                self.claim_origin(origin)?;
                Self::start(
                    PipelineKind::Intermediate,
                    PhysicalOperator::AggregationProbe(probe),
                    vec![origin],
                    vec![build],
                )
            }

            PhysicalOperatorNode::WindowJoin {
                left,
                right,
                window,
                left_time,
                right_time,
                left_keys,
                right_keys,
            } => {
                let left = self.lower(left)?;
                let right = self.lower(right)?;
                check_time(&left.schema, left_time)?;
                check_time(&right.schema, right_time)?;
                if left_keys.len() != right_keys.len() {
                    return Err(PlanError::JoinKeyMismatch {
                        message: format!("{} left keys but {} right keys", left_keys.len(), right_keys.len()),
                    });
                }

                let handler = self.handlers.len();
                let left_input = JoinInput::new(left.schema.clone(), left_keys)?;
                let right_input = JoinInput::new(right.schema.clone(), right_keys)?;
                let origins = left.origins.iter().chain(&right.origins).copied().collect();
                let join = JoinHandler::new(
                    handler,
                    *window,
                    origins,
                    left_input.clone(),
                    right_input.clone(),
                    left.layout,
                    self.options.buffer_size,
                )?;
                let probe = JoinProbe {
                    handler,
                    layout: join.output_layout().clone(),
                };

                let mut builds = Vec::with_capacity(2);
                for (side, open, input, time) in [
                    (JoinSide::Left, left, left_input, left_time),
                    (JoinSide::Right, right, right_input, right_time),
                ] {
                    let build = JoinBuild {
                        handler,
                        side,
                        time: time.clone(),
                        keys: input.key_schema(),
                        schema: input.schema,
                    };
                    builds.push(self.close(open, PhysicalOperator::JoinBuild(build))?);
                }
                self.handlers.push(Arc::new(join));

                let origin = OriginId::for_handler(handler);
                self.claim_origin(origin)?;
                Self::start(
                    PipelineKind::Intermediate,
                    PhysicalOperator::JoinProbe(probe),
                    vec![origin],
                    builds,
                )
            }

            PhysicalOperatorNode::Sink { .. } => Err(PlanError::InvalidPlan {
                message: "a sink can only be the root of a plan".to_owned(),
            }),
        }
    }
}

fn check_unique_fields(schema: &Schema) -> Result<(), PlanError> {
    match schema.fields().iter().map(|field| &field.name).duplicates().next() {
        Some(field) => Err(PlanError::DuplicateField {
            field: field.clone(),
            schema: schema.to_string(),
        }),
        None => Ok(()),
    }
}

fn check_time(schema: &Schema, time: &TimeCharacteristic) -> Result<(), PlanError> {
    match time {
        TimeCharacteristic::EventTime { field } => check_timestamp_field(schema, field),
        TimeCharacteristic::IngestionTime => Ok(()),
    }
}

fn field_of(schema: &Schema, name: &str) -> Result<Field, PlanError> {
    schema
        .get(name)
        .cloned()
        .ok_or_else(|| PlanError::UnknownField {
            field: name.to_owned(),
            schema: schema.to_string(),
        })
}

fn aggregate(schema: &Schema, descriptor: &AggregationDescriptor) -> Result<Aggregate, PlanError> {
    Ok(Aggregate {
        function: descriptor.function,
        input: descriptor
            .field
            .as_deref()
            .map(|field| field_of(schema, field))
            .transpose()?,
        output: descriptor.output.clone(),
    })
}

/// A query cut into pipelines, ready to be compiled.
///
/// Pipelines are numbered in the order they are closed while walking the
/// operator tree children first, so the same tree always yields the same
/// pipelines with the same ids. Every pipeline comes before its successors.
pub struct PipelinedQueryPlan {
    query_id: QueryId,
    pipelines: Vec<Pipeline>,
    handlers: Vec<Arc<dyn OperatorHandler>>,
}

impl PipelinedQueryPlan {
    pub fn build(
        query_id: QueryId,
        root: &PhysicalOperatorNode,
        options: &PlanOptions,
    ) -> Result<Self, PlanError> {
        let PhysicalOperatorNode::Sink { input } = root else {
            return Err(PlanError::InvalidPlan {
                message: format!("the root of a plan must be a sink, not a {}", root.kind()),
            });
        };

        let mut lowering = Lowering {
            options,
            pipelines: Vec::new(),
            handlers: Vec::new(),
            origins: HashSet::new(),
        };
        let open = lowering.lower(input)?;
        let layout = lowering.layout(open.layout, open.schema.clone())?;
        lowering.close(open, PhysicalOperator::Emit(Emit::new(layout)))?;

        let id = |index: usize| PipelineId(index as u64 + 1);
        let mut pipelines: Vec<Pipeline> = lowering
            .pipelines
            .iter()
            .enumerate()
            .map(|(index, closed)| Pipeline {
                id: id(index),
                kind: closed.kind,
                operators: closed.operators.clone(),
                successors: Vec::new(),
                predecessors: closed.predecessors.iter().map(|&p| id(p)).collect(),
            })
            .collect();
        for (index, closed) in lowering.pipelines.iter().enumerate() {
            for &predecessor in &closed.predecessors {
                pipelines[predecessor].successors.push(id(index));
            }
        }
        for pipeline in &mut pipelines {
            if pipeline.successors.is_empty() && pipeline.kind == PipelineKind::Intermediate {
                pipeline.kind = PipelineKind::Sink;
            }
        }

        debug!(
            "lowered {query_id} into {} pipelines with {} handlers",
            pipelines.len(),
            lowering.handlers.len(),
        );
        Ok(Self {
            query_id,
            pipelines,
            handlers: lowering.handlers,
        })
    }

    pub const fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn pipeline(&self, id: PipelineId) -> Option<&Pipeline> {
        let index = usize::try_from(id.get()).ok()?.checked_sub(1)?;
        self.pipelines.get(index)
    }

    pub fn source_pipelines(&self) -> impl Iterator<Item = (OriginId, &Pipeline)> {
        self.pipelines
            .iter()
            .filter_map(|pipeline| match pipeline.kind {
                PipelineKind::Source { origin } => Some((origin, pipeline)),
                _ => None,
            })
    }

    /// The pipeline emitting into the query's sink.
    pub fn sink_pipeline(&self) -> Option<&Pipeline> {
        self.pipelines.iter().find(|pipeline| pipeline.is_sink())
    }

    pub fn handlers(&self) -> &[Arc<dyn OperatorHandler>] {
        &self.handlers
    }

    /// The first pipeline building into `handler`, whose context the handler
    /// is set up and stopped with.
    pub fn handler_owner(&self, handler: usize) -> Option<&Pipeline> {
        self.pipelines
            .iter()
            .find(|pipeline| pipeline.handler() == Some(handler))
    }
}

impl Debug for PipelinedQueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelinedQueryPlan")
            .field("query_id", &self.query_id)
            .field("pipelines", &self.pipelines)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Display for PipelinedQueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.query_id)?;
        for pipeline in &self.pipelines {
            writeln!(f, "  {pipeline}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        operators::Expression,
        types::Type,
        windowing::{WindowType, WINDOW_END, WINDOW_START},
    };
    use pretty_assertions::assert_eq;

    fn options() -> PlanOptions {
        PlanOptions {
            buffer_size: 4096,
            layout: MemoryLayoutKind::Row,
        }
    }

    fn source(origin: u64) -> PhysicalOperatorNode {
        PhysicalOperatorNode::source(
            OriginId(origin),
            Schema::new()
                .with("k", Type::U32)
                .with("ts", Type::U64)
                .with("v", Type::I64),
        )
    }

    fn tumbling() -> WindowType {
        WindowType::Tumbling { size: 1000 }
    }

    fn event_time() -> TimeCharacteristic {
        TimeCharacteristic::EventTime { field: "ts".into() }
    }

    fn names(schema: &Schema) -> Vec<&str> {
        schema.fields().iter().map(|field| field.name.as_str()).collect()
    }

    fn build(root: &PhysicalOperatorNode) -> Result<PipelinedQueryPlan, PlanError> {
        PipelinedQueryPlan::build(QueryId(1), root, &options())
    }

    #[test]
    fn stateless_plan_is_one_pipeline() {
        let root = source(1)
            .selection(Expression::field("v").gt(Expression::constant(0i64)))
            .map("w", Expression::field("v").mul(Expression::constant(2i64)))
            .sink();
        let plan = build(&root).unwrap();
        assert_eq!(plan.pipelines().len(), 1);

        let pipeline = &plan.pipelines()[0];
        assert_eq!(pipeline.kind, PipelineKind::Source { origin: OriginId(1) });
        assert!(pipeline.is_sink());
        assert_eq!(pipeline.operators.len(), 4);
        assert_eq!(
            names(pipeline.output_layout().unwrap().schema()),
            ["k", "ts", "v", "w"]
        );
        assert!(plan.handlers().is_empty());
    }

    #[test]
    fn window_aggregation_breaks_the_pipeline() {
        let root = source(1)
            .event_time_watermark("ts", 0)
            .window_aggregation(
                tumbling(),
                event_time(),
                &["k"],
                vec![
                    AggregationDescriptor::sum("v", "total"),
                    AggregationDescriptor::avg("v", "mean"),
                ],
            )
            .sink();
        let plan = build(&root).unwrap();
        assert_eq!(plan.pipelines().len(), 2);
        assert_eq!(plan.handlers().len(), 1);

        let (build_pipeline, probe) = (&plan.pipelines()[0], &plan.pipelines()[1]);
        assert_eq!(build_pipeline.successors, [probe.id]);
        assert_eq!(probe.predecessors, [build_pipeline.id]);
        assert_eq!(build_pipeline.handler(), Some(0));
        assert_eq!(probe.kind, PipelineKind::Sink);
        assert_eq!(
            names(probe.output_layout().unwrap().schema()),
            [WINDOW_START, WINDOW_END, "k", "total", "mean"]
        );
        assert_eq!(plan.handler_owner(0).map(|p| p.id), Some(build_pipeline.id));
        assert_eq!(plan.sink_pipeline().map(|p| p.id), Some(probe.id));
    }

    #[test]
    fn window_join_has_two_build_pipelines() {
        let root = source(1)
            .window_join(source(2), tumbling(), ("ts", "ts"), (&["k"], &["k"]))
            .sink();
        let plan = build(&root).unwrap();
        let ids: Vec<_> = plan.pipelines().iter().map(|p| p.id).collect();
        assert_eq!(ids, [PipelineId(1), PipelineId(2), PipelineId(3)]);
        assert_eq!(plan.pipelines()[2].predecessors, [PipelineId(1), PipelineId(2)]);
        assert_eq!(plan.source_pipelines().count(), 2);
        assert_eq!(
            names(plan.pipelines()[2].output_layout().unwrap().schema()),
            [WINDOW_START, WINDOW_END, "k", "ts", "v", "right_ts", "right_v"]
        );
    }

    #[test]
    fn origins_feed_a_plan_once() {
        let root = source(1)
            .window_join(source(1), tumbling(), ("ts", "ts"), (&["k"], &["k"]))
            .sink();
        assert_eq!(
            build(&root).unwrap_err(),
            PlanError::DuplicateOrigin { origin: OriginId(1) }
        );
    }

    #[test]
    fn plans_end_in_exactly_one_sink() {
        assert!(matches!(build(&source(1)), Err(PlanError::InvalidPlan { .. })));
        let nested = source(1).sink().sink();
        assert!(matches!(build(&nested), Err(PlanError::InvalidPlan { .. })));
    }

    #[test]
    fn invalid_fields_are_rejected() {
        let duplicate = PhysicalOperatorNode::source(
            OriginId(1),
            Schema::new().with("a", Type::I64).with("a", Type::I32),
        )
        .sink();
        assert!(matches!(build(&duplicate), Err(PlanError::DuplicateField { .. })));

        let unknown_key = source(1)
            .window_aggregation(tumbling(), event_time(), &["nope"], vec![AggregationDescriptor::count("n")])
            .sink();
        assert!(matches!(build(&unknown_key), Err(PlanError::UnknownField { .. })));

        let float_time = PhysicalOperatorNode::source(OriginId(1), Schema::new().with("ts", Type::F64))
            .event_time_watermark("ts", 0)
            .sink();
        assert!(matches!(build(&float_time), Err(PlanError::TypeMismatch { .. })));
    }

    #[test]
    fn layout_swaps_cut_pipelines_only_when_the_layout_changes() {
        let same = source(1).layout_swap(MemoryLayoutKind::Row).sink();
        assert_eq!(build(&same).unwrap().pipelines().len(), 1);

        let swapped = source(1).layout_swap(MemoryLayoutKind::Columnar).sink();
        let plan = build(&swapped).unwrap();
        assert_eq!(plan.pipelines().len(), 2);
        assert_eq!(
            plan.pipelines()[0].output_layout().map(MemoryLayout::kind),
            Some(MemoryLayoutKind::Columnar)
        );
        assert_eq!(
            plan.pipelines()[1].input_layout().map(MemoryLayout::kind),
            Some(MemoryLayoutKind::Columnar)
        );
        assert_eq!(plan.pipelines()[1].kind, PipelineKind::Sink);
    }

    #[test]
    fn lowering_is_deterministic() {
        let root = || {
            source(1)
                .event_time_watermark("ts", 10)
                .window_aggregation(
                    tumbling(),
                    event_time(),
                    &["k"],
                    vec![AggregationDescriptor::max("v", "top")],
                )
                .sink()
        };
        let first = build(&root()).unwrap();
        let second = build(&root()).unwrap();
        assert_eq!(
            serde_json::to_string(first.pipelines()).unwrap(),
            serde_json::to_string(second.pipelines()).unwrap()
        );
    }
}
