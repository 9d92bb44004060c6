use crate::{
    memory::Schema,
    operators::Expression,
    windowing::{AggregationFunction, TimeCharacteristic, WindowType},
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use tidal_types::{config::MemoryLayoutKind, query::OriginId};

pub use crate::operators::WatermarkStrategy;

/// One aggregate of a window aggregation, `field` is absent for `count`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationDescriptor {
    pub function: AggregationFunction,
    pub field: Option<String>,
    pub output: String,
}

impl AggregationDescriptor {
    fn new(function: AggregationFunction, field: Option<&str>, output: &str) -> Self {
        Self {
            function,
            field: field.map(str::to_owned),
            output: output.to_owned(),
        }
    }

    pub fn sum(field: &str, output: &str) -> Self {
        Self::new(AggregationFunction::Sum, Some(field), output)
    }

    pub fn count(output: &str) -> Self {
        Self::new(AggregationFunction::Count, None, output)
    }

    pub fn min(field: &str, output: &str) -> Self {
        Self::new(AggregationFunction::Min, Some(field), output)
    }

    pub fn max(field: &str, output: &str) -> Self {
        Self::new(AggregationFunction::Max, Some(field), output)
    }

    pub fn avg(field: &str, output: &str) -> Self {
        Self::new(AggregationFunction::Avg, Some(field), output)
    }
}

impl Display for AggregationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}({field}) as {}", self.function, self.output),
            None => write!(f, "{}() as {}", self.function, self.output),
        }
    }
}

/// A tree of physical operators as handed over by the query compiler.
///
/// Leaves are sources, the root is the sink. Lowering into pipelines
/// happens in [`PipelinedQueryPlan::build`](super::PipelinedQueryPlan::build).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalOperatorNode {
    Source {
        origin: OriginId,
        schema: Schema,
    },
    Selection {
        input: Box<PhysicalOperatorNode>,
        predicate: Expression,
    },
    Map {
        input: Box<PhysicalOperatorNode>,
        field: String,
        expression: Expression,
    },
    WatermarkAssignment {
        input: Box<PhysicalOperatorNode>,
        strategy: WatermarkStrategy,
    },
    WindowAggregation {
        input: Box<PhysicalOperatorNode>,
        window: WindowType,
        time: TimeCharacteristic,
        keys: Vec<String>,
        aggregations: Vec<AggregationDescriptor>,
    },
    WindowJoin {
        left: Box<PhysicalOperatorNode>,
        right: Box<PhysicalOperatorNode>,
        window: WindowType,
        left_time: TimeCharacteristic,
        right_time: TimeCharacteristic,
        left_keys: Vec<String>,
        right_keys: Vec<String>,
    },
    /// Re-materializes records in another memory layout.
    LayoutSwap {
        input: Box<PhysicalOperatorNode>,
        layout: MemoryLayoutKind,
    },
    Sink {
        input: Box<PhysicalOperatorNode>,
    },
}

impl PhysicalOperatorNode {
    pub fn source(origin: OriginId, schema: Schema) -> Self {
        Self::Source { origin, schema }
    }

    pub fn selection(self, predicate: Expression) -> Self {
        Self::Selection {
            input: Box::new(self),
            predicate,
        }
    }

    pub fn map(self, field: impl Into<String>, expression: Expression) -> Self {
        Self::Map {
            input: Box::new(self),
            field: field.into(),
            expression,
        }
    }

    pub fn watermark(self, strategy: WatermarkStrategy) -> Self {
        Self::WatermarkAssignment {
            input: Box::new(self),
            strategy,
        }
    }

    /// Event time watermarks from `field`, allowing `lateness` milliseconds
    /// of disorder.
    pub fn event_time_watermark(self, field: impl Into<String>, lateness: u64) -> Self {
        self.watermark(WatermarkStrategy::EventTime {
            field: field.into(),
            lateness,
        })
    }

    pub fn window_aggregation(
        self,
        window: WindowType,
        time: TimeCharacteristic,
        keys: &[&str],
        aggregations: Vec<AggregationDescriptor>,
    ) -> Self {
        Self::WindowAggregation {
            input: Box::new(self),
            window,
            time,
            keys: keys.iter().map(|&key| key.to_owned()).collect(),
            aggregations,
        }
    }

    /// Joins `self` (left) with `right` on equal keys within a window, both
    /// sides timestamped by an event time field.
    pub fn window_join(
        self,
        right: Self,
        window: WindowType,
        (left_ts, right_ts): (&str, &str),
        (left_keys, right_keys): (&[&str], &[&str]),
    ) -> Self {
        let keys = |keys: &[&str]| -> Vec<String> { keys.iter().map(|&key| key.to_owned()).collect() };
        Self::WindowJoin {
            left: Box::new(self),
            right: Box::new(right),
            window,
            left_time: TimeCharacteristic::EventTime {
                field: left_ts.to_owned(),
            },
            right_time: TimeCharacteristic::EventTime {
                field: right_ts.to_owned(),
            },
            left_keys: keys(left_keys),
            right_keys: keys(right_keys),
        }
    }

    pub fn layout_swap(self, layout: MemoryLayoutKind) -> Self {
        Self::LayoutSwap {
            input: Box::new(self),
            layout,
        }
    }

    pub fn sink(self) -> Self {
        Self::Sink {
            input: Box::new(self),
        }
    }

    /// Name of the operator kind, for diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Source { .. } => "source",
            Self::Selection { .. } => "selection",
            Self::Map { .. } => "map",
            Self::WatermarkAssignment { .. } => "watermark assignment",
            Self::WindowAggregation { .. } => "window aggregation",
            Self::WindowJoin { .. } => "window join",
            Self::LayoutSwap { .. } => "layout swap",
            Self::Sink { .. } => "sink",
        }
    }

    pub fn children(&self) -> Vec<&PhysicalOperatorNode> {
        match self {
            Self::Source { .. } => Vec::new(),
            Self::WindowJoin { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Self::Selection { input, .. }
            | Self::Map { input, .. }
            | Self::WatermarkAssignment { input, .. }
            | Self::WindowAggregation { input, .. }
            | Self::LayoutSwap { input, .. }
            | Self::Sink { input } => vec![input.as_ref()],
        }
    }
}
