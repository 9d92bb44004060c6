use super::{ExecutionContext, Flow, OperatorState, TracedRecord};
use crate::{
    memory::Schema,
    pipeline::PlanError,
    trace::{TraceContext, TraceError, TraceResult},
    types::Type,
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Where the watermark of a buffer comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkStrategy {
    /// The largest value of an integer timestamp field in the buffer, minus
    /// the allowed lateness.
    EventTime { field: String, lateness: u64 },
    /// The creation time of the buffer.
    IngestionTime,
}

impl Display for WatermarkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventTime { field, lateness } => write!(f, "event time {field} - {lateness}"),
            Self::IngestionTime => f.write_str("ingestion time"),
        }
    }
}

/// Replaces the watermark of every processed buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatermarkAssignment {
    pub strategy: WatermarkStrategy,
}

impl WatermarkAssignment {
    pub fn new(strategy: WatermarkStrategy, input: &Schema) -> Result<Self, PlanError> {
        if let WatermarkStrategy::EventTime { field, .. } = &strategy {
            check_timestamp_field(input, field)?;
        }
        Ok(Self { strategy })
    }

    pub(super) fn open(&self, t: &mut TraceContext<'_>) -> TraceResult<OperatorState> {
        match &self.strategy {
            // Starting at the lateness keeps `max_ts - lateness` from wrapping
            WatermarkStrategy::EventTime { lateness, .. } => {
                let lateness = t.constant(*lateness)?;
                let max_ts = t.var(lateness)?;
                Ok(OperatorState::Watermark { max_ts })
            }
            WatermarkStrategy::IngestionTime => Ok(OperatorState::None),
        }
    }

    pub(super) fn execute(
        &self,
        t: &mut TraceContext<'_>,
        state: &OperatorState,
        record: &mut TracedRecord,
    ) -> TraceResult<Flow> {
        let (WatermarkStrategy::EventTime { field, .. }, OperatorState::Watermark { max_ts }) =
            (&self.strategy, state)
        else {
            return Ok(Flow::Continue);
        };

        let ts = record.get(field)?;
        let ts = t.cast(ts, Type::U64)?;
        let max = t.get(*max_ts)?;
        let later = t.lt(max, ts)?;
        if t.branch(later)? {
            t.set(*max_ts, ts)?;
        }
        Ok(Flow::Continue)
    }

    pub(super) fn close(&self, ctx: &ExecutionContext, t: &mut TraceContext<'_>, state: &OperatorState) -> TraceResult<()> {
        match (&self.strategy, state) {
            (WatermarkStrategy::EventTime { lateness, .. }, OperatorState::Watermark { max_ts }) => {
                let max = t.get(*max_ts)?;
                let lateness = t.constant(*lateness)?;
                let watermark = t.sub(max, lateness)?;
                ctx.set_watermark(t, watermark)
            }
            (WatermarkStrategy::IngestionTime, _) => {
                let watermark = ctx.creation_ts(t)?;
                ctx.set_watermark(t, watermark)
            }
            _ => Err(TraceError::UndefinedValue {
                value: "watermark state".to_owned(),
            }),
        }
    }
}

/// Timestamps are read from integer fields and interpreted as milliseconds.
pub(crate) fn check_timestamp_field(schema: &Schema, field: &str) -> Result<(), PlanError> {
    let ty = schema
        .get(field)
        .map(|field| field.ty)
        .ok_or_else(|| PlanError::UnknownField {
            field: field.to_owned(),
            schema: schema.to_string(),
        })?;
    if !ty.is_int() {
        return Err(PlanError::TypeMismatch {
            message: format!("timestamp field '{field}' is {ty}, not an integer"),
        });
    }
    Ok(())
}
