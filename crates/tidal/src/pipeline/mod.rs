//! Pipelines: chains of physical operators compiled into one stage.
//!
//! A [`PipelinedQueryPlan`] cuts a tree of [`PhysicalOperatorNode`]s into
//! pipelines at every operator that has to materialize its input (window
//! builds) and at every change of memory layout. Each pipeline is traced and
//! compiled into a single function taking `(buffer, pipeline context,
//! worker context)`. State that outlives one invocation lives in
//! [`OperatorHandler`]s which compiled code addresses by index.

mod builder;
pub(crate) mod context;
mod handler;
mod plan;
pub mod proxies;
mod query_plan;
mod stage;

pub use builder::{BuilderState, PipelineBuilder};
pub use context::{Dispatch, InputMetadata, PipelineExecutionContext, WorkerContext};
pub use handler::{OperatorHandler, StateManager};
pub use plan::{AggregationDescriptor, PhysicalOperatorNode, WatermarkStrategy};
pub use proxies::{builtin_proxies, ProxyIds};
pub use query_plan::{Pipeline, PipelineKind, PipelinedQueryPlan, PlanOptions};
pub use stage::{compile_pipeline, trace_pipeline};

use crate::{backend::CompileError, memory::MemoryError};
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;
use tidal_types::{
    error::DetailedError,
    query::{OriginId, PipelineId},
};

/// Status code returned by a compiled stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u64)]
pub enum ExecutionResult {
    Ok = 0,
    /// The stage could not make progress for lack of output space, the
    /// buffer has to be processed again later.
    BufferFull = 1,
    /// The stage will not accept further input.
    EndOfStream = 2,
    /// A proxy reported an error through the worker context.
    Error = 3,
}

impl ExecutionResult {
    pub const fn code(self) -> u64 {
        self as u64
    }

    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::BufferFull),
            2 => Some(Self::EndOfStream),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Errors detected while turning an operator tree into pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum PlanError {
    #[error("pipeline builder cannot {action} in state {state}")]
    InvalidBuilderTransition { state: BuilderState, action: String },
    #[error("unknown field '{field}' in {schema}")]
    UnknownField { field: String, schema: String },
    #[error("field '{field}' appears twice in {schema}")]
    DuplicateField { field: String, schema: String },
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },
    #[error("invalid window {window}")]
    InvalidWindow { window: String },
    #[error("join keys do not match: {message}")]
    JoinKeyMismatch { message: String },
    #[error("{origin} feeds the plan more than once")]
    DuplicateOrigin { origin: OriginId },
    #[error("invalid plan: {message}")]
    InvalidPlan { message: String },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl DetailedError for PlanError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::InvalidBuilderTransition { .. } => Cow::from("InvalidBuilderTransition"),
            Self::UnknownField { .. } => Cow::from("UnknownField"),
            Self::DuplicateField { .. } => Cow::from("DuplicateField"),
            Self::TypeMismatch { .. } => Cow::from("PlanTypeMismatch"),
            Self::InvalidWindow { .. } => Cow::from("InvalidWindow"),
            Self::JoinKeyMismatch { .. } => Cow::from("JoinKeyMismatch"),
            Self::DuplicateOrigin { .. } => Cow::from("DuplicateOrigin"),
            Self::InvalidPlan { .. } => Cow::from("InvalidPlan"),
            Self::Memory(error) => error.error_code(),
            Self::Compile(error) => error.error_code(),
        }
    }
}

/// Errors raised while a pipeline processes buffers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum PipelineError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("stage of {pipeline} returned {code}")]
    Stage { pipeline: PipelineId, code: u64 },
    #[error("sink rejected a buffer emitted by {pipeline}")]
    SinkRejected { pipeline: PipelineId },
    #[error("buffer {handle:#x} was not allocated by this worker")]
    UnknownBuffer { handle: u64 },
    #[error("no operator handler {handler}")]
    UnknownHandler { handler: usize },
    #[error("operator handler {handler} was used before it was set up")]
    HandlerNotReady { handler: usize },
    #[error("cannot dispatch buffer: {message}")]
    Dispatch { message: String },
}

impl DetailedError for PipelineError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Memory(error) => error.error_code(),
            Self::Stage { .. } => Cow::from("StageFailed"),
            Self::SinkRejected { .. } => Cow::from("SinkRejected"),
            Self::UnknownBuffer { .. } => Cow::from("UnknownBuffer"),
            Self::UnknownHandler { .. } => Cow::from("UnknownHandler"),
            Self::HandlerNotReady { .. } => Cow::from("HandlerNotReady"),
            Self::Dispatch { .. } => Cow::from("DispatchFailed"),
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Memory(error) if error.is_recoverable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes() {
        for result in [
            ExecutionResult::Ok,
            ExecutionResult::BufferFull,
            ExecutionResult::EndOfStream,
            ExecutionResult::Error,
        ] {
            assert_eq!(ExecutionResult::from_code(result.code()), Some(result));
        }
        assert_eq!(ExecutionResult::from_code(7), None);
    }
}
