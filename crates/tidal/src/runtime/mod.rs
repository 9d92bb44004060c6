//! The node engine: worker threads executing compiled pipeline stages, the
//! sources feeding them and the lifecycle of registered queries.
//!
//! ```text
//!  source threads ──admission queue (bounded)──┐
//!                                              ├──> workers ──> sink
//!  pipeline outputs ──internal queue──────────┘
//! ```
//!
//! Workers prefer the internal queue, so buffers already inside a query
//! are finished before new source buffers are admitted.

mod engine;
mod query;
mod sink;
mod source;

pub use engine::NodeEngine;
pub use sink::{CollectingSink, ReceivedBuffer, Sink};
pub use source::{FillStatus, InMemorySource, Source};

use crate::{
    backend::CompileError,
    memory::MemoryError,
    pipeline::{PipelineError, PlanError},
};
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;
use tidal_types::{
    error::DetailedError,
    query::{OriginId, QueryId, QueryStatus},
};

/// Errors raised by sources and sinks.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ConnectorError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("batch of {records} records does not fit a buffer of {capacity} records")]
    BatchTooLarge { records: usize, capacity: u64 },
    #[error("{message}")]
    Other { message: String },
}

impl DetailedError for ConnectorError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Memory(error) => error.error_code(),
            Self::BatchTooLarge { .. } => Cow::from("BatchTooLarge"),
            Self::Other { .. } => Cow::from("ConnectorError"),
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Memory(error) if error.is_recoverable())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum RuntimeError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("unknown query {query}")]
    UnknownQuery { query: QueryId },
    #[error("cannot {action} {query}, it is {status}")]
    InvalidState {
        query: QueryId,
        status: QueryStatus,
        action: String,
    },
    #[error("no source registered for {origin}")]
    MissingSource { origin: OriginId },
    #[error("{origin} does not feed the plan")]
    UnknownOrigin { origin: OriginId },
    #[error("failed to spawn thread: {message}")]
    Spawn { message: String },
    #[error("the engine is shutting down")]
    ShuttingDown,
}

impl DetailedError for RuntimeError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Plan(error) => error.error_code(),
            Self::Compile(error) => error.error_code(),
            Self::Pipeline(error) => error.error_code(),
            Self::Connector(error) => error.error_code(),
            Self::UnknownQuery { .. } => Cow::from("UnknownQuery"),
            Self::InvalidState { .. } => Cow::from("InvalidQueryState"),
            Self::MissingSource { .. } => Cow::from("MissingSource"),
            Self::UnknownOrigin { .. } => Cow::from("UnknownOrigin"),
            Self::Spawn { .. } => Cow::from("SpawnFailed"),
            Self::ShuttingDown => Cow::from("ShuttingDown"),
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Pipeline(error) => error.is_recoverable(),
            Self::Connector(error) => error.is_recoverable(),
            _ => false,
        }
    }
}
