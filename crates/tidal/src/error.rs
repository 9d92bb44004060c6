use crate::{
    backend::CompileError,
    ir::ValidationError,
    memory::MemoryError,
    pipeline::{PipelineError, PlanError},
    runtime::{ConnectorError, RuntimeError},
    trace::TraceError,
    windowing::SnapshotError,
};
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;
use tidal_types::error::DetailedError;

/// Any error the engine reports.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(untagged)]
pub enum Error {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl DetailedError for Error {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Memory(error) => error.error_code(),
            Self::Trace(error) => error.error_code(),
            Self::Validation(_) => Cow::from("InvalidIr"),
            Self::Compile(error) => error.error_code(),
            Self::Plan(error) => error.error_code(),
            Self::Pipeline(error) => error.error_code(),
            Self::Connector(error) => error.error_code(),
            Self::Runtime(error) => error.error_code(),
            Self::Snapshot(_) => Cow::from("InvalidSnapshot"),
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Memory(error) => error.is_recoverable(),
            Self::Pipeline(error) => error.is_recoverable(),
            Self::Connector(error) => error.is_recoverable(),
            Self::Runtime(error) => error.is_recoverable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tidal_types::{error::ErrorResponse, query::QueryId};

    #[test]
    fn responses_keep_the_innermost_code() {
        let error = Error::from(RuntimeError::from(PipelineError::from(MemoryError::OutOfBuffers {
            waited: Duration::from_millis(5),
        })));
        assert!(error.is_recoverable());
        let response = ErrorResponse::from_error_nolog(&error);
        assert_eq!(response.error_code, "OutOfBuffers");
        assert_eq!(
            response.message,
            "buffer pool exhausted: no buffer became available within 5ms"
        );

        let error = Error::from(RuntimeError::UnknownQuery { query: QueryId(4) });
        assert!(!error.is_recoverable());
        let response = ErrorResponse::from_error_nolog(&error);
        assert_eq!(response.error_code, "UnknownQuery");
        assert_eq!(
            response.details,
            serde_json::json!({ "UnknownQuery": { "query": 4 } })
        );
    }
}
