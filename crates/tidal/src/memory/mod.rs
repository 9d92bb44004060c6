//! Tuple buffers, the pool they come from and the schema driven layouts used
//! to read and write records inside them.

mod buffer;
mod layout;
mod pool;
mod record;
mod schema;

pub(crate) use buffer::now_millis;
pub use buffer::{SequenceData, TupleBuffer};
pub use layout::{LayoutBuffer, MemoryLayout};
pub use pool::BufferManager;
pub use record::Record;
pub use schema::{Field, Schema};

use serde::Serialize;
use std::{borrow::Cow, time::Duration};
use thiserror::Error;
use tidal_types::error::DetailedError;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum MemoryError {
    #[error("buffer pool exhausted: no buffer became available within {waited:?}")]
    OutOfBuffers { waited: Duration },
    #[error("schema of {record_size} bytes per record does not fit a buffer of {capacity} bytes")]
    SchemaMismatch { record_size: usize, capacity: usize },
    #[error("record {index} is out of bounds for a buffer holding {capacity} records")]
    OutOfBounds { index: u64, capacity: u64 },
    #[error("record does not match the schema: {reason}")]
    InvalidRecord { reason: String },
}

impl DetailedError for MemoryError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::OutOfBuffers { .. } => Cow::from("OutOfBuffers"),
            Self::SchemaMismatch { .. } => Cow::from("SchemaMismatch"),
            Self::OutOfBounds { .. } => Cow::from("OutOfBounds"),
            Self::InvalidRecord { .. } => Cow::from("InvalidRecord"),
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfBuffers { .. })
    }
}
