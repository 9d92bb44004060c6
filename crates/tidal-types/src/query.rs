//! Query identifiers and lifecycle types.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

macro_rules! id_type {
    ($($(#[$meta:meta])* $name:ident = $prefix:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub u64);

            impl $name {
                pub const fn new(id: u64) -> Self {
                    Self(id)
                }

                pub const fn get(self) -> u64 {
                    self.0
                }
            }

            impl Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }
        )*
    };
}

id_type! {
    /// Identifies a registered query.
    QueryId = "q",
    /// Identifies a logical source of tuples with independent watermark
    /// progress.
    OriginId = "o",
    /// Identifies a pipeline within a pipelined query plan.
    PipelineId = "p",
}

impl OriginId {
    /// Origins assigned to buffers produced by operator handlers start at
    /// this value so they never collide with user assigned source origins.
    pub const HANDLER_BASE: u64 = 1 << 32;

    pub const fn for_handler(handler: usize) -> Self {
        Self(Self::HANDLER_BASE + handler as u64)
    }
}

/// How a running query is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryTerminationType {
    /// Drain all sources, flush every open window and close the sinks.
    Graceful,
    /// Stop as soon as possible, discarding buffered state.
    HardStop,
    /// The query hit an unrecoverable error.
    Failure,
}

/// Externally visible lifecycle state of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum QueryStatus {
    Registered,
    Running,
    Stopped,
    /// Terminal state reached through [`QueryTerminationType::Failure`].
    Failed(String),
}

impl QueryStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

impl Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => f.write_str("registered"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

/// Counters reported for a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatistics {
    /// Buffers handed to compiled pipeline stages.
    pub processed_buffers: u64,
    /// Tuples contained in those buffers.
    pub processed_tuples: u64,
    /// Tuples dropped because the window they belong to had already closed.
    pub late_tuples: u64,
    /// Buffers delivered to sinks.
    pub emitted_buffers: u64,
}
