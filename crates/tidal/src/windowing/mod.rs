//! Event time windows over out-of-order streams.
//!
//! Window operators keep their state in slices, the largest intervals of
//! time that no window boundary cuts through. Each worker aggregates into
//! its own hash map of a slice, so the hot path takes no lock. Once the
//! combined watermark of all input origins passes the end of a window, the
//! slices it covers are merged and the result is emitted.

mod aggregation;
mod assigner;
mod hash_map;
mod join;
mod output;
mod predictor;
mod slice;
mod slice_store;
mod watermark;

pub use aggregation::{
    Aggregate, AggregationFunction, AggregationHandler, AggregationState, SlotUpdate, StateSlot,
    SLOT_SIZE,
};
pub use assigner::{SliceAssigner, WindowType};
pub use hash_map::{ChainedHashMap, HashMapSnapshot, SnapshotError};
pub use join::{JoinHandler, JoinInput, JoinSide};
pub use predictor::{new_predictor, KalmanPredictor, RegressionPredictor, WatermarkPredictor};
pub use slice::{MapShape, Slice, SlicePin, SliceState};
pub use slice_store::{ClosedWindow, SliceStore, SliceStoreStats, TriggerBatch};
pub use watermark::MultiOriginWatermarkProcessor;

use serde::{Deserialize, Serialize};

/// Where a window operator takes the timestamp of a tuple from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeCharacteristic {
    /// The value of an unsigned integer field, in milliseconds.
    EventTime { field: String },
    /// The creation time of the buffer carrying the tuple.
    IngestionTime,
}

/// Names of the window bound fields leading every window operator's output.
pub const WINDOW_START: &str = "window_start";
pub const WINDOW_END: &str = "window_end";
