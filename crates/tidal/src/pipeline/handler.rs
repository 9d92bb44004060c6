use super::{PipelineError, PipelineExecutionContext, WorkerContext};
use crate::windowing::SliceState;
use std::any::Any;
use tidal_types::{config::SliceStoreConfig, query::QueryTerminationType};

/// State of an operator that outlives a single invocation of its stage.
///
/// Handlers are created while the plan is lowered, set up once before the
/// query starts and stopped once when it terminates. Compiled code reaches
/// them through proxies, by their index in the query's handler list.
pub trait OperatorHandler: Send + Sync + 'static {
    /// Allocates the handler's state. `local_state_variable_id` is the
    /// handler's index, scratch memory registered under it is handed to
    /// every worker.
    fn setup(
        &self,
        ctx: &PipelineExecutionContext,
        state: &mut StateManager,
        local_state_variable_id: usize,
    ) -> Result<(), PipelineError>;

    /// Called by the trigger proxy after a worker processed a buffer.
    fn trigger(
        &self,
        _ctx: &PipelineExecutionContext,
        _worker: &mut WorkerContext,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Emits (graceful) or drops (otherwise) the remaining state. Calling it
    /// more than once, or before `setup`, does nothing.
    fn stop(
        &self,
        termination: QueryTerminationType,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), PipelineError>;

    fn late_tuples(&self) -> u64 {
        0
    }

    /// `(start, end, state)` of the handler's slices.
    fn slices(&self) -> Vec<(u64, u64, SliceState)> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;
}

/// What handlers need to know about the workers during setup.
#[derive(Debug, Clone)]
pub struct StateManager {
    workers: usize,
    slice_store: SliceStoreConfig,
    scratch: Vec<usize>,
}

impl StateManager {
    pub fn new(workers: usize, slice_store: SliceStoreConfig) -> Self {
        Self {
            workers: workers.max(1),
            slice_store,
            scratch: Vec::new(),
        }
    }

    pub const fn workers(&self) -> usize {
        self.workers
    }

    pub const fn slice_store_config(&self) -> &SliceStoreConfig {
        &self.slice_store
    }

    /// Gives every worker `bytes` of scratch memory for handler `id`.
    pub fn register_scratch(&mut self, id: usize, bytes: usize) {
        if self.scratch.len() <= id {
            self.scratch.resize(id + 1, 0);
        }
        self.scratch[id] = self.scratch[id].max(bytes);
    }

    pub fn scratch_sizes(&self) -> &[usize] {
        &self.scratch
    }
}
