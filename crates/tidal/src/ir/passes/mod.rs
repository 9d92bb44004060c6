mod branch_only;
mod constant_folding;
mod dce;
mod loops;
mod params;
mod unreachable;

use crate::ir::Function;

impl Function {
    /// Runs the standard pass pipeline over a function produced by tracing
    #[tracing::instrument(skip_all, fields(function = %self.name))]
    pub fn optimize(&mut self) {
        let before = self.instruction_count();

        self.remove_unreachable_blocks();
        self.remove_branch_only_blocks();
        self.remove_trivial_params();
        if self.fold_constants() {
            // Folded branches may have orphaned whole regions
            self.remove_unreachable_blocks();
            self.remove_branch_only_blocks();
            self.remove_trivial_params();
        }
        self.dce();
        self.detect_loops();
        self.recompute_types();

        tracing::debug!(
            "optimized {}: {} blocks, {before} -> {} instructions",
            self.name,
            self.blocks.len(),
            self.instruction_count(),
        );
    }
}
