use crate::ir::Function;
use std::collections::BTreeSet;

impl Function {
    /// Removes every block that can't be reached from the entry block,
    /// returning `true` if anything was removed
    pub(crate) fn remove_unreachable_blocks(&mut self) -> bool {
        let reachable: BTreeSet<_> = self.reverse_post_order().into_iter().collect();
        let before = self.blocks.len();
        self.blocks.retain(|id, _| reachable.contains(id));

        let removed = before - self.blocks.len();
        if removed != 0 {
            tracing::trace!("removed {removed} unreachable blocks");
        }
        removed != 0
    }
}
