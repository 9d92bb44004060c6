use crate::ir::{BlockId, Function, ValueId};
use std::collections::{BTreeMap, BTreeSet};

impl Function {
    /// Removes pure instructions and block parameters whose values are never
    /// used by an effectful instruction or a terminator
    pub(crate) fn dce(&mut self) -> bool {
        let live = self.live_values();
        let mut removed = 0usize;

        for block in self.blocks.values_mut() {
            let before = block.body.len();
            block.body.retain(|inst| {
                inst.kind.has_side_effects() || inst.dest.is_some_and(|dest| live.contains(&dest))
            });
            removed += before - block.body.len();
        }

        // Dead parameters of every block but the entry, whose parameters are
        // the function's signature
        let mut dead_params: BTreeMap<BlockId, Vec<usize>> = BTreeMap::new();
        for (&id, block) in &self.blocks {
            if id == self.entry {
                continue;
            }
            let dead: Vec<usize> = block
                .params
                .iter()
                .enumerate()
                .filter(|(_, (param, _))| !live.contains(param))
                .map(|(index, _)| index)
                .collect();
            if !dead.is_empty() {
                dead_params.insert(id, dead);
            }
        }

        for (&target, dead) in &dead_params {
            if let Some(block) = self.blocks.get_mut(&target) {
                remove_indices(&mut block.params, dead);
                removed += dead.len();
            }
        }
        for block in self.blocks.values_mut() {
            block.terminator.for_each_edge_mut(|target, args| {
                if let Some(dead) = dead_params.get(&*target) {
                    remove_indices(args, dead);
                }
            });
        }

        if removed != 0 {
            tracing::trace!("removed {removed} dead values");
        }
        removed != 0
    }

    fn live_values(&self) -> BTreeSet<ValueId> {
        // Where every value comes from
        let mut defining_inst = BTreeMap::new();
        let mut param_position = BTreeMap::new();
        for (&id, block) in &self.blocks {
            for (index, &(param, _)) in block.params.iter().enumerate() {
                param_position.insert(param, (id, index));
            }
            for inst in &block.body {
                if let Some(dest) = inst.dest {
                    defining_inst.insert(dest, &inst.kind);
                }
            }
        }

        let mut worklist = Vec::new();
        for block in self.blocks.values() {
            for inst in &block.body {
                if inst.kind.has_side_effects() {
                    worklist.extend(inst.kind.operands());
                }
            }
            // Only conditions and return values are roots, block arguments
            // are live only if the receiving parameter is
            match &block.terminator {
                crate::ir::Terminator::Branch(branch) => worklist.push(branch.cond),
                crate::ir::Terminator::Return(ret) => worklist.extend(ret.value),
                _ => {}
            }
        }

        let mut live = BTreeSet::new();
        while let Some(value) = worklist.pop() {
            if !live.insert(value) {
                continue;
            }

            if let Some(kind) = defining_inst.get(&value) {
                worklist.extend(kind.operands());
            } else if let Some(&(target, index)) = param_position.get(&value) {
                for source in self.blocks.values() {
                    for args in source.terminator.args_to(target) {
                        if let Some(&arg) = args.get(index) {
                            worklist.push(arg);
                        }
                    }
                }
            }
        }

        // Entry parameters always stay, the signature can't change
        live.extend(self.args().iter().map(|&(arg, _)| arg));
        live
    }
}

fn remove_indices<T>(items: &mut Vec<T>, sorted_indices: &[usize]) {
    for &index in sorted_indices.iter().rev() {
        items.remove(index);
    }
}
