use crate::ir::{BlockId, Function, Terminator, ValueId};
use std::collections::BTreeMap;

impl Function {
    /// Removes blocks that have no parameters, no body and end in a jump by
    /// retargeting their predecessors to the jump's destination
    pub(crate) fn remove_branch_only_blocks(&mut self) -> bool {
        let mut changed = false;

        loop {
            // Forwarding blocks and where they forward to
            let forwards: BTreeMap<BlockId, (BlockId, Vec<ValueId>)> = self
                .blocks
                .values()
                .filter(|block| {
                    block.id != self.entry && block.params.is_empty() && block.body.is_empty()
                })
                .filter_map(|block| match &block.terminator {
                    Terminator::Jump(jump) if jump.target != block.id => {
                        Some((block.id, (jump.target, jump.args.clone())))
                    }
                    _ => None,
                })
                .collect();

            // Retarget one forwarding block at a time so that chains of them
            // collapse without ever pointing at a removed block
            let Some((&forwarder, (target, args))) = forwards.iter().next() else {
                break;
            };

            for block in self.blocks.values_mut() {
                if block.id == forwarder {
                    continue;
                }
                block.terminator.for_each_edge_mut(|edge_target, edge_args| {
                    if *edge_target == forwarder {
                        *edge_target = *target;
                        edge_args.clone_from(args);
                    }
                });
            }

            self.blocks.remove(&forwarder);
            changed = true;
        }

        if changed {
            tracing::trace!("removed branch-only blocks");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ir::{FunctionBuilder, Terminator},
        types::Type,
    };

    #[test]
    fn collapses_chains() {
        let mut builder = FunctionBuilder::new("chain", Some(Type::I32));
        let first = builder.create_block();
        let second = builder.create_block();
        let exit = builder.create_block();
        let param = builder.add_block_param(exit, Type::I32);

        let value = builder.const_bits(Type::I32, 9);
        builder.jump(first, vec![]);
        builder.move_to(first);
        builder.jump(second, vec![]);
        builder.move_to(second);
        builder.jump(exit, vec![value]);
        builder.move_to(exit);
        builder.ret(Some(param));

        let mut function = builder.build();
        let entry = function.entry_block();
        assert!(function.remove_branch_only_blocks());
        assert_eq!(function.blocks().len(), 2);
        match &function.block(entry).terminator {
            Terminator::Jump(jump) => {
                assert_eq!(jump.target, exit);
                assert_eq!(jump.args, vec![value]);
            }
            other => panic!("expected a jump, got {other:?}"),
        }
    }
}
