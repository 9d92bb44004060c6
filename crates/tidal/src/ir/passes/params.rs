use crate::ir::{BlockId, Function, ValueId};
use std::collections::{BTreeMap, BTreeSet};

impl Function {
    /// Removes block parameters that receive the same value along every
    /// incoming edge (ignoring edges that pass the parameter to itself) and
    /// substitutes that value for the parameter
    pub(crate) fn remove_trivial_params(&mut self) -> bool {
        let mut changed = false;

        loop {
            let Some((block, index, param, replacement)) = self.find_trivial_param() else {
                break;
            };

            if let Some(block) = self.blocks.get_mut(&block) {
                block.params.remove(index);
            }
            for source in self.blocks.values_mut() {
                source.terminator.for_each_edge_mut(|target, args| {
                    if *target == block {
                        args.remove(index);
                    }
                });
            }
            self.substitute(&BTreeMap::from([(param, replacement)]));
            changed = true;
        }

        changed
    }

    fn find_trivial_param(&self) -> Option<(BlockId, usize, ValueId, ValueId)> {
        let mut incoming: BTreeMap<BlockId, Vec<BTreeSet<ValueId>>> = BTreeMap::new();
        for (&id, block) in &self.blocks {
            if id != self.entry {
                incoming.insert(id, vec![BTreeSet::new(); block.params.len()]);
            }
        }

        for source in self.blocks.values() {
            for target in source.terminator.successors() {
                let Some(sets) = incoming.get_mut(&target) else {
                    continue;
                };
                for args in source.terminator.args_to(target) {
                    for (set, &arg) in sets.iter_mut().zip(args) {
                        set.insert(arg);
                    }
                }
            }
        }

        for (block, sets) in incoming {
            for (index, mut set) in sets.into_iter().enumerate() {
                let param = self.blocks[&block].params[index].0;
                set.remove(&param);
                if set.len() == 1 {
                    let replacement = set.into_iter().next()?;
                    return Some((block, index, param, replacement));
                }
            }
        }
        None
    }

    /// Replaces every use of the keys of `map` with the corresponding value
    pub(crate) fn substitute(&mut self, map: &BTreeMap<ValueId, ValueId>) {
        let resolve = |value: &mut ValueId| {
            // Chains can appear when several params collapse into each other
            while let Some(&next) = map.get(value) {
                if next == *value {
                    break;
                }
                *value = next;
            }
        };

        for block in self.blocks.values_mut() {
            for inst in &mut block.body {
                inst.kind.map_operands(resolve);
            }
            block.terminator.map_operands(resolve);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ir::{BinaryOp, CompareOp, FunctionBuilder},
        types::Type,
    };

    #[test]
    fn loop_invariant_params_collapse() {
        // `n` is threaded through the loop header unchanged
        let mut builder = FunctionBuilder::new("invariant", Some(Type::U64));
        let n = builder.add_arg(Type::U64);
        let header = builder.create_block();
        let i = builder.add_block_param(header, Type::U64);
        let n_param = builder.add_block_param(header, Type::U64);
        let body = builder.create_block();
        let exit = builder.create_block();

        let zero = builder.const_bits(Type::U64, 0);
        builder.jump(header, vec![zero, n]);
        builder.move_to(header);
        let cond = builder.compare(CompareOp::Lt, i, n_param);
        builder.branch(cond, body, vec![], exit, vec![]);
        builder.move_to(body);
        let one = builder.const_bits(Type::U64, 1);
        let next = builder.binary(BinaryOp::Add, i, one);
        builder.jump(header, vec![next, n_param]);
        builder.move_to(exit);
        builder.ret(Some(i));

        let mut function = builder.build();
        assert!(function.remove_trivial_params());
        assert_eq!(function.block(header).params, vec![(i, Type::U64)]);
        crate::ir::validate(&function).unwrap();
    }
}
