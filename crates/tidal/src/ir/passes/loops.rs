use crate::ir::Function;

impl Function {
    /// Marks the target of every back edge, an edge whose target dominates
    /// its source, as a loop header
    pub(crate) fn detect_loops(&mut self) -> usize {
        let dominators = self.dominators();
        let mut headers = Vec::new();

        for (&id, block) in &self.blocks {
            for target in block.terminator.successors() {
                let is_back_edge = dominators
                    .dominators(id)
                    .is_some_and(|mut doms| doms.any(|dom| dom == target));
                if is_back_edge {
                    headers.push(target);
                }
            }
        }

        for block in self.blocks.values_mut() {
            block.loop_header = headers.contains(&block.id);
        }

        headers.sort();
        headers.dedup();
        tracing::trace!("found {} loops", headers.len());
        headers.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ir::{BinaryOp, CompareOp, FunctionBuilder},
        types::Type,
    };

    #[test]
    fn nested_loops() {
        let mut builder = FunctionBuilder::new("nested", None);
        let n = builder.add_arg(Type::U64);
        let outer = builder.create_block();
        let i = builder.add_block_param(outer, Type::U64);
        let inner = builder.create_block();
        let j = builder.add_block_param(inner, Type::U64);
        let inner_body = builder.create_block();
        let outer_latch = builder.create_block();
        let exit = builder.create_block();

        let zero = builder.const_bits(Type::U64, 0);
        builder.jump(outer, vec![zero]);

        builder.move_to(outer);
        let outer_cond = builder.compare(CompareOp::Lt, i, n);
        builder.branch(outer_cond, inner, vec![zero], exit, vec![]);

        builder.move_to(inner);
        let inner_cond = builder.compare(CompareOp::Lt, j, n);
        builder.branch(inner_cond, inner_body, vec![], outer_latch, vec![]);

        builder.move_to(inner_body);
        let one = builder.const_bits(Type::U64, 1);
        let j_next = builder.binary(BinaryOp::Add, j, one);
        builder.jump(inner, vec![j_next]);

        builder.move_to(outer_latch);
        let one = builder.const_bits(Type::U64, 1);
        let i_next = builder.binary(BinaryOp::Add, i, one);
        builder.jump(outer, vec![i_next]);

        builder.move_to(exit);
        builder.ret(None);

        let mut function = builder.build();
        assert_eq!(function.detect_loops(), 2);
        assert_eq!(function.loop_headers(), vec![outer, inner]);
    }
}
