use crate::ir::{eval, Function, InstKind, Jump, Terminator, ValueId};
use crate::types::Type;
use std::collections::BTreeMap;

impl Function {
    /// Evaluates instructions whose operands are all constants and turns
    /// branches on constant conditions into jumps
    pub(crate) fn fold_constants(&mut self) -> bool {
        let mut constants: BTreeMap<ValueId, (Type, u64)> = BTreeMap::new();
        let mut folded = 0usize;
        let mut branches = 0usize;

        // Definitions dominate their uses so a reverse post order sees every
        // constant operand before the instructions using it
        for block_id in self.reverse_post_order() {
            let Some(block) = self.blocks.get_mut(&block_id) else {
                continue;
            };

            for inst in &mut block.body {
                let Some(dest) = inst.dest else {
                    continue;
                };
                if let InstKind::Const { ty, bits } = inst.kind {
                    constants.insert(dest, (ty, bits));
                    continue;
                }

                let operand = |value: &ValueId| constants.get(value).copied();
                let result = match inst.kind {
                    InstKind::Binary { op, lhs, rhs } => operand(&lhs)
                        .zip(operand(&rhs))
                        .map(|((ty, lhs), (_, rhs))| (ty, eval::binary(op, ty, lhs, rhs))),
                    InstKind::Compare { op, lhs, rhs } => operand(&lhs)
                        .zip(operand(&rhs))
                        .map(|((ty, lhs), (_, rhs))| {
                            (Type::Bool, eval::compare(op, ty, lhs, rhs) as u64)
                        }),
                    InstKind::Unary { op, value } => {
                        operand(&value).map(|(ty, bits)| (ty, eval::unary(op, ty, bits)))
                    }
                    InstKind::Cast { value, to } => {
                        operand(&value).map(|(from, bits)| (to, eval::cast(from, to, bits)))
                    }
                    InstKind::Const { .. }
                    | InstKind::Load { .. }
                    | InstKind::Store { .. }
                    | InstKind::PtrAdd { .. }
                    | InstKind::Call { .. } => None,
                };

                if let Some((ty, bits)) = result {
                    inst.kind = InstKind::Const { ty, bits };
                    constants.insert(dest, (ty, bits));
                    folded += 1;
                }
            }

            if let Terminator::Branch(branch) = &block.terminator {
                if let Some(&(_, cond)) = constants.get(&branch.cond) {
                    let (target, args) = if cond != 0 {
                        (branch.truthy, branch.truthy_args.clone())
                    } else {
                        (branch.falsy, branch.falsy_args.clone())
                    };
                    block.terminator = Jump::new(target, args).into();
                    branches += 1;
                }
            }
        }

        if folded + branches != 0 {
            tracing::trace!("folded {folded} instructions and {branches} branches");
        }
        folded + branches != 0
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        ir::{BinaryOp, CompareOp, FunctionBuilder, InstKind, Terminator},
        types::Type,
    };

    #[test]
    fn folds_arithmetic_and_branches() {
        let mut builder = FunctionBuilder::new("fold", Some(Type::I32));
        let taken = builder.create_block();
        let skipped = builder.create_block();

        let six = builder.const_bits(Type::I32, 6);
        let seven = builder.const_bits(Type::I32, 7);
        let product = builder.binary(BinaryOp::Mul, six, seven);
        let cond = builder.compare(CompareOp::Gt, product, six);
        builder.branch(cond, taken, vec![], skipped, vec![]);
        builder.move_to(taken);
        builder.ret(Some(product));
        builder.move_to(skipped);
        builder.ret(Some(six));

        let mut function = builder.build();
        let entry = function.entry_block();
        assert!(function.fold_constants());

        let body = &function.block(entry).body;
        assert_eq!(
            body[2].kind,
            InstKind::Const {
                ty: Type::I32,
                bits: 42
            }
        );
        assert!(matches!(
            &function.block(entry).terminator,
            Terminator::Jump(jump) if jump.target == taken
        ));

        assert!(function.remove_unreachable_blocks());
        assert!(!function.blocks().contains_key(&skipped));
    }
}
