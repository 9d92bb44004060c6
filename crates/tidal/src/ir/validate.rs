use crate::{
    ir::{BinaryOp, BlockId, Function, InstKind, Terminator, UnaryOp, ValueId},
    types::Type,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

type ValidationResult<T = ()> = Result<T, ValidationError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ValidationError {
    #[error("{block} jumps to the missing block {target}")]
    MissingBlock { block: BlockId, target: BlockId },
    #[error("{value} is defined more than once")]
    DuplicateDefinition { value: ValueId },
    #[error("{value} is used in {block} but not defined on every path to it")]
    NotDominated { value: ValueId, block: BlockId },
    #[error("{block} passes {got} arguments to {target}, which takes {expected}")]
    ArgumentCount {
        block: BlockId,
        target: BlockId,
        expected: usize,
        got: usize,
    },
    #[error("type mismatch in {block}: {message}")]
    TypeMismatch { block: BlockId, message: String },
    #[error("{block} is reachable but ends in `unreachable`")]
    ReachableUnreachable { block: BlockId },
    #[error("return in {block} does not match the function's return type")]
    ReturnMismatch { block: BlockId },
}

/// Checks structural and type invariants that every backend relies on.
pub fn validate(function: &Function) -> ValidationResult {
    FunctionValidator::new(function).run()
}

struct FunctionValidator<'a> {
    function: &'a Function,
    /// The block defining every value
    definitions: BTreeMap<ValueId, BlockId>,
}

impl<'a> FunctionValidator<'a> {
    fn new(function: &'a Function) -> Self {
        Self {
            function,
            definitions: BTreeMap::new(),
        }
    }

    fn run(mut self) -> ValidationResult {
        self.collect_definitions()?;

        let dominators = self.function.dominators();
        let reachable: BTreeSet<_> = self.function.reverse_post_order().into_iter().collect();

        for &block_id in &reachable {
            let block = self.function.block(block_id);
            let dominators_of: BTreeSet<BlockId> = dominators
                .dominators(block_id)
                .map(|iter| iter.collect())
                .unwrap_or_default();

            let mut defined_here: BTreeSet<ValueId> =
                block.params.iter().map(|&(value, _)| value).collect();

            let check = |value: ValueId, defined_here: &BTreeSet<ValueId>| -> ValidationResult {
                match self.definitions.get(&value) {
                    Some(&def) if def == block_id && defined_here.contains(&value) => Ok(()),
                    Some(&def) if def != block_id && dominators_of.contains(&def) => Ok(()),
                    _ => Err(ValidationError::NotDominated {
                        value,
                        block: block_id,
                    }),
                }
            };

            for inst in &block.body {
                for operand in inst.kind.operands() {
                    check(operand, &defined_here)?;
                }
                self.check_inst_types(block_id, &inst.kind, inst.dest)?;
                if let Some(dest) = inst.dest {
                    defined_here.insert(dest);
                }
            }

            for operand in block.terminator.operands() {
                check(operand, &defined_here)?;
            }
            self.check_terminator(block_id, &block.terminator)?;
        }

        Ok(())
    }

    fn collect_definitions(&mut self) -> ValidationResult {
        for (&block_id, block) in &self.function.blocks {
            let defined = block
                .params
                .iter()
                .map(|&(value, _)| value)
                .chain(block.body.iter().filter_map(|inst| inst.dest));

            for value in defined {
                if self.definitions.insert(value, block_id).is_some() {
                    return Err(ValidationError::DuplicateDefinition { value });
                }
            }
        }
        Ok(())
    }

    fn ty(&self, value: ValueId) -> Type {
        // Every operand was checked for a definition before its type is needed
        self.function.value_type(value).unwrap_or(Type::U64)
    }

    fn mismatch(block: BlockId, message: String) -> ValidationError {
        ValidationError::TypeMismatch { block, message }
    }

    fn check_inst_types(
        &self,
        block: BlockId,
        kind: &InstKind,
        dest: Option<ValueId>,
    ) -> ValidationResult {
        let dest_ty = dest.and_then(|dest| self.function.value_type(dest));

        match *kind {
            InstKind::Const { ty, .. } => {
                if dest_ty != Some(ty) {
                    return Err(Self::mismatch(block, format!("constant of type {ty}")));
                }
            }

            InstKind::Binary { op, lhs, rhs } => {
                let (lhs_ty, rhs_ty) = (self.ty(lhs), self.ty(rhs));
                if lhs_ty != rhs_ty || !op.supports(lhs_ty) || dest_ty != Some(lhs_ty) {
                    return Err(Self::mismatch(
                        block,
                        format!("{op} {lhs}: {lhs_ty}, {rhs}: {rhs_ty}"),
                    ));
                }
                if op == BinaryOp::Rem && lhs_ty.is_float() {
                    return Err(Self::mismatch(block, format!("float remainder {lhs}")));
                }
            }

            InstKind::Compare { op, lhs, rhs } => {
                let (lhs_ty, rhs_ty) = (self.ty(lhs), self.ty(rhs));
                if lhs_ty != rhs_ty || dest_ty != Some(Type::Bool) {
                    return Err(Self::mismatch(
                        block,
                        format!("cmp.{op} {lhs}: {lhs_ty}, {rhs}: {rhs_ty}"),
                    ));
                }
            }

            InstKind::Unary { op, value } => {
                let ty = self.ty(value);
                let supported = match op {
                    UnaryOp::Not => ty.is_bool() || ty.is_int(),
                    UnaryOp::Neg => ty.is_numeric(),
                };
                if !supported || dest_ty != Some(ty) {
                    return Err(Self::mismatch(block, format!("{op} {value}: {ty}")));
                }
            }

            InstKind::Cast { to, .. } => {
                if dest_ty != Some(to) {
                    return Err(Self::mismatch(block, format!("cast to {to}")));
                }
            }

            InstKind::Load { ptr, ty } => {
                if self.ty(ptr) != Type::Ptr || dest_ty != Some(ty) {
                    return Err(Self::mismatch(block, format!("load.{ty} {ptr}")));
                }
            }

            InstKind::Store { ptr, .. } => {
                if self.ty(ptr) != Type::Ptr {
                    return Err(Self::mismatch(block, format!("store through {ptr}")));
                }
            }

            InstKind::PtrAdd { ptr, offset } => {
                let offset_ty = self.ty(offset);
                if self.ty(ptr) != Type::Ptr || offset_ty.size() != 8 || !offset_ty.is_int() {
                    return Err(Self::mismatch(block, format!("ptr_add {ptr}, {offset}")));
                }
            }

            InstKind::Call { ret, .. } => {
                if dest_ty != ret {
                    return Err(Self::mismatch(block, "call result".to_owned()));
                }
            }
        }

        Ok(())
    }

    fn check_terminator(&self, block: BlockId, terminator: &Terminator) -> ValidationResult {
        let check_edge = |target: BlockId, args: &[ValueId]| -> ValidationResult {
            let target_block = self
                .function
                .blocks
                .get(&target)
                .ok_or(ValidationError::MissingBlock { block, target })?;

            if target_block.params.len() != args.len() {
                return Err(ValidationError::ArgumentCount {
                    block,
                    target,
                    expected: target_block.params.len(),
                    got: args.len(),
                });
            }

            for (&arg, &(param, ty)) in args.iter().zip(&target_block.params) {
                if self.ty(arg) != ty {
                    return Err(Self::mismatch(
                        block,
                        format!("argument {arg} passed to {param}: {ty} of {target}"),
                    ));
                }
            }
            Ok(())
        };

        match terminator {
            Terminator::Jump(jump) => check_edge(jump.target, &jump.args),
            Terminator::Branch(branch) => {
                if self.ty(branch.cond) != Type::Bool {
                    return Err(Self::mismatch(
                        block,
                        format!("branch on non-bool {}", branch.cond),
                    ));
                }
                check_edge(branch.truthy, &branch.truthy_args)?;
                check_edge(branch.falsy, &branch.falsy_args)
            }
            Terminator::Return(ret) => {
                let ty = ret.value.map(|value| self.ty(value));
                if ty != self.function.ret {
                    return Err(ValidationError::ReturnMismatch { block });
                }
                Ok(())
            }
            Terminator::Unreachable => Err(ValidationError::ReachableUnreachable { block }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CompareOp, FunctionBuilder};

    #[test]
    fn accepts_well_formed_loop() {
        let mut builder = FunctionBuilder::new("loop", Some(Type::U64));
        let n = builder.add_arg(Type::U64);
        let header = builder.create_block();
        let i = builder.add_block_param(header, Type::U64);
        let exit = builder.create_block();
        let body = builder.create_block();

        let zero = builder.const_bits(Type::U64, 0);
        builder.jump(header, vec![zero]);
        builder.move_to(header);
        let cond = builder.compare(CompareOp::Lt, i, n);
        builder.branch(cond, body, vec![], exit, vec![]);
        builder.move_to(body);
        let one = builder.const_bits(Type::U64, 1);
        let next = builder.binary(BinaryOp::Add, i, one);
        builder.jump(header, vec![next]);
        builder.move_to(exit);
        builder.ret(Some(i));

        validate(&builder.build()).unwrap();
    }

    #[test]
    fn rejects_values_from_sibling_branches() {
        let mut builder = FunctionBuilder::new("bad", Some(Type::I64));
        let flag = builder.add_arg(Type::Bool);
        let left = builder.create_block();
        let right = builder.create_block();
        let join = builder.create_block();
        builder.branch(flag, left, vec![], right, vec![]);

        builder.move_to(left);
        let value = builder.const_bits(Type::I64, 1);
        builder.jump(join, vec![]);
        builder.move_to(right);
        builder.jump(join, vec![]);
        builder.move_to(join);
        builder.ret(Some(value));

        assert_eq!(
            validate(&builder.build()),
            Err(ValidationError::NotDominated { value, block: join })
        );
    }

    #[test]
    fn rejects_argument_mismatches() {
        let mut builder = FunctionBuilder::new("args", None);
        let target = builder.create_block();
        builder.add_block_param(target, Type::I32);
        builder.jump(target, vec![]);
        builder.move_to(target);
        builder.ret(None);

        let entry = builder.entry();
        assert_eq!(
            validate(&builder.build()),
            Err(ValidationError::ArgumentCount {
                block: entry,
                target,
                expected: 1,
                got: 0
            })
        );
    }

    #[test]
    fn rejects_mixed_operand_types() {
        let mut builder = FunctionBuilder::new("mixed", Some(Type::I32));
        let a = builder.add_arg(Type::I32);
        let b = builder.add_arg(Type::I64);
        let sum = builder.binary(BinaryOp::Add, a, b);
        builder.ret(Some(sum));
        assert!(matches!(
            validate(&builder.build()),
            Err(ValidationError::TypeMismatch { .. })
        ));
    }
}
