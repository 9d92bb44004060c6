use crate::{
    ir::{Block, Function, Inst, InstKind, Terminator, ValueId},
    types::{Type, Value},
};
use itertools::Itertools;
use std::fmt::{self, Display};

fn write_args(f: &mut fmt::Formatter<'_>, args: &[ValueId]) -> fmt::Result {
    if args.is_empty() {
        Ok(())
    } else {
        write!(f, "({})", args.iter().join(", "))
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fn {}({})",
            self.name,
            self.args()
                .iter()
                .map(|(value, ty)| format!("{value}: {ty}"))
                .join(", "),
        )?;
        if let Some(ret) = self.ret {
            write!(f, " -> {ret}")?;
        }
        f.write_str(" {\n")?;

        for block in self.blocks.values() {
            write_block(f, self, block)?;
        }
        f.write_str("}")
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, function: &Function, block: &Block) -> fmt::Result {
    write!(f, "{}", block.id)?;
    if !block.params.is_empty() {
        write!(
            f,
            "({})",
            block
                .params
                .iter()
                .map(|(value, ty)| format!("{value}: {ty}"))
                .join(", "),
        )?;
    }
    f.write_str(":")?;
    if block.loop_header {
        f.write_str(" // loop header")?;
    }
    f.write_str("\n")?;

    for inst in &block.body {
        f.write_str("  ")?;
        write_inst(f, function, inst)?;
        f.write_str("\n")?;
    }

    f.write_str("  ")?;
    match &block.terminator {
        Terminator::Jump(jump) => {
            write!(f, "jump {}", jump.target)?;
            write_args(f, &jump.args)?;
        }
        Terminator::Branch(branch) => {
            write!(f, "br {}, {}", branch.cond, branch.truthy)?;
            write_args(f, &branch.truthy_args)?;
            write!(f, ", {}", branch.falsy)?;
            write_args(f, &branch.falsy_args)?;
        }
        Terminator::Return(ret) => match ret.value {
            Some(value) => write!(f, "ret {value}")?,
            None => f.write_str("ret")?,
        },
        Terminator::Unreachable => f.write_str("unreachable")?,
    }
    f.write_str("\n")
}

fn write_inst(f: &mut fmt::Formatter<'_>, function: &Function, inst: &Inst) -> fmt::Result {
    if let Some(dest) = inst.dest {
        let ty = function.value_type(dest).unwrap_or(Type::U64);
        write!(f, "{dest}: {ty} = ")?;
    }

    match &inst.kind {
        InstKind::Const { ty, bits } => write!(f, "const {}", Value::from_bits(*ty, *bits)),
        InstKind::Binary { op, lhs, rhs } => write!(f, "{op} {lhs}, {rhs}"),
        InstKind::Compare { op, lhs, rhs } => write!(f, "cmp.{op} {lhs}, {rhs}"),
        InstKind::Unary { op, value } => write!(f, "{op} {value}"),
        InstKind::Cast { value, to } => write!(f, "cast {value} to {to}"),
        InstKind::Load { ptr, ty } => write!(f, "load.{ty} {ptr}"),
        InstKind::Store { ptr, value } => write!(f, "store {ptr}, {value}"),
        InstKind::PtrAdd { ptr, offset } => write!(f, "ptr_add {ptr}, {offset}"),
        InstKind::Call { proxy, args, .. } => write!(f, "call {proxy}({})", args.iter().join(", ")),
    }
}
