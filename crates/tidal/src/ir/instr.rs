use crate::{ir::ValueId, types::Type};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Identifies a host function callable from compiled code, see
/// [`ProxyRegistry`](crate::backend::ProxyRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deserialize, Serialize)]
#[display("proxy{_0}")]
#[serde(transparent)]
pub struct ProxyId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
pub enum BinaryOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    /// Division; integer division by zero yields zero.
    #[display("div")]
    Div,
    /// Integer remainder; a zero divisor yields zero.
    #[display("rem")]
    Rem,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
}

impl BinaryOp {
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor
        )
    }

    /// Returns `true` if the operation accepts operands of type `ty`.
    pub const fn supports(self, ty: Type) -> bool {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div => ty.is_numeric(),
            Self::Rem => ty.is_int(),
            Self::And | Self::Or | Self::Xor => ty.is_int() || ty.is_bool(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
pub enum CompareOp {
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("lt")]
    Lt,
    #[display("le")]
    Le,
    #[display("gt")]
    Gt,
    #[display("ge")]
    Ge,
}

impl CompareOp {
    /// The comparison that holds when the operands are swapped.
    pub const fn flipped(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
pub enum UnaryOp {
    /// Logical not on booleans, bitwise not on integers.
    #[display("not")]
    Not,
    #[display("neg")]
    Neg,
}

/// The operation performed by an instruction.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum InstKind {
    /// A constant in canonical bit form.
    Const { ty: Type, bits: u64 },
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Produces a [`Type::Bool`].
    Compare {
        op: CompareOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Unary { op: UnaryOp, value: ValueId },
    /// Numeric conversion with `as` semantics, float to int saturates.
    Cast { value: ValueId, to: Type },
    /// Unaligned load of a `ty` from `ptr`.
    Load { ptr: ValueId, ty: Type },
    /// Unaligned store of `value` to `ptr`.
    Store { ptr: ValueId, value: ValueId },
    /// Pointer plus a byte offset held in a 64 bit integer.
    PtrAdd { ptr: ValueId, offset: ValueId },
    /// Call of a host function. Arguments are passed as 64 bit integers.
    Call {
        proxy: ProxyId,
        args: SmallVec<[ValueId; 4]>,
        ret: Option<Type>,
    },
}

impl InstKind {
    /// Every value the instruction reads.
    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        match self {
            Self::Const { .. } => SmallVec::new(),
            Self::Binary { lhs, rhs, .. } | Self::Compare { lhs, rhs, .. } => {
                SmallVec::from_slice(&[*lhs, *rhs])
            }
            Self::Unary { value, .. } | Self::Cast { value, .. } => SmallVec::from_slice(&[*value]),
            Self::Load { ptr, .. } => SmallVec::from_slice(&[*ptr]),
            Self::Store { ptr, value } => SmallVec::from_slice(&[*ptr, *value]),
            Self::PtrAdd { ptr, offset } => SmallVec::from_slice(&[*ptr, *offset]),
            Self::Call { args, .. } => args.clone(),
        }
    }

    /// Applies `map` to every operand in place.
    pub fn map_operands(&mut self, mut map: impl FnMut(&mut ValueId)) {
        match self {
            Self::Const { .. } => {}
            Self::Binary { lhs, rhs, .. } | Self::Compare { lhs, rhs, .. } => {
                map(lhs);
                map(rhs);
            }
            Self::Unary { value, .. } | Self::Cast { value, .. } => map(value),
            Self::Load { ptr, .. } => map(ptr),
            Self::Store { ptr, value } => {
                map(ptr);
                map(value);
            }
            Self::PtrAdd { ptr, offset } => {
                map(ptr);
                map(offset);
            }
            Self::Call { args, .. } => args.iter_mut().for_each(map),
        }
    }

    /// Returns `true` if removing the instruction when its result is unused
    /// would change observable behavior.
    pub const fn has_side_effects(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::Call { .. })
    }

    /// Loads are not pure since stores and calls may change memory between
    /// two identical loads.
    pub const fn is_pure(&self) -> bool {
        !matches!(
            self,
            Self::Store { .. } | Self::Call { .. } | Self::Load { .. }
        )
    }
}

/// A single instruction, optionally defining a value.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Inst {
    pub dest: Option<ValueId>,
    pub kind: InstKind,
}

impl Inst {
    pub const fn new(dest: Option<ValueId>, kind: InstKind) -> Self {
        Self { dest, kind }
    }
}
