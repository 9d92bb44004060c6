use crate::ir::{BlockId, ValueId};
use derive_more::From;
use serde::{Deserialize, Serialize};

/// A block terminator
///
/// The final instruction within a given basic block must be one that continues
/// control flow somehow, either through branching to another block
/// (conditionally or otherwise) or by returning from the function
#[derive(Debug, Clone, From, PartialEq, Deserialize, Serialize)]
pub enum Terminator {
    Jump(Jump),
    Branch(Branch),
    Return(Return),
    Unreachable,
}

impl Terminator {
    /// Returns true if the current terminator is a [`Jump`]
    #[must_use]
    pub const fn is_jump(&self) -> bool {
        matches!(self, Self::Jump(_))
    }

    /// Returns true if the current terminator is a [`Branch`]
    #[must_use]
    pub const fn is_branch(&self) -> bool {
        matches!(self, Self::Branch(_))
    }

    /// Returns true if the current terminator is a [`Return`]
    #[must_use]
    pub const fn is_return(&self) -> bool {
        matches!(self, Self::Return(_))
    }

    #[must_use]
    pub const fn as_jump(&self) -> Option<&Jump> {
        if let Self::Jump(jump) = self {
            Some(jump)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_branch(&self) -> Option<&Branch> {
        if let Self::Branch(branch) = self {
            Some(branch)
        } else {
            None
        }
    }

    /// Every block control may flow to, in order, possibly with duplicates.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Jump(jump) => vec![jump.target],
            Self::Branch(branch) => vec![branch.truthy, branch.falsy],
            Self::Return(_) | Self::Unreachable => Vec::new(),
        }
    }

    /// Every value read by the terminator, block arguments included.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Self::Jump(jump) => jump.args.clone(),
            Self::Branch(branch) => {
                let mut operands = Vec::with_capacity(1 + branch.truthy_args.len() + branch.falsy_args.len());
                operands.push(branch.cond);
                operands.extend_from_slice(&branch.truthy_args);
                operands.extend_from_slice(&branch.falsy_args);
                operands
            }
            Self::Return(ret) => ret.value.into_iter().collect(),
            Self::Unreachable => Vec::new(),
        }
    }

    /// Applies `map` to every value read by the terminator.
    pub fn map_operands(&mut self, mut map: impl FnMut(&mut ValueId)) {
        match self {
            Self::Jump(jump) => jump.args.iter_mut().for_each(map),
            Self::Branch(branch) => {
                map(&mut branch.cond);
                branch.truthy_args.iter_mut().for_each(&mut map);
                branch.falsy_args.iter_mut().for_each(map);
            }
            Self::Return(ret) => {
                if let Some(value) = ret.value.as_mut() {
                    map(value);
                }
            }
            Self::Unreachable => {}
        }
    }

    /// Calls `edge` for every outgoing edge with the edge's arguments.
    pub fn for_each_edge_mut(&mut self, mut edge: impl FnMut(&mut BlockId, &mut Vec<ValueId>)) {
        match self {
            Self::Jump(jump) => edge(&mut jump.target, &mut jump.args),
            Self::Branch(branch) => {
                edge(&mut branch.truthy, &mut branch.truthy_args);
                edge(&mut branch.falsy, &mut branch.falsy_args);
            }
            Self::Return(_) | Self::Unreachable => {}
        }
    }

    /// The arguments passed along every edge into `target`.
    pub fn args_to(&self, target: BlockId) -> Vec<&[ValueId]> {
        let mut args = Vec::new();
        match self {
            Self::Jump(jump) if jump.target == target => args.push(jump.args.as_slice()),
            Self::Branch(branch) => {
                if branch.truthy == target {
                    args.push(branch.truthy_args.as_slice());
                }
                if branch.falsy == target {
                    args.push(branch.falsy_args.as_slice());
                }
            }
            _ => {}
        }
        args
    }
}

/// An unconditional branch instruction
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Jump {
    /// The block being jumped to
    pub target: BlockId,
    /// The parameters being passed to the target block by the jump
    pub args: Vec<ValueId>,
}

impl Jump {
    pub const fn new(target: BlockId, args: Vec<ValueId>) -> Self {
        Self { target, args }
    }
}

/// A conditional branch on a boolean value
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Branch {
    pub cond: ValueId,
    pub truthy: BlockId,
    pub truthy_args: Vec<ValueId>,
    pub falsy: BlockId,
    pub falsy_args: Vec<ValueId>,
}

impl Branch {
    pub const fn new(
        cond: ValueId,
        truthy: BlockId,
        truthy_args: Vec<ValueId>,
        falsy: BlockId,
        falsy_args: Vec<ValueId>,
    ) -> Self {
        Self {
            cond,
            truthy,
            truthy_args,
            falsy,
            falsy_args,
        }
    }
}

/// Returns from the function, with a value if the function has a return type
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Return {
    pub value: Option<ValueId>,
}

impl Return {
    pub const fn new(value: Option<ValueId>) -> Self {
        Self { value }
    }
}
