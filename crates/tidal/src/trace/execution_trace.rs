use crate::{
    ir::{BinaryOp, CompareOp, ProxyId, UnaryOp},
    trace::Tag,
    types::{Type, Value},
};
use itertools::Itertools;
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    fmt::{self, Display},
};

/// A value recorded in a trace. Unlike IR values a trace ref may be
/// assigned more than once, variables are refs that are reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceRef(pub(crate) u32);

impl TraceRef {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for TraceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceBlockId(pub(crate) u32);

impl TraceBlockId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for TraceBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Const {
        ty: Type,
        bits: u64,
    },
    Binary {
        op: BinaryOp,
        lhs: TraceRef,
        rhs: TraceRef,
    },
    Compare {
        op: CompareOp,
        lhs: TraceRef,
        rhs: TraceRef,
    },
    Unary {
        op: UnaryOp,
        value: TraceRef,
    },
    Cast {
        value: TraceRef,
        to: Type,
    },
    Load {
        ptr: TraceRef,
        ty: Type,
    },
    Store {
        ptr: TraceRef,
        value: TraceRef,
    },
    PtrAdd {
        ptr: TraceRef,
        offset: TraceRef,
    },
    Call {
        proxy: ProxyId,
        args: SmallVec<[TraceRef; 4]>,
        ret: Option<Type>,
    },
    /// Copies `src` into the op's result ref
    Assign {
        src: TraceRef,
    },
}

impl OpKind {
    pub fn inputs(&self) -> SmallVec<[TraceRef; 4]> {
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
            Self::Assign { src } => SmallVec::from_slice(&[*src]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceOp {
    /// Untagged ops never take part in control flow merges
    pub tag: Option<Tag>,
    pub kind: OpKind,
    pub result: Option<TraceRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceTerminator {
    Jump {
        target: TraceBlockId,
    },
    Branch {
        cond: TraceRef,
        truthy: TraceBlockId,
        falsy: TraceBlockId,
    },
    Return {
        value: Option<TraceRef>,
    },
}

impl TraceTerminator {
    pub fn successors(&self) -> SmallVec<[TraceBlockId; 2]> {
        match *self {
            Self::Jump { target } => SmallVec::from_slice(&[target]),
            Self::Branch { truthy, falsy, .. } => SmallVec::from_slice(&[truthy, falsy]),
            Self::Return { .. } => SmallVec::new(),
        }
    }

    pub fn inputs(&self) -> Option<TraceRef> {
        match *self {
            Self::Branch { cond, .. } => Some(cond),
            Self::Return { value } => value,
            Self::Jump { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceBlock {
    pub ops: Vec<TraceOp>,
    /// Unset while the block is still being recorded
    pub terminator: Option<TraceTerminator>,
    pub terminator_tag: Option<Tag>,
}

/// The raw, multiply assigned trace of a function's execution across every
/// explored control flow path.
#[derive(Debug, Clone)]
pub struct ExecutionTrace {
    pub(crate) blocks: Vec<TraceBlock>,
    pub(crate) ref_types: Vec<Type>,
    pub(crate) args: Vec<TraceRef>,
    pub(crate) ret: Option<Type>,
    /// The ref every return path assigns its value to
    pub(crate) ret_ref: Option<TraceRef>,
    /// Position of every tagged op, a position one past the last op refers
    /// to the block's terminator
    pub(crate) tags: HashMap<Tag, (TraceBlockId, usize)>,
}

impl ExecutionTrace {
    pub(crate) fn new(params: &[Type], ret: Option<Type>) -> Self {
        let mut trace = Self {
            blocks: vec![TraceBlock::default()],
            ref_types: Vec::new(),
            args: Vec::new(),
            ret,
            ret_ref: None,
            tags: HashMap::new(),
        };
        trace.args = params.iter().map(|&ty| trace.new_ref(ty)).collect();
        trace.ret_ref = ret.map(|ty| trace.new_ref(ty));
        trace
    }

    pub fn blocks(&self) -> &[TraceBlock] {
        &self.blocks
    }

    pub fn block(&self, id: TraceBlockId) -> &TraceBlock {
        &self.blocks[id.index()]
    }

    pub fn args(&self) -> &[TraceRef] {
        &self.args
    }

    pub fn return_type(&self) -> Option<Type> {
        self.ret
    }

    pub fn ref_type(&self, value: TraceRef) -> Type {
        self.ref_types[value.index()]
    }

    pub fn op_count(&self) -> usize {
        self.blocks.iter().map(|block| block.ops.len()).sum()
    }

    pub(crate) fn new_ref(&mut self, ty: Type) -> TraceRef {
        let value = TraceRef(self.ref_types.len() as u32);
        self.ref_types.push(ty);
        value
    }

    pub(crate) fn new_block(&mut self) -> TraceBlockId {
        self.blocks.push(TraceBlock::default());
        TraceBlockId(self.blocks.len() as u32 - 1)
    }

    pub(crate) fn block_mut(&mut self, id: TraceBlockId) -> &mut TraceBlock {
        &mut self.blocks[id.index()]
    }

    /// Splits `block` before the op at `at`. The tail moves into a new block
    /// which the head jumps to. Returns the new block.
    pub(crate) fn split_block(&mut self, block: TraceBlockId, at: usize) -> TraceBlockId {
        let tail = self.new_block();

        let head = self.block_mut(block);
        let ops = head.ops.split_off(at);
        let terminator = head.terminator.replace(TraceTerminator::Jump { target: tail });
        let terminator_tag = head.terminator_tag.take();

        for (index, op) in ops.iter().enumerate() {
            if let Some(tag) = &op.tag {
                self.tags.insert(tag.clone(), (tail, index));
            }
        }
        if let Some(tag) = &terminator_tag {
            self.tags.insert(tag.clone(), (tail, ops.len()));
        }

        *self.block_mut(tail) = TraceBlock {
            ops,
            terminator,
            terminator_tag,
        };
        tail
    }

    /// Predecessors of every block, in block order
    pub fn predecessors(&self) -> Vec<Vec<TraceBlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (index, block) in self.blocks.iter().enumerate() {
            if let Some(terminator) = &block.terminator {
                for target in terminator.successors() {
                    preds[target.index()].push(TraceBlockId(index as u32));
                }
            }
        }
        preds
    }
}

impl Display for ExecutionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, block) in self.blocks.iter().enumerate() {
            writeln!(f, "{}:", TraceBlockId(index as u32))?;
            for op in &block.ops {
                f.write_str("  ")?;
                if let Some(result) = op.result {
                    write!(f, "{result} = ")?;
                }
                match &op.kind {
                    OpKind::Const { ty, bits } => {
                        write!(f, "const {}", Value::from_bits(*ty, *bits))?
                    }
                    OpKind::Binary { op, lhs, rhs } => write!(f, "{op} {lhs}, {rhs}")?,
                    OpKind::Compare { op, lhs, rhs } => write!(f, "cmp.{op} {lhs}, {rhs}")?,
                    OpKind::Unary { op, value } => write!(f, "{op} {value}")?,
                    OpKind::Cast { value, to } => write!(f, "cast {value} to {to}")?,
                    OpKind::Load { ptr, ty } => write!(f, "load.{ty} {ptr}")?,
                    OpKind::Store { ptr, value } => write!(f, "store {ptr}, {value}")?,
                    OpKind::PtrAdd { ptr, offset } => write!(f, "ptr_add {ptr}, {offset}")?,
                    OpKind::Call { proxy, args, .. } => {
                        write!(f, "call {proxy}({})", args.iter().join(", "))?
                    }
                    OpKind::Assign { src } => write!(f, "{src}")?,
                }
                f.write_str("\n")?;
            }

            match &block.terminator {
                Some(TraceTerminator::Jump { target }) => writeln!(f, "  jump {target}")?,
                Some(TraceTerminator::Branch {
                    cond,
                    truthy,
                    falsy,
                }) => writeln!(f, "  br {cond}, {truthy}, {falsy}")?,
                Some(TraceTerminator::Return { value: Some(value) }) => {
                    writeln!(f, "  ret {value}")?
                }
                Some(TraceTerminator::Return { value: None }) => writeln!(f, "  ret")?,
                None => writeln!(f, "  <open>")?,
            }
        }
        Ok(())
    }
}
