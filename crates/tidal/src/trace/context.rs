use crate::{
    ir::{BinaryOp, CompareOp, ProxyId, UnaryOp},
    trace::{
        ExecutionTrace, OpKind, Tag, TraceBlockId, TraceError, TraceOp, TraceRef, TraceResult,
        TraceTerminator,
    },
    types::{Type, Value},
};
use smallvec::SmallVec;
use std::panic::Location;
use tidal_types::config::CompilerConfig;

/// A traced value, only meaningful within the trace that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Val {
    id: TraceRef,
    ty: Type,
}

impl Val {
    pub const fn ty(self) -> Type {
        self.ty
    }

    pub(crate) const fn id(self) -> TraceRef {
        self.id
    }
}

/// A mutable variable. Every value that flows out of a conditional or
/// around a loop has to go through one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var {
    id: TraceRef,
    ty: Type,
}

impl Var {
    pub const fn ty(self) -> Type {
        self.ty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceOptions {
    /// How many times the traced function may be re-executed
    pub max_iterations: usize,
    /// Maximum number of frames in a tag
    pub max_frames: usize,
}

impl TraceOptions {
    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            max_iterations: config.max_trace_iterations,
            ..Self::default()
        }
    }
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            max_iterations: 4096,
            max_frames: 8,
        }
    }
}

/// Where the result of an op goes
#[derive(Debug, Clone, Copy)]
enum Dest {
    None,
    Fresh(Type),
    Ref(TraceRef),
}

/// What the current execution is about to add at a merge point
enum Pending<'a> {
    Op(&'a OpKind, Dest),
    Branch(TraceRef),
    Return(Option<TraceRef>),
}

/// Records the operations of one execution of a traced function.
///
/// Execution always starts over from the entry. Operations that were
/// already recorded along the current path are replayed, once the path
/// reaches a block without a terminator new operations are appended to it.
pub struct TraceContext<'a> {
    trace: &'a mut ExecutionTrace,
    block: TraceBlockId,
    index: usize,
    /// Branch decisions this execution has to follow
    prefix: &'a [bool],
    decisions: Vec<bool>,
    /// Decision prefixes of the paths discovered by this execution
    pending: Vec<Vec<bool>>,
    frames: SmallVec<[u32; 8]>,
    options: &'a TraceOptions,
}

impl<'a> TraceContext<'a> {
    fn new(trace: &'a mut ExecutionTrace, prefix: &'a [bool], options: &'a TraceOptions) -> Self {
        Self {
            trace,
            block: TraceBlockId(0),
            index: 0,
            prefix,
            decisions: Vec::new(),
            pending: Vec::new(),
            frames: SmallVec::new(),
            options,
        }
    }

    /// The `index`th argument of the traced function
    pub fn arg(&self, index: usize) -> Val {
        let id = self.trace.args[index];
        Val {
            id,
            ty: self.trace.ref_type(id),
        }
    }

    pub fn push_frame(&mut self, frame: u32) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    /// Runs `f` with `frame` pushed, use this whenever the same code is
    /// traced several times within straight line code, e.g. while looping
    /// over the fields of a schema
    pub fn frame<R>(
        &mut self,
        frame: u32,
        f: impl FnOnce(&mut Self) -> TraceResult<R>,
    ) -> TraceResult<R> {
        self.push_frame(frame);
        let result = f(self);
        self.pop_frame();
        result
    }

    #[track_caller]
    fn tag(&self) -> TraceResult<Tag> {
        if self.frames.len() > self.options.max_frames {
            return Err(TraceError::TagTooDeep {
                depth: self.frames.len(),
            });
        }
        Ok(Tag::new(Location::caller(), &self.frames))
    }

    fn nondeterministic(&self, tag: Option<&Tag>) -> TraceError {
        TraceError::NonDeterministic {
            location: tag.map_or_else(|| "<return>".to_owned(), ToString::to_string),
            block: self.block.to_string(),
        }
    }

    /// Follows jumps until the current position is an op, a terminator that
    /// isn't a jump, or the open end of a block. Returns `true` if the
    /// position is the open end of a block.
    fn advance(&mut self) -> bool {
        loop {
            let block = self.trace.block(self.block);
            if self.index < block.ops.len() {
                return false;
            }
            match block.terminator {
                Some(TraceTerminator::Jump { target }) => {
                    self.block = target;
                    self.index = 0;
                }
                Some(_) => return false,
                None => return true,
            }
        }
    }

    fn record(&mut self, tag: Option<Tag>, kind: OpKind, dest: Dest) -> TraceResult<Option<TraceRef>> {
        if !self.advance() {
            let block = self.trace.block(self.block);
            let Some(op) = block.ops.get(self.index) else {
                return Err(self.nondeterministic(tag.as_ref()));
            };
            if op.tag != tag || op.kind != kind || !self.dest_matches(dest, op.result) {
                return Err(self.nondeterministic(tag.as_ref()));
            }
            let result = op.result;
            self.index += 1;
            return Ok(result);
        }

        if let Some(tag) = &tag {
            if let Some(&(block, index)) = self.trace.tags.get(tag) {
                return Err(self.merge(tag, block, index, Pending::Op(&kind, dest)));
            }
        }

        let result = match dest {
            Dest::None => None,
            Dest::Fresh(ty) => Some(self.trace.new_ref(ty)),
            Dest::Ref(value) => Some(value),
        };
        if let Some(tag) = &tag {
            self.trace
                .tags
                .insert(tag.clone(), (self.block, self.index));
        }
        self.trace
            .block_mut(self.block)
            .ops
            .push(TraceOp { tag, kind, result });
        self.index += 1;
        Ok(result)
    }

    fn dest_matches(&self, dest: Dest, result: Option<TraceRef>) -> bool {
        match (dest, result) {
            (Dest::None, None) => true,
            (Dest::Fresh(ty), Some(result)) => self.trace.ref_type(result) == ty,
            (Dest::Ref(value), Some(result)) => value == result,
            _ => false,
        }
    }

    /// Joins the current path with the already recorded operation at
    /// `(block, index)`. Always returns an error, [`TraceError::Halted`] if
    /// the merge succeeded.
    fn merge(&mut self, tag: &Tag, block: TraceBlockId, index: usize, pending: Pending<'_>) -> TraceError {
        if block == self.block {
            return TraceError::AmbiguousTag {
                location: tag.to_string(),
            };
        }

        let existing = self.trace.block(block);
        let consistent = match (existing.ops.get(index), &existing.terminator, pending) {
            (Some(op), _, Pending::Op(kind, dest)) => {
                op.kind == *kind && self.dest_matches(dest, op.result)
            }
            (None, Some(TraceTerminator::Branch { cond, .. }), Pending::Branch(value)) => {
                *cond == value
            }
            (None, Some(TraceTerminator::Return { value }), Pending::Return(returned)) => {
                *value == returned
            }
            _ => false,
        };
        if !consistent {
            return TraceError::DivergentMerge {
                location: tag.to_string(),
            };
        }

        let target = if index == 0 {
            block
        } else {
            self.trace.split_block(block, index)
        };
        tracing::trace!("merged {} into {target} at {tag}", self.block);
        self.trace.block_mut(self.block).terminator = Some(TraceTerminator::Jump { target });
        TraceError::Halted
    }

    fn decide(&mut self, new_branch: bool) -> bool {
        let decision = match self.prefix.get(self.decisions.len()) {
            Some(&decision) => decision,
            None => {
                if new_branch {
                    let mut alternative = self.decisions.clone();
                    alternative.push(false);
                    self.pending.push(alternative);
                }
                true
            }
        };
        self.decisions.push(decision);
        decision
    }

    fn value(&mut self, tag: Tag, kind: OpKind, ty: Type) -> TraceResult<Val> {
        match self.record(Some(tag), kind, Dest::Fresh(ty))? {
            Some(id) => Ok(Val { id, ty }),
            None => unreachable!("op with a fresh destination has no result"),
        }
    }

    fn type_mismatch(message: String) -> TraceError {
        TraceError::TypeMismatch { message }
    }

    #[track_caller]
    pub fn constant(&mut self, value: impl Into<Value>) -> TraceResult<Val> {
        let value = value.into();
        let tag = self.tag()?;
        let ty = value.ty();
        self.value(
            tag,
            OpKind::Const {
                ty,
                bits: value.to_bits(),
            },
            ty,
        )
    }

    #[track_caller]
    pub fn const_bits(&mut self, ty: Type, bits: u64) -> TraceResult<Val> {
        let tag = self.tag()?;
        self.value(
            tag,
            OpKind::Const {
                ty,
                bits: bits & ty.mask(),
            },
            ty,
        )
    }

    #[track_caller]
    pub fn binary(&mut self, op: BinaryOp, lhs: Val, rhs: Val) -> TraceResult<Val> {
        let tag = self.tag()?;
        if lhs.ty != rhs.ty || !op.supports(lhs.ty) || (op == BinaryOp::Rem && lhs.ty.is_float()) {
            return Err(Self::type_mismatch(format!(
                "{op} of {} and {} at {tag}",
                lhs.ty, rhs.ty
            )));
        }
        self.value(
            tag,
            OpKind::Binary {
                op,
                lhs: lhs.id,
                rhs: rhs.id,
            },
            lhs.ty,
        )
    }

    #[track_caller]
    pub fn add(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    #[track_caller]
    pub fn sub(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    #[track_caller]
    pub fn mul(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    #[track_caller]
    pub fn div(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    #[track_caller]
    pub fn rem(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.binary(BinaryOp::Rem, lhs, rhs)
    }

    #[track_caller]
    pub fn and(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.binary(BinaryOp::And, lhs, rhs)
    }

    #[track_caller]
    pub fn or(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.binary(BinaryOp::Or, lhs, rhs)
    }

    #[track_caller]
    pub fn compare(&mut self, op: CompareOp, lhs: Val, rhs: Val) -> TraceResult<Val> {
        let tag = self.tag()?;
        if lhs.ty != rhs.ty {
            return Err(Self::type_mismatch(format!(
                "comparison of {} and {} at {tag}",
                lhs.ty, rhs.ty
            )));
        }
        self.value(
            tag,
            OpKind::Compare {
                op,
                lhs: lhs.id,
                rhs: rhs.id,
            },
            Type::Bool,
        )
    }

    #[track_caller]
    pub fn eq(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.compare(CompareOp::Eq, lhs, rhs)
    }

    #[track_caller]
    pub fn lt(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.compare(CompareOp::Lt, lhs, rhs)
    }

    #[track_caller]
    pub fn ge(&mut self, lhs: Val, rhs: Val) -> TraceResult<Val> {
        self.compare(CompareOp::Ge, lhs, rhs)
    }

    #[track_caller]
    pub fn unary(&mut self, op: UnaryOp, value: Val) -> TraceResult<Val> {
        let tag = self.tag()?;
        let supported = match op {
            UnaryOp::Not => value.ty.is_bool() || value.ty.is_int(),
            UnaryOp::Neg => value.ty.is_numeric(),
        };
        if !supported {
            return Err(Self::type_mismatch(format!(
                "{op} of {} at {tag}",
                value.ty
            )));
        }
        self.value(tag, OpKind::Unary { op, value: value.id }, value.ty)
    }

    #[track_caller]
    pub fn not(&mut self, value: Val) -> TraceResult<Val> {
        self.unary(UnaryOp::Not, value)
    }

    /// Converts `value` to `to`, a no-op if it already has that type
    #[track_caller]
    pub fn cast(&mut self, value: Val, to: Type) -> TraceResult<Val> {
        if value.ty == to {
            return Ok(value);
        }
        let tag = self.tag()?;
        self.value(tag, OpKind::Cast { value: value.id, to }, to)
    }

    #[track_caller]
    pub fn load(&mut self, ptr: Val, ty: Type) -> TraceResult<Val> {
        let tag = self.tag()?;
        if ptr.ty != Type::Ptr {
            return Err(Self::type_mismatch(format!(
                "load through {} at {tag}",
                ptr.ty
            )));
        }
        self.value(tag, OpKind::Load { ptr: ptr.id, ty }, ty)
    }

    #[track_caller]
    pub fn store(&mut self, ptr: Val, value: Val) -> TraceResult<()> {
        let tag = self.tag()?;
        if ptr.ty != Type::Ptr {
            return Err(Self::type_mismatch(format!(
                "store through {} at {tag}",
                ptr.ty
            )));
        }
        self.record(
            Some(tag),
            OpKind::Store {
                ptr: ptr.id,
                value: value.id,
            },
            Dest::None,
        )?;
        Ok(())
    }

    #[track_caller]
    pub fn ptr_add(&mut self, ptr: Val, offset: Val) -> TraceResult<Val> {
        let tag = self.tag()?;
        if ptr.ty != Type::Ptr || !matches!(offset.ty, Type::I64 | Type::U64) {
            return Err(Self::type_mismatch(format!(
                "ptr_add of {} and {} at {tag}",
                ptr.ty, offset.ty
            )));
        }
        self.value(
            tag,
            OpKind::PtrAdd {
                ptr: ptr.id,
                offset: offset.id,
            },
            Type::Ptr,
        )
    }

    /// Calls a registered proxy function
    #[track_caller]
    pub fn call(&mut self, proxy: ProxyId, args: &[Val], ret: Option<Type>) -> TraceResult<Option<Val>> {
        let tag = self.tag()?;
        let kind = OpKind::Call {
            proxy,
            args: args.iter().map(|arg| arg.id).collect(),
            ret,
        };
        let dest = ret.map_or(Dest::None, Dest::Fresh);
        let result = self.record(Some(tag), kind, dest)?;
        Ok(result.zip(ret).map(|(id, ty)| Val { id, ty }))
    }

    /// Calls a proxy function returning a value
    #[track_caller]
    pub fn call_value(&mut self, proxy: ProxyId, args: &[Val], ret: Type) -> TraceResult<Val> {
        self.call(proxy, args, Some(ret))?
            .ok_or_else(|| Self::type_mismatch(format!("{proxy} returned no value")))
    }

    #[track_caller]
    pub fn var(&mut self, init: Val) -> TraceResult<Var> {
        let tag = self.tag()?;
        let Val { id, ty } = self.value(tag, OpKind::Assign { src: init.id }, init.ty)?;
        Ok(Var { id, ty })
    }

    /// Reads the current value of `var`
    #[track_caller]
    pub fn get(&mut self, var: Var) -> TraceResult<Val> {
        let tag = self.tag()?;
        self.value(tag, OpKind::Assign { src: var.id }, var.ty)
    }

    #[track_caller]
    pub fn set(&mut self, var: Var, value: Val) -> TraceResult<()> {
        let tag = self.tag()?;
        if var.ty != value.ty {
            return Err(Self::type_mismatch(format!(
                "assignment of {} to a {} variable at {tag}",
                value.ty, var.ty
            )));
        }
        self.record(Some(tag), OpKind::Assign { src: value.id }, Dest::Ref(var.id))?;
        Ok(())
    }

    /// Splits control flow on `cond`. Returns the side the current execution
    /// continues on, the other side is traced by a later execution.
    #[track_caller]
    pub fn branch(&mut self, cond: Val) -> TraceResult<bool> {
        let tag = self.tag()?;
        if cond.ty != Type::Bool {
            return Err(Self::type_mismatch(format!(
                "branch on {} at {tag}",
                cond.ty
            )));
        }

        if !self.advance() {
            let block = self.trace.block(self.block);
            return match block.terminator {
                Some(TraceTerminator::Branch {
                    cond: recorded,
                    truthy,
                    falsy,
                }) if self.index == block.ops.len()
                    && recorded == cond.id
                    && block.terminator_tag.as_ref() == Some(&tag) =>
                {
                    let decision = self.decide(false);
                    self.block = if decision { truthy } else { falsy };
                    self.index = 0;
                    Ok(decision)
                }
                _ => Err(self.nondeterministic(Some(&tag))),
            };
        }

        if let Some(&(block, index)) = self.trace.tags.get(&tag) {
            return Err(self.merge(&tag, block, index, Pending::Branch(cond.id)));
        }

        let truthy = self.trace.new_block();
        let falsy = self.trace.new_block();
        let position = self.trace.block(self.block).ops.len();
        self.trace.tags.insert(tag.clone(), (self.block, position));

        let block = self.trace.block_mut(self.block);
        block.terminator = Some(TraceTerminator::Branch {
            cond: cond.id,
            truthy,
            falsy,
        });
        block.terminator_tag = Some(tag);

        let decision = self.decide(true);
        self.block = if decision { truthy } else { falsy };
        self.index = 0;
        Ok(decision)
    }

    /// Ends the current execution by returning `value`
    fn finish(&mut self, value: Option<Val>) -> TraceResult<()> {
        let ret = match (value, self.trace.ret_ref) {
            (Some(value), Some(ret)) if value.ty == self.trace.ref_type(ret) => {
                self.record(None, OpKind::Assign { src: value.id }, Dest::Ref(ret))?;
                Some(ret)
            }
            (None, None) => None,
            (value, _) => {
                return Err(Self::type_mismatch(format!(
                    "returned {:?} from a function returning {:?}",
                    value.map(Val::ty),
                    self.trace.ret,
                )))
            }
        };

        let tag = Tag::new(Location::caller(), &[]);
        if !self.advance() {
            let block = self.trace.block(self.block);
            return match &block.terminator {
                Some(TraceTerminator::Return { value })
                    if self.index == block.ops.len() && *value == ret =>
                {
                    Ok(())
                }
                _ => Err(self.nondeterministic(None)),
            };
        }

        if let Some(&(block, index)) = self.trace.tags.get(&tag) {
            return Err(self.merge(&tag, block, index, Pending::Return(ret)));
        }

        let position = self.trace.block(self.block).ops.len();
        self.trace.tags.insert(tag.clone(), (self.block, position));
        let block = self.trace.block_mut(self.block);
        block.terminator = Some(TraceTerminator::Return { value: ret });
        block.terminator_tag = Some(tag);
        Ok(())
    }
}

/// Traces `body` into an [`ExecutionTrace`], executing it once for every
/// control flow path.
///
/// `body` must be deterministic given the branch decisions it observes:
/// every execution that takes the same decisions has to perform the same
/// operations in the same order.
pub fn trace_function<F>(
    params: &[Type],
    ret: Option<Type>,
    options: &TraceOptions,
    mut body: F,
) -> TraceResult<ExecutionTrace>
where
    F: FnMut(&mut TraceContext<'_>) -> TraceResult<Option<Val>>,
{
    let mut trace = ExecutionTrace::new(params, ret);
    let mut worklist: Vec<Vec<bool>> = vec![Vec::new()];
    let mut iterations = 0;

    while let Some(prefix) = worklist.pop() {
        iterations += 1;
        if iterations > options.max_iterations {
            return Err(TraceError::TraceLimitExceeded {
                iterations: options.max_iterations,
            });
        }

        let mut ctx = TraceContext::new(&mut trace, &prefix, options);
        let outcome = body(&mut ctx).and_then(|value| ctx.finish(value));
        let pending = ctx.pending;
        match outcome {
            Ok(()) | Err(TraceError::Halted) => {}
            Err(error) => return Err(error),
        }
        worklist.extend(pending);
    }

    tracing::trace!(
        "traced {} blocks with {} ops in {iterations} executions",
        trace.blocks.len(),
        trace.op_count(),
    );
    Ok(trace)
}
