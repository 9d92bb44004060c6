use crate::{
    ir::{BlockId, Function, FunctionBuilder, ValueId},
    trace::{ExecutionTrace, OpKind, TraceError, TraceRef, TraceResult, TraceTerminator},
};
use std::collections::{BTreeMap, BTreeSet};

impl ExecutionTrace {
    /// Converts the trace into SSA form.
    ///
    /// Every block receives the refs that are live on entry to it as block
    /// parameters. Assignments disappear, they only rebind a ref to the value
    /// of another one.
    pub fn to_ssa(&self, name: &str) -> TraceResult<Function> {
        let reachable = self.reachable();
        let live_in = self.live_in();

        let mut builder = FunctionBuilder::new(name, self.ret);
        let args: Vec<ValueId> = self
            .args
            .iter()
            .map(|&arg| builder.add_arg(self.ref_type(arg)))
            .collect();

        // Only the arguments may be live on entry
        let arg_set: BTreeSet<TraceRef> = self.args.iter().copied().collect();
        if let Some(&undefined) = live_in[0].difference(&arg_set).next() {
            return Err(TraceError::UndefinedValue {
                value: undefined.to_string(),
            });
        }

        // The entry block can't have predecessors, a loop back to the very
        // first operation gets a fresh entry in front of it
        let entry_has_preds = !self.predecessors()[0].is_empty();

        let mut blocks: BTreeMap<usize, BlockId> = BTreeMap::new();
        let mut params: BTreeMap<usize, Vec<TraceRef>> = BTreeMap::new();
        for &index in &reachable {
            if index == 0 && !entry_has_preds {
                blocks.insert(0, builder.entry());
                params.insert(0, self.args.clone());
                continue;
            }

            let block = builder.create_block();
            let refs: Vec<TraceRef> = live_in[index].iter().copied().collect();
            for &value in &refs {
                builder.add_block_param(block, self.ref_type(value));
            }
            blocks.insert(index, block);
            params.insert(index, refs);
        }

        if entry_has_preds {
            let mapping: BTreeMap<TraceRef, ValueId> =
                self.args.iter().copied().zip(args.iter().copied()).collect();
            let jump_args = edge_args(&params[&0], &mapping)?;
            builder.jump(blocks[&0], jump_args);
        }

        for &index in &reachable {
            let ir_block = blocks[&index];
            builder.move_to(ir_block);

            let mut mapping: BTreeMap<TraceRef, ValueId> = params[&index]
                .iter()
                .copied()
                .zip(builder.block_params(ir_block))
                .collect();
            let lookup = |mapping: &BTreeMap<TraceRef, ValueId>, value: TraceRef| {
                mapping
                    .get(&value)
                    .copied()
                    .ok_or_else(|| TraceError::UndefinedValue {
                        value: value.to_string(),
                    })
            };

            let block = &self.blocks[index];
            for trace_op in &block.ops {
                let value = match trace_op.kind {
                    OpKind::Assign { src } => Some(lookup(&mapping, src)?),
                    OpKind::Const { ty, bits } => Some(builder.const_bits(ty, bits)),
                    OpKind::Binary { op, lhs, rhs } => Some(builder.binary(
                        op,
                        lookup(&mapping, lhs)?,
                        lookup(&mapping, rhs)?,
                    )),
                    OpKind::Compare { op, lhs, rhs } => Some(builder.compare(
                        op,
                        lookup(&mapping, lhs)?,
                        lookup(&mapping, rhs)?,
                    )),
                    OpKind::Unary { op, value } => {
                        Some(builder.unary(op, lookup(&mapping, value)?))
                    }
                    OpKind::Cast { value, to } => Some(builder.cast(lookup(&mapping, value)?, to)),
                    OpKind::Load { ptr, ty } => Some(builder.load(lookup(&mapping, ptr)?, ty)),
                    OpKind::Store { ptr, value } => {
                        builder.store(lookup(&mapping, ptr)?, lookup(&mapping, value)?);
                        None
                    }
                    OpKind::PtrAdd { ptr, offset } => Some(
                        builder.ptr_add(lookup(&mapping, ptr)?, lookup(&mapping, offset)?),
                    ),
                    OpKind::Call {
                        proxy,
                        ref args,
                        ret,
                    } => {
                        let args = args
                            .iter()
                            .map(|&arg| lookup(&mapping, arg))
                            .collect::<TraceResult<Vec<_>>>()?;
                        builder.call(proxy, &args, ret)
                    }
                };

                if let (Some(result), Some(value)) = (trace_op.result, value) {
                    mapping.insert(result, value);
                }
            }

            match block.terminator {
                Some(TraceTerminator::Jump { target }) => {
                    let args = edge_args(&params[&target.index()], &mapping)?;
                    builder.jump(blocks[&target.index()], args);
                }
                Some(TraceTerminator::Branch {
                    cond,
                    truthy,
                    falsy,
                }) => {
                    let cond = lookup(&mapping, cond)?;
                    let truthy_args = edge_args(&params[&truthy.index()], &mapping)?;
                    let falsy_args = edge_args(&params[&falsy.index()], &mapping)?;
                    builder.branch(
                        cond,
                        blocks[&truthy.index()],
                        truthy_args,
                        blocks[&falsy.index()],
                        falsy_args,
                    );
                }
                Some(TraceTerminator::Return { value }) => {
                    let value = value.map(|value| lookup(&mapping, value)).transpose()?;
                    builder.ret(value);
                }
                // Left unterminated, the builder marks it unreachable
                None => {}
            }
        }

        let mut function = builder.build();
        function.optimize();
        Ok(function)
    }

    /// Indices of every block reachable from the entry, in index order
    fn reachable(&self) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            if !seen.insert(index) {
                continue;
            }
            if let Some(terminator) = &self.blocks[index].terminator {
                stack.extend(terminator.successors().into_iter().map(|target| target.index()));
            }
        }
        seen.into_iter().collect()
    }

    /// The refs live on entry to every block
    fn live_in(&self) -> Vec<BTreeSet<TraceRef>> {
        let count = self.blocks.len();
        let mut uses = vec![BTreeSet::new(); count];
        let mut defs = vec![BTreeSet::new(); count];

        for (index, block) in self.blocks.iter().enumerate() {
            let (uses, defs) = (&mut uses[index], &mut defs[index]);
            for op in &block.ops {
                for input in op.kind.inputs() {
                    if !defs.contains(&input) {
                        uses.insert(input);
                    }
                }
                if let Some(result) = op.result {
                    defs.insert(result);
                }
            }
            if let Some(input) = block.terminator.as_ref().and_then(|t| t.inputs()) {
                if !defs.contains(&input) {
                    uses.insert(input);
                }
            }
        }

        let mut live_in = uses.clone();
        let mut changed = true;
        while changed {
            changed = false;
            for index in (0..count).rev() {
                let Some(terminator) = &self.blocks[index].terminator else {
                    continue;
                };

                let mut live: BTreeSet<TraceRef> = uses[index].clone();
                for target in terminator.successors() {
                    live.extend(
                        live_in[target.index()]
                            .iter()
                            .filter(|value| !defs[index].contains(value))
                            .copied(),
                    );
                }

                if live != live_in[index] {
                    live_in[index] = live;
                    changed = true;
                }
            }
        }

        live_in
    }
}

fn edge_args(
    params: &[TraceRef],
    mapping: &BTreeMap<TraceRef, ValueId>,
) -> TraceResult<Vec<ValueId>> {
    params
        .iter()
        .map(|value| {
            mapping
                .get(value)
                .copied()
                .ok_or_else(|| TraceError::UndefinedValue {
                    value: value.to_string(),
                })
        })
        .collect()
}
