use crate::{
    ir::{
        BinaryOp, Block, BlockId, BlockIdGen, Branch, CompareOp, Function, Inst, InstKind, Jump,
        ProxyId, Return, Terminator, UnaryOp, ValueId, ValueIdGen,
    },
    types::{Type, Value},
};
use smallvec::SmallVec;
use std::collections::BTreeMap;

struct UnsealedBlock {
    params: Vec<(ValueId, Type)>,
    body: Vec<Inst>,
    terminator: Option<Terminator>,
}

impl UnsealedBlock {
    const fn new() -> Self {
        Self {
            params: Vec::new(),
            body: Vec::new(),
            terminator: None,
        }
    }
}

/// Incrementally builds a [`Function`], one block at a time.
pub struct FunctionBuilder {
    name: String,
    ret: Option<Type>,
    values: ValueIdGen,
    block_ids: BlockIdGen,
    entry: BlockId,
    current: BlockId,
    blocks: BTreeMap<BlockId, UnsealedBlock>,
    types: BTreeMap<ValueId, Type>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, ret: Option<Type>) -> Self {
        let block_ids = BlockIdGen::new();
        let entry = block_ids.next();
        let mut blocks = BTreeMap::new();
        blocks.insert(entry, UnsealedBlock::new());

        Self {
            name: name.into(),
            ret,
            values: ValueIdGen::new(),
            block_ids,
            entry,
            current: entry,
            blocks,
            types: BTreeMap::new(),
        }
    }

    /// Adds a function argument
    pub fn add_arg(&mut self, ty: Type) -> ValueId {
        self.add_block_param(self.entry, ty)
    }

    pub const fn entry(&self) -> BlockId {
        self.entry
    }

    pub const fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = self.block_ids.next();
        self.blocks.insert(id, UnsealedBlock::new());
        id
    }

    pub fn add_block_param(&mut self, block: BlockId, ty: Type) -> ValueId {
        let value = self.values.next();
        self.types.insert(value, ty);
        self.block_mut(block).params.push((value, ty));
        value
    }

    pub fn block_params(&self, block: BlockId) -> Vec<ValueId> {
        self.blocks[&block]
            .params
            .iter()
            .map(|&(value, _)| value)
            .collect()
    }

    /// Makes `block` the target of subsequently added instructions
    pub fn move_to(&mut self, block: BlockId) {
        assert!(
            self.blocks.contains_key(&block),
            "moved to unknown block {block}"
        );
        self.current = block;
    }

    pub fn is_terminated(&self, block: BlockId) -> bool {
        self.blocks[&block].terminator.is_some()
    }

    pub fn value_type(&self, value: ValueId) -> Type {
        match self.types.get(&value) {
            Some(&ty) => ty,
            None => panic!("value {value} used before being defined"),
        }
    }

    fn block_mut(&mut self, block: BlockId) -> &mut UnsealedBlock {
        match self.blocks.get_mut(&block) {
            Some(block) => block,
            None => panic!("unknown block {block}"),
        }
    }

    /// Appends an instruction to the current block
    pub(crate) fn push_inst(&mut self, kind: InstKind, result: Option<Type>) -> Option<ValueId> {
        let dest = result.map(|ty| {
            let value = self.values.next();
            self.types.insert(value, ty);
            value
        });

        let current = self.current;
        let block = self.block_mut(current);
        debug_assert!(
            block.terminator.is_none(),
            "added an instruction to terminated block {current}",
        );
        block.body.push(Inst::new(dest, kind));
        dest
    }

    fn push_value(&mut self, kind: InstKind, ty: Type) -> ValueId {
        match self.push_inst(kind, Some(ty)) {
            Some(value) => value,
            None => unreachable!(),
        }
    }

    pub fn constant(&mut self, value: Value) -> ValueId {
        self.const_bits(value.ty(), value.to_bits())
    }

    pub fn const_bits(&mut self, ty: Type, bits: u64) -> ValueId {
        self.push_value(
            InstKind::Const {
                ty,
                bits: bits & ty.mask(),
            },
            ty,
        )
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.value_type(lhs);
        self.push_value(InstKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn compare(&mut self, op: CompareOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push_value(InstKind::Compare { op, lhs, rhs }, Type::Bool)
    }

    pub fn unary(&mut self, op: UnaryOp, value: ValueId) -> ValueId {
        let ty = self.value_type(value);
        self.push_value(InstKind::Unary { op, value }, ty)
    }

    pub fn cast(&mut self, value: ValueId, to: Type) -> ValueId {
        self.push_value(InstKind::Cast { value, to }, to)
    }

    pub fn load(&mut self, ptr: ValueId, ty: Type) -> ValueId {
        self.push_value(InstKind::Load { ptr, ty }, ty)
    }

    pub fn store(&mut self, ptr: ValueId, value: ValueId) {
        self.push_inst(InstKind::Store { ptr, value }, None);
    }

    pub fn ptr_add(&mut self, ptr: ValueId, offset: ValueId) -> ValueId {
        self.push_value(InstKind::PtrAdd { ptr, offset }, Type::Ptr)
    }

    pub fn call(&mut self, proxy: ProxyId, args: &[ValueId], ret: Option<Type>) -> Option<ValueId> {
        self.push_inst(
            InstKind::Call {
                proxy,
                args: SmallVec::from_slice(args),
                ret,
            },
            ret,
        )
    }

    fn terminate(&mut self, terminator: Terminator) {
        let current = self.current;
        let block = self.block_mut(current);
        debug_assert!(
            block.terminator.is_none(),
            "terminated block {current} twice"
        );
        block.terminator = Some(terminator);
    }

    pub fn jump(&mut self, target: BlockId, args: Vec<ValueId>) {
        self.terminate(Jump::new(target, args).into());
    }

    pub fn branch(
        &mut self,
        cond: ValueId,
        truthy: BlockId,
        truthy_args: Vec<ValueId>,
        falsy: BlockId,
        falsy_args: Vec<ValueId>,
    ) {
        self.terminate(Branch::new(cond, truthy, truthy_args, falsy, falsy_args).into());
    }

    pub fn ret(&mut self, value: Option<ValueId>) {
        self.terminate(Return::new(value).into());
    }

    /// Finishes the function. Blocks that were never terminated end in
    /// [`Terminator::Unreachable`].
    pub fn build(self) -> Function {
        let blocks = self
            .blocks
            .into_iter()
            .map(|(id, block)| {
                let block = Block {
                    id,
                    params: block.params,
                    body: block.body,
                    terminator: block.terminator.unwrap_or(Terminator::Unreachable),
                    loop_header: false,
                };
                (id, block)
            })
            .collect();

        Function {
            name: self.name,
            ret: self.ret,
            entry: self.entry,
            blocks,
            types: self.types,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_loop() {
        // fn(n) { i = 0; while i < n { i += 1 } return i }
        let mut builder = FunctionBuilder::new("count", Some(Type::U64));
        let n = builder.add_arg(Type::U64);
        let header = builder.create_block();
        let i = builder.add_block_param(header, Type::U64);
        let body = builder.create_block();
        let exit = builder.create_block();

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

        let function = builder.build();
        assert_eq!(function.blocks().len(), 4);
        assert_eq!(function.args().len(), 1);
        assert_eq!(function.value_type(cond), Some(Type::Bool));
        assert_eq!(function.value_type(next), Some(Type::U64));
        assert_eq!(
            function.reverse_post_order(),
            vec![function.entry_block(), header, exit, body]
        );
    }
}
