use crate::{
    ir::{BlockId, Inst, Terminator, ValueId},
    types::Type,
};
use petgraph::{
    algo::dominators::{self, Dominators},
    prelude::DiGraphMap,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Block {
    pub id: BlockId,
    /// Values passed in by every predecessor's terminator
    pub params: Vec<(ValueId, Type)>,
    pub body: Vec<Inst>,
    pub terminator: Terminator,
    /// Set by loop detection on blocks targeted by a back edge
    pub loop_header: bool,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            params: Vec::new(),
            body: Vec::new(),
            terminator: Terminator::Unreachable,
            loop_header: false,
        }
    }
}

/// A function in SSA form with block parameters.
///
/// The entry block's parameters are the function's arguments. Every
/// argument and the return value is 64 bits wide at the ABI level.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Function {
    pub(crate) name: String,
    pub(crate) ret: Option<Type>,
    pub(crate) entry: BlockId,
    pub(crate) blocks: BTreeMap<BlockId, Block>,
    pub(crate) types: BTreeMap<ValueId, Type>,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn return_type(&self) -> Option<Type> {
        self.ret
    }

    pub const fn entry_block(&self) -> BlockId {
        self.entry
    }

    pub fn args(&self) -> &[(ValueId, Type)] {
        &self.blocks[&self.entry].params
    }

    pub fn blocks(&self) -> &BTreeMap<BlockId, Block> {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BTreeMap<BlockId, Block> {
        &mut self.blocks
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[&id]
    }

    /// The type of a value, if it is defined anywhere in the function
    pub fn value_type(&self, value: ValueId) -> Option<Type> {
        self.types.get(&value).copied()
    }

    /// One past the largest value id in use, for dense slot tables
    pub fn value_count(&self) -> usize {
        self.types
            .keys()
            .next_back()
            .map_or(0, |value| value.index() + 1)
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|block| block.body.len()).sum()
    }

    /// The control flow graph over all blocks
    pub fn cfg(&self) -> DiGraphMap<BlockId, ()> {
        let mut cfg = DiGraphMap::with_capacity(self.blocks.len(), self.blocks.len() * 2);
        for (&id, block) in &self.blocks {
            cfg.add_node(id);
            for target in block.terminator.successors() {
                cfg.add_edge(id, target, ());
            }
        }
        cfg
    }

    pub fn dominators(&self) -> Dominators<BlockId> {
        dominators::simple_fast(&self.cfg(), self.entry)
    }

    /// Predecessors of every block, without duplicates
    pub fn predecessors(&self) -> BTreeMap<BlockId, BTreeSet<BlockId>> {
        let mut preds: BTreeMap<_, BTreeSet<_>> =
            self.blocks.keys().map(|&id| (id, BTreeSet::new())).collect();
        for (&id, block) in &self.blocks {
            for target in block.terminator.successors() {
                preds.entry(target).or_default().insert(id);
            }
        }
        preds
    }

    /// Blocks in reverse post order starting from the entry. Unreachable
    /// blocks are not included.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![(self.entry, false)];

        while let Some((block, expanded)) = stack.pop() {
            if expanded {
                order.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }

            stack.push((block, true));
            if let Some(data) = self.blocks.get(&block) {
                // Push in reverse so the first successor is visited first
                for target in data.terminator.successors().into_iter().rev() {
                    if !visited.contains(&target) {
                        stack.push((target, false));
                    }
                }
            }
        }

        order.reverse();
        order
    }

    pub fn loop_headers(&self) -> Vec<BlockId> {
        self.blocks
            .values()
            .filter(|block| block.loop_header)
            .map(|block| block.id)
            .collect()
    }

    /// Rebuilds the type table from block parameters and instruction results
    pub(crate) fn recompute_types(&mut self) {
        let mut types = BTreeMap::new();
        for block in self.blocks.values() {
            for &(param, ty) in &block.params {
                types.insert(param, ty);
            }
            for inst in &block.body {
                if let Some(dest) = inst.dest {
                    if let Some(&ty) = self.types.get(&dest) {
                        types.insert(dest, ty);
                    }
                }
            }
        }
        self.types = types;
    }
}
