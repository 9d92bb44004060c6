//! Executes IR directly, without generating code.
//!
//! Used as the reference backend and whenever native code generation is
//! unavailable. Every operation goes through [`crate::ir::eval`].

use crate::{
    backend::{CompileError, Executable, ProxyPtr, ProxyRegistry},
    ir::{eval, BlockId, Function, InstKind, Terminator, ValueId},
    types::Type,
};
use smallvec::SmallVec;
use std::ptr;
use tidal_types::config::BackendKind;

pub struct InterpretedFunction {
    function: Function,
    /// Dense table of value types, indexed by value id
    types: Vec<Type>,
    /// Resolved proxies, indexed by proxy id
    proxies: Vec<Option<ProxyPtr>>,
}

impl InterpretedFunction {
    pub fn new(function: Function, registry: &ProxyRegistry) -> Result<Self, CompileError> {
        let mut types = vec![Type::U64; function.value_count()];
        for (value, ty) in &function.types {
            types[value.index()] = *ty;
        }

        for block in function.blocks.values() {
            for inst in &block.body {
                if let InstKind::Call { proxy, .. } = inst.kind {
                    if registry.get(proxy).is_none() {
                        return Err(CompileError::UnknownProxy(proxy));
                    }
                }
            }
        }
        let proxies = registry.iter().map(|(_, def)| Some(def.ptr)).collect();

        Ok(Self {
            function,
            types,
            proxies,
        })
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    #[inline]
    fn ty(&self, value: ValueId) -> Type {
        self.types[value.index()]
    }

    unsafe fn run(&self, args: &[u64]) -> u64 {
        let function = &self.function;
        let mut slots = vec![0u64; self.types.len()];
        let read = |slots: &[u64], value: ValueId| slots[value.index()];

        for (&(param, ty), &arg) in function.args().iter().zip(args) {
            slots[param.index()] = eval::canonical(ty, arg);
        }

        let mut current: BlockId = function.entry;
        let mut incoming: SmallVec<[u64; 8]> = SmallVec::new();
        loop {
            let block = &function.blocks[&current];

            for inst in &block.body {
                let result = match &inst.kind {
                    &InstKind::Const { bits, .. } => bits,
                    &InstKind::Binary { op, lhs, rhs } => {
                        eval::binary(op, self.ty(lhs), read(&slots, lhs), read(&slots, rhs))
                    }
                    &InstKind::Compare { op, lhs, rhs } => {
                        eval::compare(op, self.ty(lhs), read(&slots, lhs), read(&slots, rhs))
                            as u64
                    }
                    &InstKind::Unary { op, value } => {
                        eval::unary(op, self.ty(value), read(&slots, value))
                    }
                    &InstKind::Cast { value, to } => {
                        eval::cast(self.ty(value), to, read(&slots, value))
                    }
                    &InstKind::Load { ptr, ty } => load(read(&slots, ptr) as *const u8, ty),
                    &InstKind::Store { ptr, value } => {
                        store(
                            read(&slots, ptr) as *mut u8,
                            self.ty(value),
                            read(&slots, value),
                        );
                        continue;
                    }
                    &InstKind::PtrAdd { ptr, offset } => {
                        read(&slots, ptr).wrapping_add(read(&slots, offset))
                    }
                    InstKind::Call { proxy, args, ret } => {
                        let args: SmallVec<[u64; 6]> =
                            args.iter().map(|&arg| read(&slots, arg)).collect();
                        let proxy = match self.proxies.get(proxy.0 as usize) {
                            Some(Some(proxy)) => *proxy,
                            _ => unreachable!("unresolved proxy {proxy}"),
                        };
                        let result = proxy.invoke(&args);
                        match ret {
                            Some(ty) => eval::canonical(*ty, result),
                            None => continue,
                        }
                    }
                };

                if let Some(dest) = inst.dest {
                    slots[dest.index()] = result;
                }
            }

            let (target, args) = match &block.terminator {
                Terminator::Jump(jump) => (jump.target, &jump.args),
                Terminator::Branch(branch) => {
                    if read(&slots, branch.cond) != 0 {
                        (branch.truthy, &branch.truthy_args)
                    } else {
                        (branch.falsy, &branch.falsy_args)
                    }
                }
                Terminator::Return(ret) => {
                    return ret.value.map_or(0, |value| read(&slots, value));
                }
                Terminator::Unreachable => {
                    unreachable!("reached unreachable code in {current}")
                }
            };

            // Arguments are read before any parameter is written
            incoming.clear();
            incoming.extend(args.iter().map(|&arg| read(&slots, arg)));
            for (&(param, _), &value) in function.blocks[&target].params.iter().zip(&incoming) {
                slots[param.index()] = value;
            }
            current = target;
        }
    }
}

unsafe fn load(ptr: *const u8, ty: Type) -> u64 {
    let raw = match ty.size() {
        1 => ptr.read() as u64,
        2 => ptr::read_unaligned(ptr.cast::<u16>()) as u64,
        4 => ptr::read_unaligned(ptr.cast::<u32>()) as u64,
        _ => ptr::read_unaligned(ptr.cast::<u64>()),
    };
    eval::canonical(ty, raw)
}

unsafe fn store(ptr: *mut u8, ty: Type, value: u64) {
    match ty.size() {
        1 => ptr.write(value as u8),
        2 => ptr::write_unaligned(ptr.cast::<u16>(), value as u16),
        4 => ptr::write_unaligned(ptr.cast::<u32>(), value as u32),
        _ => ptr::write_unaligned(ptr.cast::<u64>(), value),
    }
}

impl Executable for InterpretedFunction {
    fn backend(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn name(&self) -> &str {
        self.function.name()
    }

    unsafe fn invoke(&self, args: &[u64]) -> u64 {
        self.run(args)
    }
}
