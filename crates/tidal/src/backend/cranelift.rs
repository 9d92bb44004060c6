//! Native code generation through Cranelift.
//!
//! Every IR function becomes one `extern "C" fn(*const u64) -> u64` inside a
//! JIT module of its own, so that dropping the [`JitFunction`] releases the
//! code. Canonical `u64` values are narrowed to their native Cranelift types
//! on entry and widened back on return and around proxy calls.

use crate::{
    backend::{CompileError, Executable, ProxyRegistry},
    ir::{
        BinaryOp, BlockId, CompareOp, Function, InstKind, Terminator, UnaryOp, ValueId,
    },
    types::Type,
};
use cranelift_codegen::{
    ir::{
        condcodes::{FloatCC, IntCC},
        immediates::{Ieee32, Ieee64},
        types, AbiParam, Block as ClifBlock, BlockArg, InstBuilder, MemFlags,
        Type as ClifType, UserFuncName, Value,
    },
    isa::TargetIsa,
    settings::{self, Configurable},
    Context,
};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::Module;
use std::{collections::HashMap, mem::ManuallyDrop, sync::Arc};
use tidal_types::config::{BackendKind, CompilerConfig};

type EntryFn = unsafe extern "C" fn(*const u64) -> u64;

/// A function compiled to machine code
pub struct JitFunction {
    name: String,
    entry: EntryFn,
    num_args: usize,
    module: ManuallyDrop<JITModule>,
}

// Safety: the module only owns finalized, immutable machine code and is never
// touched again until it is dropped
unsafe impl Send for JitFunction {}
unsafe impl Sync for JitFunction {}

impl JitFunction {
    pub fn compile(
        function: &Function,
        config: &CompilerConfig,
        registry: &ProxyRegistry,
    ) -> Result<Self, CompileError> {
        let isa = target_isa(config)?;
        let mut module = JITModule::new(JITBuilder::with_isa(
            isa,
            cranelift_module::default_libcall_names(),
        ));

        match Codegen::new(&mut module, registry).codegen_func(function) {
            Ok(entry) => Ok(Self {
                name: function.name().to_owned(),
                entry,
                num_args: function.args().len(),
                module: ManuallyDrop::new(module),
            }),
            Err(error) => {
                // Safety: nothing was handed out from the module
                unsafe { module.free_memory() };
                Err(error)
            }
        }
    }
}

impl Drop for JitFunction {
    fn drop(&mut self) {
        // Safety: `entry` is dropped together with the module
        unsafe { ManuallyDrop::take(&mut self.module).free_memory() };
    }
}

impl Executable for JitFunction {
    fn backend(&self) -> BackendKind {
        BackendKind::Cranelift
    }

    fn name(&self) -> &str {
        &self.name
    }

    unsafe fn invoke(&self, args: &[u64]) -> u64 {
        debug_assert_eq!(args.len(), self.num_args);
        (self.entry)(args.as_ptr())
    }
}

fn target_isa(config: &CompilerConfig) -> Result<Arc<dyn TargetIsa>, CompileError> {
    let mut settings = settings::builder();

    let verifier = if config.debug_assertions { "true" } else { "false" };
    let options = [
        ("opt_level", "speed"),
        ("enable_verifier", verifier),
        ("is_pic", "false"),
    ];
    for (name, value) in options {
        settings
            .set(name, value)
            .map_err(|error| CompileError::Cranelift(format!("{name}={value}: {error}")))?;
    }

    cranelift_native::builder()
        .map_err(|error| CompileError::Cranelift(format!("host isa: {error}")))?
        .finish(settings::Flags::new(settings))
        .map_err(|error| CompileError::Cranelift(error.to_string()))
}

/// The Cranelift type a value of `ty` lives in
fn clif_type(ty: Type) -> ClifType {
    match ty {
        Type::Bool | Type::I8 | Type::U8 => types::I8,
        Type::I16 | Type::U16 => types::I16,
        Type::I32 | Type::U32 => types::I32,
        Type::I64 | Type::U64 | Type::Ptr => types::I64,
        Type::F32 => types::F32,
        Type::F64 => types::F64,
    }
}

struct Codegen<'a> {
    module: &'a mut JITModule,
    registry: &'a ProxyRegistry,
    module_ctx: Context,
    function_ctx: FunctionBuilderContext,
}

impl<'a> Codegen<'a> {
    fn new(module: &'a mut JITModule, registry: &'a ProxyRegistry) -> Self {
        let module_ctx = module.make_context();
        Self {
            module,
            registry,
            module_ctx,
            function_ctx: FunctionBuilderContext::new(),
        }
    }

    fn codegen_func(mut self, function: &Function) -> Result<EntryFn, CompileError> {
        let mut sig = self.module.make_signature();
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(types::I64));

        let func_id = self
            .module
            .declare_anonymous_function(&sig)
            .map_err(|error| CompileError::Cranelift(error.to_string()))?;
        self.module_ctx.func.signature = sig;
        self.module_ctx.func.name = UserFuncName::user(0, func_id.as_u32());

        {
            let mut builder =
                FunctionBuilder::new(&mut self.module_ctx.func, &mut self.function_ctx);
            let mut ctx = CodegenCtx {
                function,
                registry: self.registry,
                module: &mut *self.module,
                values: HashMap::new(),
                blocks: HashMap::new(),
            };
            ctx.lower(&mut builder)?;
            builder.seal_all_blocks();
            builder.finalize();
        }

        self.module
            .define_function(func_id, &mut self.module_ctx)
            .map_err(|error| CompileError::Cranelift(format!("{error:?}")))?;
        self.module.clear_context(&mut self.module_ctx);
        self.module
            .finalize_definitions()
            .map_err(|error| CompileError::Cranelift(error.to_string()))?;

        let code = self.module.get_finalized_function(func_id);
        // Safety: the function was declared with exactly this signature
        Ok(unsafe { std::mem::transmute::<*const u8, EntryFn>(code) })
    }
}

struct CodegenCtx<'a> {
    function: &'a Function,
    registry: &'a ProxyRegistry,
    module: &'a mut JITModule,
    values: HashMap<ValueId, Value>,
    blocks: HashMap<BlockId, ClifBlock>,
}

impl CodegenCtx<'_> {
    fn value(&self, value: ValueId) -> Result<Value, CompileError> {
        self.values
            .get(&value)
            .copied()
            .ok_or_else(|| CompileError::Codegen(format!("{value} used before its definition")))
    }

    fn ty(&self, value: ValueId) -> Type {
        self.function.value_type(value).unwrap_or(Type::U64)
    }

    fn block_args(&self, args: &[ValueId]) -> Result<Vec<BlockArg>, CompileError> {
        args.iter()
            .map(|&arg| self.value(arg).map(BlockArg::Value))
            .collect()
    }

    fn lower(&mut self, builder: &mut FunctionBuilder<'_>) -> Result<(), CompileError> {
        let order = self.function.reverse_post_order();
        for &block_id in &order {
            let block = builder.create_block();
            for &(param, ty) in &self.function.block(block_id).params {
                let value = builder.append_block_param(block, clif_type(ty));
                self.values.insert(param, value);
            }
            self.blocks.insert(block_id, block);
        }

        // The native entry unpacks the argument array and jumps to the IR entry
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let args_ptr = builder.block_params(entry)[0];

        let mut args = Vec::with_capacity(self.function.args().len());
        for (index, &(_, ty)) in self.function.args().iter().enumerate() {
            let raw = builder
                .ins()
                .load(types::I64, MemFlags::new(), args_ptr, index as i32 * 8);
            args.push(BlockArg::Value(from_u64(builder, ty, raw)));
        }
        builder.ins().jump(self.blocks[&self.function.entry_block()], &args);

        for &block_id in &order {
            builder.switch_to_block(self.blocks[&block_id]);
            self.lower_block(builder, block_id)?;
        }
        Ok(())
    }

    fn lower_block(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        block_id: BlockId,
    ) -> Result<(), CompileError> {
        let block = self.function.block(block_id);

        for inst in &block.body {
            let value = match &inst.kind {
                &InstKind::Const { ty, bits } => constant(builder, ty, bits),

                &InstKind::Binary { op, lhs, rhs } => {
                    let ty = self.ty(lhs);
                    let (lhs, rhs) = (self.value(lhs)?, self.value(rhs)?);
                    binary(builder, op, ty, lhs, rhs)
                }

                &InstKind::Compare { op, lhs, rhs } => {
                    let ty = self.ty(lhs);
                    let (lhs, rhs) = (self.value(lhs)?, self.value(rhs)?);
                    compare(builder, op, ty, lhs, rhs)
                }

                &InstKind::Unary { op, value } => {
                    let ty = self.ty(value);
                    let value = self.value(value)?;
                    match op {
                        UnaryOp::Not if ty.is_bool() => builder.ins().bxor_imm(value, 1),
                        UnaryOp::Not => builder.ins().bnot(value),
                        UnaryOp::Neg if ty.is_float() => builder.ins().fneg(value),
                        UnaryOp::Neg => builder.ins().ineg(value),
                    }
                }

                &InstKind::Cast { value, to } => {
                    let from = self.ty(value);
                    let value = self.value(value)?;
                    cast(builder, from, to, value)
                }

                &InstKind::Load { ptr, ty } => {
                    let ptr = self.value(ptr)?;
                    let value = builder.ins().load(clif_type(ty), MemFlags::new(), ptr, 0);
                    if ty.is_bool() {
                        builder.ins().band_imm(value, 1)
                    } else {
                        value
                    }
                }

                &InstKind::Store { ptr, value } => {
                    let (ptr, value) = (self.value(ptr)?, self.value(value)?);
                    builder.ins().store(MemFlags::new(), value, ptr, 0);
                    continue;
                }

                &InstKind::PtrAdd { ptr, offset } => {
                    let (ptr, offset) = (self.value(ptr)?, self.value(offset)?);
                    builder.ins().iadd(ptr, offset)
                }

                InstKind::Call { proxy, args, ret } => {
                    let def = self
                        .registry
                        .get(*proxy)
                        .ok_or(CompileError::UnknownProxy(*proxy))?;
                    if def.ptr.arity() != args.len() {
                        return Err(CompileError::Codegen(format!(
                            "{} takes {} arguments but was called with {}",
                            def.name,
                            def.ptr.arity(),
                            args.len(),
                        )));
                    }

                    let mut sig = self.module.make_signature();
                    sig.params
                        .extend(args.iter().map(|_| AbiParam::new(types::I64)));
                    sig.returns.push(AbiParam::new(types::I64));
                    let sig_ref = builder.import_signature(sig);

                    let mut call_args = Vec::with_capacity(args.len());
                    for &arg in args {
                        let ty = self.ty(arg);
                        call_args.push(to_u64(builder, ty, self.value(arg)?));
                    }
                    let callee = builder.ins().iconst(types::I64, def.ptr.address() as i64);
                    let call = builder.ins().call_indirect(sig_ref, callee, &call_args);
                    let result = builder.inst_results(call)[0];

                    match ret {
                        Some(ty) => from_u64(builder, *ty, result),
                        None => continue,
                    }
                }
            };

            if let Some(dest) = inst.dest {
                self.values.insert(dest, value);
            }
        }

        match &block.terminator {
            Terminator::Jump(jump) => {
                let args = self.block_args(&jump.args)?;
                builder.ins().jump(self.blocks[&jump.target], &args);
            }
            Terminator::Branch(branch) => {
                let cond = self.value(branch.cond)?;
                let truthy_args = self.block_args(&branch.truthy_args)?;
                let falsy_args = self.block_args(&branch.falsy_args)?;
                builder.ins().brif(
                    cond,
                    self.blocks[&branch.truthy],
                    &truthy_args,
                    self.blocks[&branch.falsy],
                    &falsy_args,
                );
            }
            Terminator::Return(ret) => {
                let value = match ret.value {
                    Some(value) => {
                        let ty = self.ty(value);
                        to_u64(builder, ty, self.value(value)?)
                    }
                    None => builder.ins().iconst(types::I64, 0),
                };
                builder.ins().return_(&[value]);
            }
            Terminator::Unreachable => {
                return Err(CompileError::Unsupported(format!(
                    "reachable `unreachable` in {block_id}"
                )));
            }
        }

        Ok(())
    }
}

/// An integer constant of the given IR type, masked to its width
fn iconst(builder: &mut FunctionBuilder<'_>, ty: Type, bits: u64) -> Value {
    builder.ins().iconst(clif_type(ty), (bits & ty.mask()) as i64)
}

fn constant(builder: &mut FunctionBuilder<'_>, ty: Type, bits: u64) -> Value {
    match ty {
        Type::F32 => builder.ins().f32const(Ieee32::with_bits(bits as u32)),
        Type::F64 => builder.ins().f64const(Ieee64::with_bits(bits)),
        _ => iconst(builder, ty, bits),
    }
}

fn binary(
    builder: &mut FunctionBuilder<'_>,
    op: BinaryOp,
    ty: Type,
    lhs: Value,
    rhs: Value,
) -> Value {
    if ty.is_float() {
        return match op {
            BinaryOp::Add => builder.ins().fadd(lhs, rhs),
            BinaryOp::Sub => builder.ins().fsub(lhs, rhs),
            BinaryOp::Mul => builder.ins().fmul(lhs, rhs),
            BinaryOp::Div => builder.ins().fdiv(lhs, rhs),
            BinaryOp::Rem | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                unreachable!("{op} on {ty} passed validation")
            }
        };
    }

    match op {
        BinaryOp::Add => builder.ins().iadd(lhs, rhs),
        BinaryOp::Sub => builder.ins().isub(lhs, rhs),
        BinaryOp::Mul => builder.ins().imul(lhs, rhs),
        BinaryOp::And => builder.ins().band(lhs, rhs),
        BinaryOp::Or => builder.ins().bor(lhs, rhs),
        BinaryOp::Xor => builder.ins().bxor(lhs, rhs),
        BinaryOp::Div | BinaryOp::Rem => divide(builder, op, ty, lhs, rhs),
    }
}

/// Integer division that never traps: a zero divisor yields zero and signed
/// division by `-1` is a wrapping negation
fn divide(
    builder: &mut FunctionBuilder<'_>,
    op: BinaryOp,
    ty: Type,
    lhs: Value,
    rhs: Value,
) -> Value {
    let zero = iconst(builder, ty, 0);
    let one = iconst(builder, ty, 1);
    let is_zero = builder.ins().icmp(IntCC::Equal, rhs, zero);

    if !ty.is_signed_int() {
        let divisor = builder.ins().select(is_zero, one, rhs);
        let result = if op == BinaryOp::Div {
            builder.ins().udiv(lhs, divisor)
        } else {
            builder.ins().urem(lhs, divisor)
        };
        return builder.ins().select(is_zero, zero, result);
    }

    let neg_one = iconst(builder, ty, u64::MAX);
    let is_neg_one = builder.ins().icmp(IntCC::Equal, rhs, neg_one);
    let special = builder.ins().bor(is_zero, is_neg_one);
    let divisor = builder.ins().select(special, one, rhs);

    if op == BinaryOp::Div {
        let quotient = builder.ins().sdiv(lhs, divisor);
        let negated = builder.ins().ineg(lhs);
        let quotient = builder.ins().select(is_neg_one, negated, quotient);
        builder.ins().select(is_zero, zero, quotient)
    } else {
        let remainder = builder.ins().srem(lhs, divisor);
        builder.ins().select(special, zero, remainder)
    }
}

fn compare(
    builder: &mut FunctionBuilder<'_>,
    op: CompareOp,
    ty: Type,
    lhs: Value,
    rhs: Value,
) -> Value {
    if ty.is_float() {
        let cond = match op {
            CompareOp::Eq => FloatCC::Equal,
            CompareOp::Ne => FloatCC::NotEqual,
            CompareOp::Lt => FloatCC::LessThan,
            CompareOp::Le => FloatCC::LessThanOrEqual,
            CompareOp::Gt => FloatCC::GreaterThan,
            CompareOp::Ge => FloatCC::GreaterThanOrEqual,
        };
        return builder.ins().fcmp(cond, lhs, rhs);
    }

    let signed = ty.is_signed_int();
    let cond = match op {
        CompareOp::Eq => IntCC::Equal,
        CompareOp::Ne => IntCC::NotEqual,
        CompareOp::Lt if signed => IntCC::SignedLessThan,
        CompareOp::Le if signed => IntCC::SignedLessThanOrEqual,
        CompareOp::Gt if signed => IntCC::SignedGreaterThan,
        CompareOp::Ge if signed => IntCC::SignedGreaterThanOrEqual,
        CompareOp::Lt => IntCC::UnsignedLessThan,
        CompareOp::Le => IntCC::UnsignedLessThanOrEqual,
        CompareOp::Gt => IntCC::UnsignedGreaterThan,
        CompareOp::Ge => IntCC::UnsignedGreaterThanOrEqual,
    };
    builder.ins().icmp(cond, lhs, rhs)
}

fn cast(builder: &mut FunctionBuilder<'_>, from: Type, to: Type, value: Value) -> Value {
    let (from_clif, to_clif) = (clif_type(from), clif_type(to));
    if from == to {
        return value;
    }

    if to.is_bool() {
        return if from.is_float() {
            let zero = constant(builder, from, 0);
            builder.ins().fcmp(FloatCC::NotEqual, value, zero)
        } else {
            builder.ins().icmp_imm(IntCC::NotEqual, value, 0)
        };
    }

    match (from.is_float(), to.is_float()) {
        (true, true) if from_clif == to_clif => value,
        (true, true) if to == Type::F64 => builder.ins().fpromote(types::F64, value),
        (true, true) => builder.ins().fdemote(types::F32, value),

        (true, false) => {
            // Saturate into 64 bits, clamp to the target range, then narrow
            let wide = if to.is_signed_int() {
                builder.ins().fcvt_to_sint_sat(types::I64, value)
            } else {
                builder.ins().fcvt_to_uint_sat(types::I64, value)
            };
            if to.size() == 8 {
                return wide;
            }

            let clamped = if to.is_signed_int() {
                let min = builder.ins().iconst(types::I64, -(1i64 << (to.bits() - 1)));
                let max = builder.ins().iconst(types::I64, (1i64 << (to.bits() - 1)) - 1);
                let wide = builder.ins().smax(wide, min);
                builder.ins().smin(wide, max)
            } else {
                let max = builder.ins().iconst(types::I64, to.mask() as i64);
                builder.ins().umin(wide, max)
            };
            builder.ins().ireduce(to_clif, clamped)
        }

        (false, true) => {
            let wide = widen(builder, from, value);
            if from.is_signed_int() {
                builder.ins().fcvt_from_sint(to_clif, wide)
            } else {
                builder.ins().fcvt_from_uint(to_clif, wide)
            }
        }

        (false, false) => {
            if to.size() > from.size() {
                if from.is_signed_int() {
                    builder.ins().sextend(to_clif, value)
                } else {
                    builder.ins().uextend(to_clif, value)
                }
            } else if to.size() < from.size() {
                builder.ins().ireduce(to_clif, value)
            } else {
                value
            }
        }
    }
}

/// Extends an integer or boolean to 64 bits according to its signedness
fn widen(builder: &mut FunctionBuilder<'_>, ty: Type, value: Value) -> Value {
    match ty.size() {
        8 => value,
        _ if ty.is_signed_int() => builder.ins().sextend(types::I64, value),
        _ => builder.ins().uextend(types::I64, value),
    }
}

/// Converts a native value into its canonical `u64` form
fn to_u64(builder: &mut FunctionBuilder<'_>, ty: Type, value: Value) -> Value {
    match ty {
        Type::F64 => builder.ins().bitcast(types::I64, MemFlags::new(), value),
        Type::F32 => {
            let bits = builder.ins().bitcast(types::I32, MemFlags::new(), value);
            builder.ins().uextend(types::I64, bits)
        }
        _ if ty.size() == 8 => value,
        _ => builder.ins().uextend(types::I64, value),
    }
}

/// Converts a canonical `u64` into the native value of type `ty`
fn from_u64(builder: &mut FunctionBuilder<'_>, ty: Type, value: Value) -> Value {
    match ty {
        Type::F64 => builder.ins().bitcast(types::F64, MemFlags::new(), value),
        Type::F32 => {
            let bits = builder.ins().ireduce(types::I32, value);
            builder.ins().bitcast(types::F32, MemFlags::new(), bits)
        }
        Type::Bool => {
            let byte = builder.ins().ireduce(types::I8, value);
            builder.ins().band_imm(byte, 1)
        }
        _ if ty.size() == 8 => value,
        _ => builder.ins().ireduce(clif_type(ty), value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{test_proxies, ProxyPtr},
        ir::FunctionBuilder as IrBuilder,
        types::Value as Scalar,
    };

    fn compile(function: &Function, registry: &ProxyRegistry) -> JitFunction {
        let config = CompilerConfig {
            debug_assertions: true,
            ..CompilerConfig::default()
        };
        JitFunction::compile(function, &config, registry).unwrap()
    }

    #[test]
    fn narrow_arguments_and_returns() {
        let mut builder = IrBuilder::new("narrow", Some(Type::I8));
        let a = builder.add_arg(Type::I8);
        let b = builder.add_arg(Type::I8);
        let sum = builder.binary(BinaryOp::Add, a, b);
        builder.ret(Some(sum));

        let function = compile(&builder.build(), &ProxyRegistry::new());
        let args = [Scalar::I8(100).to_bits(), Scalar::I8(100).to_bits()];
        assert_eq!(
            unsafe { function.invoke(&args) },
            Scalar::I8(100i8.wrapping_add(100)).to_bits()
        );
    }

    #[test]
    fn float_roundtrip_through_proxies() {
        let mut registry = ProxyRegistry::new();
        let double = registry.register(
            "double",
            ProxyPtr::A1(test_proxies::double),
            Some(Type::U64),
        );

        let mut builder = IrBuilder::new("floats", Some(Type::F32));
        let x = builder.add_arg(Type::F32);
        let wide = builder.cast(x, Type::F64);
        let half = builder.constant(Scalar::F64(0.5));
        let product = builder.binary(BinaryOp::Mul, wide, half);
        let narrowed = builder.cast(product, Type::F32);
        let as_int = builder.cast(narrowed, Type::U64);
        let doubled = builder.call(double, &[as_int], Some(Type::U64)).unwrap();
        let result = builder.cast(doubled, Type::F32);
        builder.ret(Some(result));

        let function = compile(&builder.build(), &registry);
        let result = unsafe { function.invoke(&[Scalar::F32(9.0).to_bits()]) };
        assert_eq!(f32::from_bits(result as u32), 8.0);
    }
}
