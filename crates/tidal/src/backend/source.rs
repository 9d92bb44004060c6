//! C source generation.
//!
//! Lowers an IR function into a C translation unit, builds it into a shared
//! library with the system compiler and loads it with `dlopen`. Slower to
//! compile than the JIT but the generated source can be inspected and
//! profiled with ordinary tools.

use crate::{
    backend::{CompileError, Executable, ProxyRegistry},
    ir::{BinaryOp, CompareOp, Function, InstKind, Terminator, UnaryOp, ValueId},
    types::Type,
};
use itertools::Itertools;
use std::{
    ffi::{CStr, CString},
    fmt::Write as _,
    fs,
    os::unix::ffi::OsStrExt,
    process::Command,
};
use tempfile::TempDir;
use tidal_types::config::{BackendKind, CompilerConfig};
use tracing::{debug, trace};

const ENTRY_SYMBOL: &str = "tidal_stage";

const PRELUDE: &str = r#"#include <stdint.h>
#include <string.h>

static inline int64_t tidal_sdiv(int64_t a, int64_t b) {
    if (b == 0) return 0;
    if (b == -1) return (int64_t)(0 - (uint64_t)a);
    return a / b;
}

static inline int64_t tidal_srem(int64_t a, int64_t b) {
    if (b == 0 || b == -1) return 0;
    return a % b;
}

static inline uint64_t tidal_udiv(uint64_t a, uint64_t b) { return b == 0 ? 0 : a / b; }
static inline uint64_t tidal_urem(uint64_t a, uint64_t b) { return b == 0 ? 0 : a % b; }

static inline int64_t tidal_f2i(double x, int64_t min, int64_t max) {
    if (x != x) return 0;
    if (x <= (double)min) return min;
    if (x >= (double)max) return max;
    return (int64_t)x;
}

static inline uint64_t tidal_f2u(double x, uint64_t max) {
    if (!(x > 0.0)) return 0;
    if (x >= (double)max) return max;
    return (uint64_t)x;
}

static inline uint64_t tidal_f64_bits(double x) { uint64_t b; memcpy(&b, &x, 8); return b; }
static inline uint64_t tidal_f32_bits(float x) { uint32_t b; memcpy(&b, &x, 4); return b; }
static inline double tidal_bits_f64(uint64_t b) { double x; memcpy(&x, &b, 8); return x; }
static inline float tidal_bits_f32(uint32_t b) { float x; memcpy(&x, &b, 4); return x; }
"#;

fn c_type(ty: Type) -> &'static str {
    match ty {
        Type::Bool | Type::U8 => "uint8_t",
        Type::I8 => "int8_t",
        Type::I16 => "int16_t",
        Type::U16 => "uint16_t",
        Type::I32 => "int32_t",
        Type::U32 => "uint32_t",
        Type::I64 => "int64_t",
        Type::U64 | Type::Ptr => "uint64_t",
        Type::F32 => "float",
        Type::F64 => "double",
    }
}

/// The unsigned type of the same width, used to zero extend
fn c_unsigned(ty: Type) -> &'static str {
    match ty.size() {
        1 => "uint8_t",
        2 => "uint16_t",
        4 => "uint32_t",
        _ => "uint64_t",
    }
}

fn to_u64(ty: Type, value: &str) -> String {
    match ty {
        Type::F64 => format!("tidal_f64_bits({value})"),
        Type::F32 => format!("tidal_f32_bits({value})"),
        _ => format!("(uint64_t)({})({value})", c_unsigned(ty)),
    }
}

fn from_u64(ty: Type, value: &str) -> String {
    match ty {
        Type::F64 => format!("tidal_bits_f64({value})"),
        Type::F32 => format!("tidal_bits_f32((uint32_t)({value}))"),
        Type::Bool => format!("(uint8_t)(({value}) & 1)"),
        _ => format!("({})({value})", c_type(ty)),
    }
}

/// Generates the C source of `function`, exported as `tidal_stage`.
pub fn generate_c(function: &Function, registry: &ProxyRegistry) -> Result<String, CompileError> {
    let mut out = String::from(PRELUDE);
    let ty = |value: ValueId| function.value_type(value).unwrap_or(Type::U64);

    let _ = writeln!(out, "\nuint64_t {ENTRY_SYMBOL}(const uint64_t *args) {{");
    for (value, ty) in &function.types {
        let _ = writeln!(out, "    {} {value};", c_type(*ty));
    }
    for (index, &(arg, arg_ty)) in function.args().iter().enumerate() {
        let _ = writeln!(
            out,
            "    {arg} = {};",
            from_u64(arg_ty, &format!("args[{index}]"))
        );
    }
    let _ = writeln!(out, "    goto {};", function.entry_block());

    for block_id in function.reverse_post_order() {
        let block = function.block(block_id);
        let _ = writeln!(out, "{block_id}:;");

        for inst in &block.body {
            let line = match &inst.kind {
                &InstKind::Const { ty, bits } => match ty {
                    Type::F64 => format!("tidal_bits_f64({bits:#x}ULL)"),
                    Type::F32 => format!("tidal_bits_f32({bits:#x}U)"),
                    _ => format!("({})({bits:#x}ULL)", c_type(ty)),
                },

                &InstKind::Binary { op, lhs, rhs } => {
                    let operand_ty = ty(lhs);
                    let c = c_type(operand_ty);
                    match op {
                        _ if operand_ty.is_float() => {
                            let symbol = match op {
                                BinaryOp::Add => "+",
                                BinaryOp::Sub => "-",
                                BinaryOp::Mul => "*",
                                BinaryOp::Div => "/",
                                _ => {
                                    return Err(CompileError::Unsupported(format!(
                                        "{op} on {operand_ty}"
                                    )))
                                }
                            };
                            format!("{lhs} {symbol} {rhs}")
                        }
                        BinaryOp::Add => format!("({c})((uint64_t){lhs} + (uint64_t){rhs})"),
                        BinaryOp::Sub => format!("({c})((uint64_t){lhs} - (uint64_t){rhs})"),
                        BinaryOp::Mul => format!("({c})((uint64_t){lhs} * (uint64_t){rhs})"),
                        BinaryOp::And => format!("({c})({lhs} & {rhs})"),
                        BinaryOp::Or => format!("({c})({lhs} | {rhs})"),
                        BinaryOp::Xor => format!("({c})({lhs} ^ {rhs})"),
                        BinaryOp::Div | BinaryOp::Rem => {
                            let helper = match (op, operand_ty.is_signed_int()) {
                                (BinaryOp::Div, true) => "tidal_sdiv((int64_t)",
                                (BinaryOp::Div, false) => "tidal_udiv((uint64_t)",
                                (_, true) => "tidal_srem((int64_t)",
                                (_, false) => "tidal_urem((uint64_t)",
                            };
                            let wide = if operand_ty.is_signed_int() {
                                "int64_t"
                            } else {
                                "uint64_t"
                            };
                            format!("({c}){helper}{lhs}, ({wide}){rhs})")
                        }
                    }
                }

                &InstKind::Compare { op, lhs, rhs } => {
                    let symbol = match op {
                        CompareOp::Eq => "==",
                        CompareOp::Ne => "!=",
                        CompareOp::Lt => "<",
                        CompareOp::Le => "<=",
                        CompareOp::Gt => ">",
                        CompareOp::Ge => ">=",
                    };
                    format!("(uint8_t)({lhs} {symbol} {rhs})")
                }

                &InstKind::Unary { op, value } => {
                    let value_ty = ty(value);
                    let c = c_type(value_ty);
                    match op {
                        UnaryOp::Not if value_ty.is_bool() => format!("(uint8_t)({value} ^ 1)"),
                        UnaryOp::Not => format!("({c})~{value}"),
                        UnaryOp::Neg if value_ty.is_float() => format!("-{value}"),
                        UnaryOp::Neg => format!("({c})(0 - (uint64_t){value})"),
                    }
                }

                &InstKind::Cast { value, to } => cast(ty(value), to, &value.to_string()),

                &InstKind::Load { ptr, ty } => {
                    let _ = writeln!(
                        out,
                        "    memcpy(&{}, (const void *)(uintptr_t){ptr}, {});",
                        inst.dest.map(|dest| dest.to_string()).unwrap_or_default(),
                        ty.size(),
                    );
                    if ty.is_bool() {
                        if let Some(dest) = inst.dest {
                            let _ = writeln!(out, "    {dest} &= 1;");
                        }
                    }
                    continue;
                }

                &InstKind::Store { ptr, value } => {
                    let _ = writeln!(
                        out,
                        "    memcpy((void *)(uintptr_t){ptr}, &{value}, {});",
                        ty(value).size(),
                    );
                    continue;
                }

                &InstKind::PtrAdd { ptr, offset } => {
                    format!("(uint64_t)({ptr} + (uint64_t){offset})")
                }

                InstKind::Call { proxy, args, ret } => {
                    let def = registry
                        .get(*proxy)
                        .ok_or(CompileError::UnknownProxy(*proxy))?;
                    let signature = std::iter::repeat("uint64_t").take(args.len()).join(", ");
                    let signature = if signature.is_empty() {
                        "void".to_owned()
                    } else {
                        signature
                    };
                    let call = format!(
                        "((uint64_t (*)({signature})){:#x}ULL)({})",
                        def.ptr.address(),
                        args.iter()
                            .map(|&arg| to_u64(ty(arg), &arg.to_string()))
                            .join(", "),
                    );
                    match ret {
                        Some(ret) => from_u64(*ret, &call),
                        None => {
                            let _ = writeln!(out, "    {call};");
                            continue;
                        }
                    }
                }
            };

            match inst.dest {
                Some(dest) => {
                    let _ = writeln!(out, "    {dest} = {line};");
                }
                None => {
                    let _ = writeln!(out, "    {line};");
                }
            }
        }

        let edge = |out: &mut String, target, args: &[ValueId]| {
            let params = &function.block(target).params;
            let _ = write!(out, "{{ ");
            for (index, (&arg, &(_, param_ty))) in args.iter().zip(params).enumerate() {
                let _ = write!(out, "{} t{index} = {arg}; ", c_type(param_ty));
            }
            for (index, &(param, _)) in params.iter().enumerate() {
                let _ = write!(out, "{param} = t{index}; ");
            }
            let _ = write!(out, "goto {target}; }}");
        };

        match &block.terminator {
            Terminator::Jump(jump) => {
                out.push_str("    ");
                edge(&mut out, jump.target, &jump.args);
                out.push('\n');
            }
            Terminator::Branch(branch) => {
                let _ = write!(out, "    if ({}) ", branch.cond);
                edge(&mut out, branch.truthy, &branch.truthy_args);
                out.push_str(" else ");
                edge(&mut out, branch.falsy, &branch.falsy_args);
                out.push('\n');
            }
            Terminator::Return(ret) => match ret.value {
                Some(value) => {
                    let _ = writeln!(out, "    return {};", to_u64(ty(value), &value.to_string()));
                }
                None => out.push_str("    return 0;\n"),
            },
            Terminator::Unreachable => {
                return Err(CompileError::Unsupported(format!(
                    "reachable `unreachable` in {block_id}"
                )))
            }
        }
    }

    out.push_str("}\n");
    Ok(out)
}

fn cast(from: Type, to: Type, value: &str) -> String {
    let c = c_type(to);
    if from == to {
        return value.to_owned();
    }
    if to.is_bool() {
        return format!("(uint8_t)({value} != 0)");
    }

    match (from.is_float(), to.is_float()) {
        (true, true) | (false, false) => format!("({c}){value}"),
        (true, false) if to.is_signed_int() => {
            let bits = to.bits();
            let (min, max) = if bits == 64 {
                ("INT64_MIN".to_owned(), "INT64_MAX".to_owned())
            } else {
                (
                    format!("{}LL", -(1i64 << (bits - 1))),
                    format!("{}LL", (1i64 << (bits - 1)) - 1),
                )
            };
            format!("({c})tidal_f2i((double){value}, {min}, {max})")
        }
        (true, false) => format!("({c})tidal_f2u((double){value}, {:#x}ULL)", to.mask()),
        (false, true) if from.is_signed_int() => format!("({c})(int64_t){value}"),
        (false, true) => format!("({c})(uint64_t){value}"),
    }
}

/// A shared library built from generated C source
pub struct NativeLibrary {
    name: String,
    handle: *mut libc::c_void,
    entry: unsafe extern "C" fn(*const u64) -> u64,
    _build_dir: TempDir,
}

// Safety: the library is immutable once loaded and only unloaded on drop
unsafe impl Send for NativeLibrary {}
unsafe impl Sync for NativeLibrary {}

impl NativeLibrary {
    pub fn build(
        function: &Function,
        config: &CompilerConfig,
        registry: &ProxyRegistry,
    ) -> Result<Self, CompileError> {
        let source = generate_c(function, registry)?;
        trace!("generated source for {}:\n{source}", function.name());

        let build_dir = tempfile::Builder::new().prefix("tidal-stage").tempdir()?;
        let source_path = build_dir.path().join("stage.c");
        let library_path = build_dir.path().join("stage.so");
        fs::write(&source_path, source)?;

        let mut command = Command::new(&config.cc);
        command
            .args(["-O2", "-shared", "-fPIC", "-fwrapv", "-o"])
            .arg(&library_path)
            .arg(&source_path);
        debug!("building {} with {command:?}", function.name());

        let output = command.output()?;
        if !output.status.success() {
            return Err(CompileError::SourceBuild {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let path = CString::new(library_path.as_os_str().as_bytes())
            .map_err(|error| CompileError::DynamicLoad(error.to_string()))?;
        let symbol = CString::new(ENTRY_SYMBOL)
            .map_err(|error| CompileError::DynamicLoad(error.to_string()))?;

        // Safety: both strings are nul terminated, the library is our own
        unsafe {
            let handle = libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL);
            if handle.is_null() {
                return Err(CompileError::DynamicLoad(last_dl_error()));
            }

            let entry = libc::dlsym(handle, symbol.as_ptr());
            if entry.is_null() {
                let error = last_dl_error();
                libc::dlclose(handle);
                return Err(CompileError::DynamicLoad(error));
            }

            Ok(Self {
                name: function.name().to_owned(),
                handle,
                entry: std::mem::transmute::<*mut libc::c_void, unsafe extern "C" fn(*const u64) -> u64>(
                    entry,
                ),
                _build_dir: build_dir,
            })
        }
    }
}

unsafe fn last_dl_error() -> String {
    let error = libc::dlerror();
    if error.is_null() {
        "unknown dynamic loader error".to_owned()
    } else {
        CStr::from_ptr(error).to_string_lossy().into_owned()
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        // Safety: the handle came from a successful dlopen and no code from
        // the library can run once the executable is dropped
        unsafe { libc::dlclose(self.handle) };
    }
}

impl Executable for NativeLibrary {
    fn backend(&self) -> BackendKind {
        BackendKind::SourceGen
    }

    fn name(&self) -> &str {
        &self.name
    }

    unsafe fn invoke(&self, args: &[u64]) -> u64 {
        (self.entry)(args.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, ProxyId};

    #[test]
    fn emits_labels_and_parallel_copies() {
        let mut builder = FunctionBuilder::new("swap", Some(Type::I32));
        let a = builder.add_arg(Type::I32);
        let b = builder.add_arg(Type::I32);
        let target = builder.create_block();
        let x = builder.add_block_param(target, Type::I32);
        let y = builder.add_block_param(target, Type::I32);
        builder.jump(target, vec![b, a]);
        builder.move_to(target);
        let diff = builder.binary(BinaryOp::Sub, x, y);
        builder.ret(Some(diff));

        let source = generate_c(&builder.build(), &ProxyRegistry::new()).unwrap();
        assert!(source.contains("uint64_t tidal_stage(const uint64_t *args)"));
        assert!(source.contains(&format!(
            "{{ int32_t t0 = {b}; int32_t t1 = {a}; {x} = t0; {y} = t1; goto {target}; }}"
        )));
        assert!(source.contains(&format!("{diff} = (int32_t)((uint64_t){x} - (uint64_t){y});")));
    }

    #[test]
    fn unknown_proxies_fail() {
        let mut builder = FunctionBuilder::new("call", None);
        builder.call(ProxyId(0), &[], None);
        builder.ret(None);
        assert!(matches!(
            generate_c(&builder.build(), &ProxyRegistry::new()),
            Err(CompileError::UnknownProxy(ProxyId(0)))
        ));
    }

    #[test]
    fn compiler_errors_are_reported() {
        let mut builder = FunctionBuilder::new("id", Some(Type::U64));
        let arg = builder.add_arg(Type::U64);
        builder.ret(Some(arg));

        let config = CompilerConfig {
            backend: BackendKind::SourceGen,
            cc: "/nonexistent/tidal-cc".into(),
            ..CompilerConfig::default()
        };
        assert!(matches!(
            NativeLibrary::build(&builder.build(), &config, &ProxyRegistry::new()),
            Err(CompileError::Io { .. })
        ));
    }
}
