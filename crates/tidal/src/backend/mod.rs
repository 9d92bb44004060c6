//! Lowering of IR functions into something the runtime can call.
//!
//! Every backend produces an [`Executable`] with the same calling convention:
//! an array of `u64` arguments in, a single `u64` out. Compiled pipeline
//! stages are called with `[buffer, pipeline context, worker context]` and
//! return an [`ExecutionResult`](crate::pipeline::ExecutionResult) code.

mod cache;
#[cfg(feature = "cranelift")]
mod cranelift;
mod interpreter;
mod proxy;
#[cfg(unix)]
mod source;

pub use cache::{CacheStats, CompilationCache};
#[cfg(feature = "cranelift")]
pub use cranelift::JitFunction;
pub use interpreter::InterpretedFunction;
pub use proxy::{ProxyDef, ProxyPtr, ProxyRegistry};
#[cfg(unix)]
pub use source::{generate_c, NativeLibrary};

#[cfg(test)]
pub(crate) use proxy::test_proxies;

use crate::{
    ir::{validate, Function, ProxyId, ValidationError},
    trace::TraceError,
};
use serde::Serialize;
use std::{borrow::Cow, sync::Arc, time::Instant};
use thiserror::Error;
use tidal_types::{
    config::{BackendKind, CompilerConfig},
    error::DetailedError,
};
use tracing::{debug, info};

/// A function ready to be called by the runtime.
pub trait Executable: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn name(&self) -> &str;

    /// Calls the function.
    ///
    /// # Safety
    ///
    /// `args` must match the function's parameters and every pointer or
    /// handle among them must be valid for the accesses the function makes.
    unsafe fn invoke(&self, args: &[u64]) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum CompileError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("invalid IR: {0}")]
    Validation(#[from] ValidationError),
    #[error("cranelift error: {0}")]
    Cranelift(String),
    #[error("code generation failed: {0}")]
    Codegen(String),
    #[error("C compiler exited with {status}: {stderr}")]
    SourceBuild { status: String, stderr: String },
    #[error("i/o error: {message}")]
    Io { message: String },
    #[error("failed to load compiled library: {0}")]
    DynamicLoad(String),
    #[error("call to unregistered {0}")]
    UnknownProxy(ProxyId),
    #[error("the {0} backend is not available in this build")]
    BackendUnavailable(BackendKind),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for CompileError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

impl DetailedError for CompileError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Trace(error) => error.error_code(),
            Self::Validation(_) => Cow::from("InvalidIr"),
            Self::Cranelift(_) => Cow::from("CraneliftError"),
            Self::Codegen(_) => Cow::from("CodegenError"),
            Self::SourceBuild { .. } => Cow::from("SourceBuildFailed"),
            Self::Io { .. } => Cow::from("CompilerIoError"),
            Self::DynamicLoad(_) => Cow::from("DynamicLoadFailed"),
            Self::UnknownProxy(_) => Cow::from("UnknownProxy"),
            Self::BackendUnavailable(_) => Cow::from("BackendUnavailable"),
            Self::Unsupported(_) => Cow::from("UnsupportedIr"),
        }
    }
}

/// Validates `function` and lowers it with the configured backend.
///
/// A failing backend is reported as is, there is no fallback to another one.
pub fn compile(
    function: Function,
    config: &CompilerConfig,
    registry: &ProxyRegistry,
) -> Result<Arc<dyn Executable>, CompileError> {
    validate(&function)?;
    if config.dump_ir {
        debug!("compiling {} with {}:\n{function}", function.name(), config.backend);
    }

    let start = Instant::now();
    let name = function.name().to_owned();
    let executable: Arc<dyn Executable> = match config.backend {
        BackendKind::Interpreter => Arc::new(InterpretedFunction::new(function, registry)?),

        #[cfg(feature = "cranelift")]
        BackendKind::Cranelift => Arc::new(JitFunction::compile(&function, config, registry)?),
        #[cfg(not(feature = "cranelift"))]
        BackendKind::Cranelift => return Err(CompileError::BackendUnavailable(config.backend)),

        #[cfg(unix)]
        BackendKind::SourceGen => Arc::new(NativeLibrary::build(&function, config, registry)?),
        #[cfg(not(unix))]
        BackendKind::SourceGen => return Err(CompileError::BackendUnavailable(config.backend)),
    };

    info!(
        "compiled {name} with the {} backend in {:?}",
        config.backend,
        start.elapsed(),
    );
    Ok(executable)
}

/// Every backend that can run on this machine, source generation only if
/// the default C compiler answers.
pub fn available_backends() -> Vec<BackendKind> {
    let mut backends = vec![BackendKind::Interpreter];
    if cfg!(feature = "cranelift") {
        backends.push(BackendKind::Cranelift);
    }
    let has_cc = std::process::Command::new(CompilerConfig::default().cc)
        .arg("--version")
        .output()
        .is_ok();
    if cfg!(unix) && has_cc {
        backends.push(BackendKind::SourceGen);
    }
    backends
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{BinaryOp, CompareOp, FunctionBuilder, UnaryOp},
        types::{Type, Value},
    };
    use proptest::prelude::*;

    fn config(backend: BackendKind) -> CompilerConfig {
        CompilerConfig {
            backend,
            ..CompilerConfig::default()
        }
    }

    /// Exercises signed division edge cases, casts, loops and proxy calls
    fn kitchen_sink() -> (Function, ProxyRegistry) {
        let mut registry = ProxyRegistry::new();
        let double = registry.register(
            "double",
            ProxyPtr::A1(test_proxies::double),
            Some(Type::U64),
        );

        // fn(a: i32, b: i32, n: u64, x: f64) -> i64
        let mut builder = FunctionBuilder::new("kitchen_sink", Some(Type::I64));
        let a = builder.add_arg(Type::I32);
        let b = builder.add_arg(Type::I32);
        let n = builder.add_arg(Type::U64);
        let x = builder.add_arg(Type::F64);

        let quotient = builder.binary(BinaryOp::Div, a, b);
        let remainder = builder.binary(BinaryOp::Rem, a, b);
        let mixed = builder.binary(BinaryOp::Xor, quotient, remainder);
        let mixed = builder.cast(mixed, Type::I64);
        let truncated = builder.cast(x, Type::I16);
        let truncated = builder.cast(truncated, Type::I64);
        let negated = builder.unary(UnaryOp::Neg, truncated);

        let header = builder.create_block();
        let i = builder.add_block_param(header, Type::U64);
        let acc = builder.add_block_param(header, Type::I64);
        let body = builder.create_block();
        let exit = builder.create_block();

        let zero = builder.const_bits(Type::U64, 0);
        builder.jump(header, vec![zero, mixed]);

        builder.move_to(header);
        let more = builder.compare(CompareOp::Lt, i, n);
        builder.branch(more, body, vec![], exit, vec![]);

        builder.move_to(body);
        let doubled = builder.call(double, &[i], Some(Type::U64)).unwrap();
        let doubled = builder.cast(doubled, Type::I64);
        let next_acc = builder.binary(BinaryOp::Add, acc, doubled);
        let one = builder.const_bits(Type::U64, 1);
        let next_i = builder.binary(BinaryOp::Add, i, one);
        builder.jump(header, vec![next_i, next_acc]);

        builder.move_to(exit);
        let result = builder.binary(BinaryOp::Sub, acc, negated);
        builder.ret(Some(result));

        (builder.build(), registry)
    }

    fn run_kitchen_sink(executable: &dyn Executable, a: i32, b: i32, n: u8, x: f64) -> u64 {
        let args = [
            Value::I32(a).to_bits(),
            Value::I32(b).to_bits(),
            n as u64,
            x.to_bits(),
        ];
        unsafe { executable.invoke(&args) }
    }

    #[test]
    fn unavailable_backends_are_errors() {
        if !cfg!(feature = "cranelift") {
            let (function, registry) = kitchen_sink();
            assert!(matches!(
                compile(function, &config(BackendKind::Cranelift), &registry),
                Err(CompileError::BackendUnavailable(BackendKind::Cranelift))
            ));
        }
    }

    #[test]
    fn invalid_ir_is_rejected() {
        let mut builder = FunctionBuilder::new("broken", Some(Type::I32));
        let arg = builder.add_arg(Type::I64);
        builder.ret(Some(arg));
        let result = compile(
            builder.build(),
            &config(BackendKind::Interpreter),
            &ProxyRegistry::new(),
        );
        assert!(matches!(result, Err(CompileError::Validation(_))));
    }

    #[test]
    fn edge_cases_agree() {
        let cases = [
            (i32::MIN, -1, 3u8, f64::NAN),
            (17, 0, 0, 1e10),
            (-17, 5, 10, -40000.5),
            (100, 7, 1, f64::NEG_INFINITY),
        ];

        let (function, registry) = kitchen_sink();
        let reference = compile(function.clone(), &config(BackendKind::Interpreter), &registry)
            .unwrap();
        for backend in available_backends() {
            let executable = compile(function.clone(), &config(backend), &registry).unwrap();
            assert_eq!(executable.backend(), backend);
            for &(a, b, n, x) in &cases {
                assert_eq!(
                    run_kitchen_sink(&*executable, a, b, n, x),
                    run_kitchen_sink(&*reference, a, b, n, x),
                    "{backend} disagrees on ({a}, {b}, {n}, {x})",
                );
            }
        }
    }

    #[test]
    fn known_results() {
        let (function, registry) = kitchen_sink();
        let executable =
            compile(function, &config(BackendKind::Interpreter), &registry).unwrap();
        // MIN / -1 = MIN, MIN % -1 = 0, NaN casts to 0, 2 * (0 + 1 + 2) = 6
        assert_eq!(
            run_kitchen_sink(&*executable, i32::MIN, -1, 3, f64::NAN),
            Value::I64(i32::MIN as i64 + 6).to_bits()
        );
        // 17 / 0 = 0, 17 % 0 = 0, 1e10 saturates to i16::MAX
        assert_eq!(
            run_kitchen_sink(&*executable, 17, 0, 0, 1e10),
            Value::I64(i16::MAX as i64).to_bits()
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn backends_agree(a: i32, b: i32, n in 0u8..16, x: f64) {
            let (function, registry) = kitchen_sink();
            let reference = compile(function.clone(), &config(BackendKind::Interpreter), &registry)
                .unwrap();
            let expected = run_kitchen_sink(&*reference, a, b, n, x);

            if cfg!(feature = "cranelift") {
                let jit = compile(function, &config(BackendKind::Cranelift), &registry).unwrap();
                prop_assert_eq!(run_kitchen_sink(&*jit, a, b, n, x), expected);
            }
        }
    }
}
