//! Tracing of operator code into the IR.
//!
//! Operator code is ordinary Rust that manipulates [`Val`]s through a
//! [`TraceContext`]. [`trace_function`] runs it repeatedly, once for every
//! control flow path, and records the operations into an
//! [`ExecutionTrace`]. Reaching an already recorded operation from another
//! block ends the execution and merges the two paths, which is how both the
//! end of a conditional and the back edge of a loop are found. Loops in the
//! traced code therefore end up as loops in the IR instead of being unrolled.
//!
//! [`ExecutionTrace::to_ssa`] then turns the trace into an optimized
//! [`Function`](crate::ir::Function).

mod context;
mod execution_trace;
mod ssa;
mod tag;

pub use context::{trace_function, TraceContext, TraceOptions, Val, Var};
pub use execution_trace::{
    ExecutionTrace, OpKind, TraceBlock, TraceBlockId, TraceOp, TraceRef, TraceTerminator,
};
pub use tag::Tag;

use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;
use tidal_types::error::DetailedError;

pub type TraceResult<T> = Result<T, TraceError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum TraceError {
    /// Two executions taking the same branch decisions performed different
    /// operations. The traced code depends on something other than its
    /// traced values.
    #[error("traced code is not deterministic: execution diverged at {location} in {block}")]
    NonDeterministic { location: String, block: String },
    #[error("{location} was traced twice within one block, push a frame to tell the operations apart")]
    AmbiguousTag { location: String },
    #[error("paths merging at {location} disagree on its inputs, pass the value through a variable")]
    DivergentMerge { location: String },
    #[error("{value} is used on a path where it is never defined")]
    UndefinedValue { value: String },
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },
    #[error("tracing did not finish within {iterations} executions")]
    TraceLimitExceeded { iterations: usize },
    #[error("tag with {depth} frames exceeds the maximum depth")]
    TagTooDeep { depth: usize },
    /// Control flow merged into an existing block. Ends the current
    /// execution and is never returned from [`trace_function`].
    #[error("execution merged into an already traced block")]
    Halted,
}

impl DetailedError for TraceError {
    fn error_code(&self) -> Cow<'static, str> {
        Cow::from(match self {
            Self::NonDeterministic { .. } => "NonDeterministicTrace",
            Self::AmbiguousTag { .. } => "AmbiguousTag",
            Self::DivergentMerge { .. } => "DivergentMerge",
            Self::UndefinedValue { .. } => "UndefinedValue",
            Self::TypeMismatch { .. } => "TraceTypeMismatch",
            Self::TraceLimitExceeded { .. } => "TraceLimitExceeded",
            Self::TagTooDeep { .. } => "TagTooDeep",
            Self::Halted => "TraceHalted",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{validate, UnaryOp},
        types::Type,
    };
    use pretty_assertions::assert_eq;

    fn options() -> TraceOptions {
        TraceOptions::default()
    }

    #[test]
    fn straight_line_code_is_one_block() {
        let trace = trace_function(&[Type::I64], Some(Type::I64), &options(), |ctx| {
            let x = ctx.arg(0);
            let one = ctx.constant(1i64)?;
            let sum = ctx.add(x, one)?;
            Ok(Some(ctx.mul(sum, sum)?))
        })
        .unwrap();
        assert_eq!(trace.blocks().len(), 1);

        let function = trace.to_ssa("square").unwrap();
        validate(&function).unwrap();
        assert_eq!(function.blocks().len(), 1);
        assert_eq!(function.instruction_count(), 3);
    }

    #[test]
    fn conditional_merges_through_variable() {
        // |x| if x < 0 { -x } else { x }
        let trace = trace_function(&[Type::I64], Some(Type::I64), &options(), |ctx| {
            let x = ctx.arg(0);
            let zero = ctx.constant(0i64)?;
            let result = ctx.var(zero)?;
            let negative = ctx.lt(x, zero)?;
            if ctx.branch(negative)? {
                let negated = ctx.unary(UnaryOp::Neg, x)?;
                ctx.set(result, negated)?;
            } else {
                ctx.set(result, x)?;
            }
            Ok(Some(ctx.get(result)?))
        })
        .unwrap();

        // Entry, both sides and the block they merge into
        assert_eq!(trace.blocks().len(), 4);

        let function = trace.to_ssa("abs").unwrap();
        validate(&function).unwrap();
        assert!(function.loop_headers().is_empty());

        let merge = function
            .blocks()
            .values()
            .find(|block| block.terminator.is_return())
            .unwrap();
        assert_eq!(merge.params.len(), 1);
    }

    #[test]
    fn loops_are_not_unrolled() {
        // |n| { let mut i = 0; while i < n { i += 1 } i }
        let trace = trace_function(&[Type::U64], Some(Type::U64), &options(), |ctx| {
            let n = ctx.arg(0);
            let zero = ctx.constant(0u64)?;
            let i = ctx.var(zero)?;
            loop {
                let current = ctx.get(i)?;
                let more = ctx.lt(current, n)?;
                if !ctx.branch(more)? {
                    break;
                }
                let one = ctx.constant(1u64)?;
                let current = ctx.get(i)?;
                let next = ctx.add(current, one)?;
                ctx.set(i, next)?;
            }
            Ok(Some(ctx.get(i)?))
        })
        .unwrap();

        let function = trace.to_ssa("count").unwrap();
        validate(&function).unwrap();
        assert_eq!(function.loop_headers().len(), 1);

        // Only the counter is carried around the loop, `n` is an argument
        let header = function.block(function.loop_headers()[0]);
        assert_eq!(header.params.len(), 1);
    }

    #[test]
    fn frames_tell_repeated_operations_apart() {
        let unframed = trace_function(&[], Some(Type::I64), &options(), |ctx| {
            let mut sum = ctx.constant(0i64)?;
            for _ in 0..3 {
                let one = ctx.constant(1i64)?;
                sum = ctx.add(sum, one)?;
            }
            Ok(Some(sum))
        });
        assert!(matches!(unframed, Err(TraceError::AmbiguousTag { .. })));

        let trace = trace_function(&[], Some(Type::I64), &options(), |ctx| {
            let mut sum = ctx.constant(0i64)?;
            for field in 0..3 {
                sum = ctx.frame(field, |ctx| {
                    let one = ctx.constant(1i64)?;
                    ctx.add(sum, one)
                })?;
            }
            Ok(Some(sum))
        })
        .unwrap();
        assert_eq!(trace.op_count(), 8);
    }

    #[test]
    fn detects_non_determinism() {
        let mut executions = 0i64;
        let result = trace_function(&[Type::Bool], None, &options(), |ctx| {
            executions += 1;
            ctx.constant(executions)?;
            let flag = ctx.arg(0);
            ctx.branch(flag)?;
            Ok(None)
        });
        assert!(matches!(result, Err(TraceError::NonDeterministic { .. })));
    }

    #[test]
    fn values_must_not_escape_their_branch() {
        let result = trace_function(&[Type::Bool], Some(Type::I64), &options(), |ctx| {
            let flag = ctx.arg(0);
            let value = if ctx.branch(flag)? {
                Some(ctx.constant(1i64)?)
            } else {
                None
            };
            let two = ctx.constant(2i64)?;
            Ok(Some(match value {
                Some(value) => ctx.add(value, two)?,
                None => ctx.add(two, two)?,
            }))
        })
        .unwrap()
        .to_ssa("escape");
        assert!(matches!(result, Err(TraceError::UndefinedValue { .. })));
    }

    #[test]
    fn merging_paths_must_agree() {
        let result = trace_function(&[Type::Bool], Some(Type::I64), &options(), |ctx| {
            let flag = ctx.arg(0);
            let value = if ctx.branch(flag)? {
                ctx.constant(1i64)?
            } else {
                ctx.constant(2i64)?
            };
            Ok(Some(ctx.add(value, value)?))
        });
        assert!(matches!(result, Err(TraceError::DivergentMerge { .. })));
    }

    #[test]
    fn bounded_executions() {
        let options = TraceOptions {
            max_iterations: 1,
            ..TraceOptions::default()
        };
        let result = trace_function(&[Type::Bool], None, &options, |ctx| {
            let flag = ctx.arg(0);
            ctx.branch(flag)?;
            Ok(None)
        });
        assert_eq!(
            result.unwrap_err(),
            TraceError::TraceLimitExceeded { iterations: 1 }
        );
    }

    #[test]
    fn type_errors_surface_while_tracing() {
        let result = trace_function(&[Type::I32, Type::I64], None, &options(), |ctx| {
            let (a, b) = (ctx.arg(0), ctx.arg(1));
            ctx.add(a, b)?;
            Ok(None)
        });
        assert!(matches!(result, Err(TraceError::TypeMismatch { .. })));
    }
}
