//! The SSA intermediate representation that traced pipelines are lowered to.
//!
//! A [`Function`] is a set of basic blocks with block parameters in place
//! of phi nodes. Values are typed with [`Type`](crate::types::Type) and
//! carried as 64 bit canonical bit patterns, see [`eval`] for the exact
//! semantics every backend implements.

mod builder;
pub mod eval;
mod function;
mod ids;
mod instr;
mod passes;
mod pretty;
mod terminator;
mod validate;

pub use builder::FunctionBuilder;
pub use function::{Block, Function};
pub use ids::{BlockId, BlockIdGen, ValueId, ValueIdGen};
pub use instr::{BinaryOp, CompareOp, Inst, InstKind, ProxyId, UnaryOp};
pub use terminator::{Branch, Jump, Return, Terminator};
pub use validate::{validate, ValidationError};
