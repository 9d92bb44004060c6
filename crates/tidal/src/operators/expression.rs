use super::TracedRecord;
use crate::{
    ir::{BinaryOp, CompareOp, UnaryOp},
    memory::Schema,
    pipeline::PlanError,
    trace::{TraceContext, TraceResult, Val},
    types::{Type, Value},
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A scalar expression over the fields of a record.
///
/// Operands of binary operations and comparisons must have the same type,
/// use [`Expression::cast`] to convert. Integer division by zero yields
/// zero, see [`BinaryOp::Div`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    Field(String),
    Constant(Value),
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Compare {
        op: CompareOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        value: Box<Expression>,
    },
    Cast {
        value: Box<Expression>,
        to: Type,
    },
}

impl Expression {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    pub fn binary(self, op: BinaryOp, rhs: Self) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    pub fn compare(self, op: CompareOp, rhs: Self) -> Self {
        Self::Compare {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    pub fn add(self, rhs: Self) -> Self {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(self, rhs: Self) -> Self {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(self, rhs: Self) -> Self {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(self, rhs: Self) -> Self {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn and(self, rhs: Self) -> Self {
        self.binary(BinaryOp::And, rhs)
    }

    pub fn or(self, rhs: Self) -> Self {
        self.binary(BinaryOp::Or, rhs)
    }

    pub fn eq(self, rhs: Self) -> Self {
        self.compare(CompareOp::Eq, rhs)
    }

    pub fn ne(self, rhs: Self) -> Self {
        self.compare(CompareOp::Ne, rhs)
    }

    pub fn lt(self, rhs: Self) -> Self {
        self.compare(CompareOp::Lt, rhs)
    }

    pub fn le(self, rhs: Self) -> Self {
        self.compare(CompareOp::Le, rhs)
    }

    pub fn gt(self, rhs: Self) -> Self {
        self.compare(CompareOp::Gt, rhs)
    }

    pub fn ge(self, rhs: Self) -> Self {
        self.compare(CompareOp::Ge, rhs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Unary {
            op: UnaryOp::Not,
            value: Box::new(self),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(self) -> Self {
        Self::Unary {
            op: UnaryOp::Neg,
            value: Box::new(self),
        }
    }

    pub fn cast(self, to: Type) -> Self {
        Self::Cast {
            value: Box::new(self),
            to,
        }
    }

    /// Type of the expression over records of `schema`.
    pub fn result_type(&self, schema: &Schema) -> Result<Type, PlanError> {
        let mismatch = |message: String| PlanError::TypeMismatch { message };
        match self {
            Self::Field(name) => schema
                .get(name)
                .map(|field| field.ty)
                .ok_or_else(|| PlanError::UnknownField {
                    field: name.clone(),
                    schema: schema.to_string(),
                }),
            Self::Constant(value) => Ok(value.ty()),
            Self::Binary { op, lhs, rhs } => {
                let (lhs_ty, rhs_ty) = (lhs.result_type(schema)?, rhs.result_type(schema)?);
                if lhs_ty != rhs_ty || !op.supports(lhs_ty) {
                    return Err(mismatch(format!("{op} of {lhs_ty} and {rhs_ty} in {self}")));
                }
                if *op == BinaryOp::Rem && lhs_ty.is_float() {
                    return Err(mismatch(format!("rem of floats in {self}")));
                }
                Ok(lhs_ty)
            }
            Self::Compare { lhs, rhs, .. } => {
                let (lhs_ty, rhs_ty) = (lhs.result_type(schema)?, rhs.result_type(schema)?);
                if lhs_ty != rhs_ty {
                    return Err(mismatch(format!("comparison of {lhs_ty} and {rhs_ty} in {self}")));
                }
                Ok(Type::Bool)
            }
            Self::Unary { op, value } => {
                let ty = value.result_type(schema)?;
                let supported = match op {
                    UnaryOp::Not => ty.is_bool() || ty.is_int(),
                    UnaryOp::Neg => ty.is_numeric(),
                };
                if !supported {
                    return Err(mismatch(format!("{op} of {ty} in {self}")));
                }
                Ok(ty)
            }
            Self::Cast { value, to } => {
                let from = value.result_type(schema)?;
                if from == Type::Ptr || *to == Type::Ptr {
                    return Err(mismatch(format!("cast from {from} to {to} in {self}")));
                }
                Ok(*to)
            }
        }
    }

    /// Records the expression's operations. Every node is traced in its own
    /// frame, numbered in post order from `next_frame`.
    pub fn trace(
        &self,
        t: &mut TraceContext<'_>,
        record: &TracedRecord,
        next_frame: &mut u32,
    ) -> TraceResult<Val> {
        let value = match self {
            Self::Field(name) => return record.get(name),
            Self::Constant(value) => {
                let value = *value;
                return t.frame(take(next_frame), |t| t.constant(value));
            }
            Self::Binary { op, lhs, rhs } => {
                let lhs = lhs.trace(t, record, next_frame)?;
                let rhs = rhs.trace(t, record, next_frame)?;
                t.frame(take(next_frame), |t| t.binary(*op, lhs, rhs))?
            }
            Self::Compare { op, lhs, rhs } => {
                let lhs = lhs.trace(t, record, next_frame)?;
                let rhs = rhs.trace(t, record, next_frame)?;
                t.frame(take(next_frame), |t| t.compare(*op, lhs, rhs))?
            }
            Self::Unary { op, value } => {
                let value = value.trace(t, record, next_frame)?;
                t.frame(take(next_frame), |t| t.unary(*op, value))?
            }
            Self::Cast { value, to } => {
                let value = value.trace(t, record, next_frame)?;
                t.frame(take(next_frame), |t| t.cast(value, *to))?
            }
        };
        Ok(value)
    }
}

fn take(next_frame: &mut u32) -> u32 {
    let frame = *next_frame;
    *next_frame += 1;
    frame
}

impl Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Constant(value) => write!(f, "{value}"),
            Self::Binary { op, lhs, rhs } => write!(f, "{op}({lhs}, {rhs})"),
            Self::Compare { op, lhs, rhs } => write!(f, "{op}({lhs}, {rhs})"),
            Self::Unary { op, value } => write!(f, "{op}({value})"),
            Self::Cast { value, to } => write!(f, "cast({value} as {to})"),
        }
    }
}
