//! Reference semantics of IR operations over canonical bit patterns.
//!
//! The interpreter and constant folding evaluate through these functions and
//! the code generating backends reproduce them exactly:
//!
//! - integer arithmetic wraps at the operand width
//! - integer division or remainder by zero yields zero
//! - signed `MIN / -1` yields `MIN`, `MIN % -1` yields zero
//! - float to integer casts saturate and map NaN to zero
//! - float comparisons are ordered, except `ne` which holds for NaN

use crate::{
    ir::{BinaryOp, CompareOp, UnaryOp},
    types::{sign_extend, Type},
};

#[inline]
pub const fn canonical(ty: Type, bits: u64) -> u64 {
    bits & ty.mask()
}

#[inline]
fn to_f64(ty: Type, bits: u64) -> f64 {
    match ty {
        Type::F32 => f32::from_bits(bits as u32) as f64,
        _ => f64::from_bits(bits),
    }
}

#[inline]
fn from_f64(ty: Type, value: f64) -> u64 {
    match ty {
        Type::F32 => (value as f32).to_bits() as u64,
        _ => value.to_bits(),
    }
}

pub fn binary(op: BinaryOp, ty: Type, lhs: u64, rhs: u64) -> u64 {
    if ty.is_float() {
        return float_binary(op, ty, lhs, rhs);
    }

    let result = match op {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,

        BinaryOp::Div | BinaryOp::Rem if canonical(ty, rhs) == 0 => 0,
        BinaryOp::Div if ty.is_signed_int() => {
            sign_extend(ty, lhs).wrapping_div(sign_extend(ty, rhs)) as u64
        }
        BinaryOp::Rem if ty.is_signed_int() => {
            sign_extend(ty, lhs).wrapping_rem(sign_extend(ty, rhs)) as u64
        }
        BinaryOp::Div => canonical(ty, lhs) / canonical(ty, rhs),
        BinaryOp::Rem => canonical(ty, lhs) % canonical(ty, rhs),
    };

    canonical(ty, result)
}

fn float_binary(op: BinaryOp, ty: Type, lhs: u64, rhs: u64) -> u64 {
    // f32 arithmetic is performed in f32 so that rounding matches native code
    if ty == Type::F32 {
        let (lhs, rhs) = (f32::from_bits(lhs as u32), f32::from_bits(rhs as u32));
        let result = match op {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Rem => lhs % rhs,
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                unreachable!("bitwise {op} on {ty}")
            }
        };
        return result.to_bits() as u64;
    }

    let (lhs, rhs) = (f64::from_bits(lhs), f64::from_bits(rhs));
    let result = match op {
        BinaryOp::Add => lhs + rhs,
        BinaryOp::Sub => lhs - rhs,
        BinaryOp::Mul => lhs * rhs,
        BinaryOp::Div => lhs / rhs,
        BinaryOp::Rem => lhs % rhs,
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => unreachable!("bitwise {op} on {ty}"),
    };
    result.to_bits()
}

pub fn compare(op: CompareOp, ty: Type, lhs: u64, rhs: u64) -> bool {
    if ty.is_float() {
        let (lhs, rhs) = (to_f64(ty, lhs), to_f64(ty, rhs));
        return match op {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
        };
    }

    if ty.is_signed_int() {
        let (lhs, rhs) = (sign_extend(ty, lhs), sign_extend(ty, rhs));
        return compare_ord(op, lhs.cmp(&rhs));
    }

    let (lhs, rhs) = (canonical(ty, lhs), canonical(ty, rhs));
    compare_ord(op, lhs.cmp(&rhs))
}

fn compare_ord(op: CompareOp, ordering: std::cmp::Ordering) -> bool {
    match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    }
}

pub fn unary(op: UnaryOp, ty: Type, value: u64) -> u64 {
    match op {
        UnaryOp::Not if ty.is_bool() => value ^ 1,
        UnaryOp::Not => canonical(ty, !value),
        UnaryOp::Neg if ty.is_float() => from_f64(ty, -to_f64(ty, value)),
        UnaryOp::Neg => canonical(ty, value.wrapping_neg()),
    }
}

pub fn cast(from: Type, to: Type, bits: u64) -> u64 {
    if from == to {
        return canonical(to, bits);
    }

    if to.is_bool() {
        return if from.is_float() {
            (to_f64(from, bits) != 0.0) as u64
        } else {
            (canonical(from, bits) != 0) as u64
        };
    }

    if from.is_float() {
        let value = to_f64(from, bits);
        return match to {
            Type::F32 | Type::F64 => from_f64(to, value),
            Type::I8 => value as i8 as u8 as u64,
            Type::I16 => value as i16 as u16 as u64,
            Type::I32 => value as i32 as u32 as u64,
            Type::I64 => value as i64 as u64,
            Type::U8 => value as u8 as u64,
            Type::U16 => value as u16 as u64,
            Type::U32 => value as u32 as u64,
            Type::U64 | Type::Ptr => value as u64,
            Type::Bool => unreachable!(),
        };
    }

    // Booleans behave like unsigned integers from here on
    let widened = if from.is_signed_int() {
        sign_extend(from, bits) as u64
    } else {
        canonical(from, bits)
    };

    match to {
        Type::F32 if from.is_signed_int() => (widened as i64 as f32).to_bits() as u64,
        Type::F64 if from.is_signed_int() => (widened as i64 as f64).to_bits(),
        Type::F32 => (widened as f32).to_bits() as u64,
        Type::F64 => (widened as f64).to_bits(),
        _ => canonical(to, widened),
    }
}
