//! Scalar types shared by schemas, the IR and every backend.
//!
//! At runtime every scalar travels as a `u64` holding its canonical bit
//! pattern: integers are truncated to their width and zero extended, booleans
//! are `0` or `1` and floats are their IEEE bits (`f32` bits zero extended).

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Type {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// An untyped pointer, 64 bits wide on every supported target.
    Ptr,
}

impl Type {
    /// The size of the type in bytes when stored inside a buffer.
    pub const fn size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::Ptr => 8,
        }
    }

    pub const fn bits(self) -> u32 {
        self.size() as u32 * 8
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub const fn is_signed_int(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    pub const fn is_unsigned_int(self) -> bool {
        matches!(
            self,
            Self::U8 | Self::U16 | Self::U32 | Self::U64 | Self::Ptr
        )
    }

    /// Returns `true` for every integer type, pointers included.
    pub const fn is_int(self) -> bool {
        self.is_signed_int() || self.is_unsigned_int()
    }

    pub const fn is_bool(self) -> bool {
        matches!(self, Self::Bool)
    }

    /// Returns `true` if the type supports arithmetic.
    pub const fn is_numeric(self) -> bool {
        self.is_int() || self.is_float()
    }

    /// The mask selecting the significant bits of a canonical value.
    pub const fn mask(self) -> u64 {
        match self {
            Self::Bool => 1,
            _ if self.size() == 8 => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    /// The widened type used for accumulation.
    pub const fn widened(self) -> Self {
        match self {
            Self::Bool | Self::U8 | Self::U16 | Self::U32 | Self::U64 | Self::Ptr => Self::U64,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 => Self::I64,
            Self::F32 | Self::F64 => Self::F64,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Ptr => "ptr",
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sign extends the canonical bits of a signed integer to 64 bits.
pub const fn sign_extend(ty: Type, bits: u64) -> i64 {
    let shift = 64 - ty.bits();
    ((bits << shift) as i64) >> shift
}

/// A typed scalar value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Deserialize, Serialize)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub const fn ty(&self) -> Type {
        match self {
            Self::Bool(_) => Type::Bool,
            Self::I8(_) => Type::I8,
            Self::I16(_) => Type::I16,
            Self::I32(_) => Type::I32,
            Self::I64(_) => Type::I64,
            Self::U8(_) => Type::U8,
            Self::U16(_) => Type::U16,
            Self::U32(_) => Type::U32,
            Self::U64(_) => Type::U64,
            Self::F32(_) => Type::F32,
            Self::F64(_) => Type::F64,
        }
    }

    /// The canonical bit pattern of the value.
    pub fn to_bits(&self) -> u64 {
        match *self {
            Self::Bool(value) => value as u64,
            Self::I8(value) => value as u8 as u64,
            Self::I16(value) => value as u16 as u64,
            Self::I32(value) => value as u32 as u64,
            Self::I64(value) => value as u64,
            Self::U8(value) => value as u64,
            Self::U16(value) => value as u64,
            Self::U32(value) => value as u64,
            Self::U64(value) => value,
            Self::F32(value) => value.to_bits() as u64,
            Self::F64(value) => value.to_bits(),
        }
    }

    /// Rebuilds a value from canonical bits. Pointers read back as `u64`.
    pub fn from_bits(ty: Type, bits: u64) -> Self {
        match ty {
            Type::Bool => Self::Bool(bits & 1 != 0),
            Type::I8 => Self::I8(bits as u8 as i8),
            Type::I16 => Self::I16(bits as u16 as i16),
            Type::I32 => Self::I32(bits as u32 as i32),
            Type::I64 => Self::I64(bits as i64),
            Type::U8 => Self::U8(bits as u8),
            Type::U16 => Self::U16(bits as u16),
            Type::U32 => Self::U32(bits as u32),
            Type::U64 | Type::Ptr => Self::U64(bits),
            Type::F32 => Self::F32(f32::from_bits(bits as u32)),
            Type::F64 => Self::F64(f64::from_bits(bits)),
        }
    }

    /// Encodes the value into `out`, which must be exactly `ty().size()`
    /// bytes long.
    pub fn write_le(&self, out: &mut [u8]) {
        let size = self.ty().size();
        out[..size].copy_from_slice(&self.to_bits().to_le_bytes()[..size]);
    }

    pub fn read_le(ty: Type, bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw[..ty.size()].copy_from_slice(&bytes[..ty.size()]);
        Self::from_bits(ty, u64::from_le_bytes(raw))
    }

    /// Interprets the value as an unsigned timestamp, if it is an integer.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::I8(value) => Some(value as u64),
            Self::I16(value) => Some(value as u64),
            Self::I32(value) => Some(value as u64),
            Self::I64(value) => Some(value as u64),
            Self::U8(value) => Some(value as u64),
            Self::U16(value) => Some(value as u64),
            Self::U32(value) => Some(value as u64),
            Self::U64(value) => Some(value),
            Self::Bool(_) | Self::F32(_) | Self::F64(_) => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::I8(value) => write!(f, "{value}i8"),
            Self::I16(value) => write!(f, "{value}i16"),
            Self::I32(value) => write!(f, "{value}i32"),
            Self::I64(value) => write!(f, "{value}i64"),
            Self::U8(value) => write!(f, "{value}u8"),
            Self::U16(value) => write!(f, "{value}u16"),
            Self::U32(value) => write!(f, "{value}u32"),
            Self::U64(value) => write!(f, "{value}u64"),
            Self::F32(value) => write!(f, "{value}f32"),
            Self::F64(value) => write!(f, "{value}f64"),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn canonical_bits() {
        assert_eq!(Value::I32(-1).to_bits(), 0xFFFF_FFFF);
        assert_eq!(Value::I8(-2).to_bits(), 0xFE);
        assert_eq!(Value::Bool(true).to_bits(), 1);
        assert_eq!(sign_extend(Type::I8, 0xFE), -2);
        assert_eq!(sign_extend(Type::I64, u64::MAX), -1);
        assert_eq!(Type::U16.mask(), 0xFFFF);
        assert_eq!(Type::F64.mask(), u64::MAX);
    }

    proptest! {
        #[test]
        fn bits_roundtrip_i32(value: i32) {
            let bits = Value::I32(value).to_bits();
            prop_assert_eq!(bits & !Type::I32.mask(), 0);
            prop_assert_eq!(Value::from_bits(Type::I32, bits), Value::I32(value));
        }

        #[test]
        fn le_roundtrip_i16(value: i16) {
            let mut bytes = [0u8; 2];
            Value::I16(value).write_le(&mut bytes);
            prop_assert_eq!(bytes, value.to_le_bytes());
            prop_assert_eq!(Value::read_le(Type::I16, &bytes), Value::I16(value));
        }
    }
}
