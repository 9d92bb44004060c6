use crate::types::Type;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// An ordered list of named, typed fields.
///
/// Fields are packed without padding; a record of the schema occupies
/// exactly [`Schema::record_size`] bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Appends a field, builder style.
    pub fn with(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.push(name, ty);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, ty: Type) {
        self.fields.push(Field::new(name, ty));
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Size in bytes of one packed record.
    pub fn record_size(&self) -> usize {
        self.fields.iter().map(|field| field.ty.size()).sum()
    }

    /// Byte offset of every field within a packed record.
    pub fn packed_offsets(&self) -> Vec<usize> {
        self.fields
            .iter()
            .scan(0, |offset, field| {
                let current = *offset;
                *offset += field.ty.size();
                Some(current)
            })
            .collect()
    }
}

impl Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, field) in self.fields.iter().enumerate() {
            if idx != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", field.name, field.ty)?;
        }
        f.write_str("}")
    }
}

impl FromIterator<Field> for Schema {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_offsets() {
        let schema = Schema::new()
            .with("a", Type::I64)
            .with("b", Type::I32)
            .with("c", Type::Bool);
        assert_eq!(schema.record_size(), 13);
        assert_eq!(schema.packed_offsets(), vec![0, 8, 12]);
        assert_eq!(schema.index_of("c"), Some(2));
        assert_eq!(schema.to_string(), "{a: i64, b: i32, c: bool}");
    }
}
