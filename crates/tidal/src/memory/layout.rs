use super::{MemoryError, Record, Schema, TupleBuffer};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use tidal_types::config::MemoryLayoutKind;

/// Maps the fields of a schema to byte offsets inside a buffer of a given
/// size.
///
/// Row layouts store every record contiguously, `record_size` bytes apart.
/// Columnar layouts give each field its own run of `capacity` values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MemoryLayout {
    kind: MemoryLayoutKind,
    schema: Schema,
    buffer_size: usize,
    record_size: usize,
    capacity: u64,
    /// Row: offset of the field within a record.
    /// Columnar: offset of the field's column within the buffer.
    field_offsets: Vec<usize>,
}

impl MemoryLayout {
    pub fn new(
        kind: MemoryLayoutKind,
        schema: Schema,
        buffer_size: usize,
    ) -> Result<Self, MemoryError> {
        let record_size = schema.record_size();
        if record_size == 0 || record_size > buffer_size {
            return Err(MemoryError::SchemaMismatch {
                record_size,
                capacity: buffer_size,
            });
        }

        let capacity = (buffer_size / record_size) as u64;
        let field_offsets = match kind {
            MemoryLayoutKind::Row => schema.packed_offsets(),
            MemoryLayoutKind::Columnar => schema
                .packed_offsets()
                .into_iter()
                .map(|offset| offset * capacity as usize)
                .collect(),
        };

        Ok(Self {
            kind,
            schema,
            buffer_size,
            record_size,
            capacity,
            field_offsets,
        })
    }

    pub fn row(schema: Schema, buffer_size: usize) -> Result<Self, MemoryError> {
        Self::new(MemoryLayoutKind::Row, schema, buffer_size)
    }

    pub fn columnar(schema: Schema, buffer_size: usize) -> Result<Self, MemoryError> {
        Self::new(MemoryLayoutKind::Columnar, schema, buffer_size)
    }

    pub const fn kind(&self) -> MemoryLayoutKind {
        self.kind
    }

    pub const fn schema(&self) -> &Schema {
        &self.schema
    }

    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub const fn record_size(&self) -> usize {
        self.record_size
    }

    /// Maximum number of records a buffer of [`Self::buffer_size`] holds.
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Byte offset of `field` of the record at `index`, relative to the
    /// start of the buffer.
    pub fn field_offset(&self, index: u64, field: usize) -> usize {
        match self.kind {
            MemoryLayoutKind::Row => index as usize * self.record_size + self.field_offsets[field],
            MemoryLayoutKind::Columnar => {
                self.field_offsets[field] + index as usize * self.schema.field(field).ty.size()
            }
        }
    }

    /// The constant part and per-record stride of a field's offset, such
    /// that `field_offset(i, field) == base + i * stride`.
    pub fn field_stride(&self, field: usize) -> (usize, usize) {
        match self.kind {
            MemoryLayoutKind::Row => (self.field_offsets[field], self.record_size),
            MemoryLayoutKind::Columnar => {
                (self.field_offsets[field], self.schema.field(field).ty.size())
            }
        }
    }

    /// Binds the layout to a buffer, failing if the buffer cannot hold a
    /// single record.
    pub fn bind<'a>(&'a self, buffer: &'a TupleBuffer) -> Result<LayoutBuffer<'a>, MemoryError> {
        let mismatch = || MemoryError::SchemaMismatch {
            record_size: self.record_size,
            capacity: buffer.capacity(),
        };

        let capacity = match self.kind {
            MemoryLayoutKind::Row => {
                self.capacity
                    .min((buffer.capacity() / self.record_size) as u64)
            }
            // Column offsets are fixed by the layout's buffer size
            MemoryLayoutKind::Columnar if buffer.capacity() < self.buffer_size => {
                return Err(mismatch())
            }
            MemoryLayoutKind::Columnar => self.capacity,
        };

        if capacity == 0 {
            return Err(mismatch());
        }

        Ok(LayoutBuffer {
            layout: self,
            buffer,
            capacity,
        })
    }
}

/// A buffer viewed through a memory layout.
#[derive(Debug, Clone, Copy)]
pub struct LayoutBuffer<'a> {
    layout: &'a MemoryLayout,
    buffer: &'a TupleBuffer,
    capacity: u64,
}

impl<'a> LayoutBuffer<'a> {
    pub const fn layout(&self) -> &'a MemoryLayout {
        self.layout
    }

    pub const fn buffer(&self) -> &'a TupleBuffer {
        self.buffer
    }

    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn num_records(&self) -> u64 {
        self.buffer.num_tuples()
    }

    fn check_index(&self, index: u64) -> Result<(), MemoryError> {
        if index < self.capacity {
            Ok(())
        } else {
            Err(MemoryError::OutOfBounds {
                index,
                capacity: self.capacity,
            })
        }
    }

    pub fn read_field(&self, index: u64, field: usize) -> Result<Value, MemoryError> {
        self.check_index(index)?;
        let ty = self.layout.schema.field(field).ty;
        let mut bytes = [0u8; 8];
        self.buffer.read_into(
            self.layout.field_offset(index, field),
            &mut bytes[..ty.size()],
        );
        Ok(Value::read_le(ty, &bytes))
    }

    pub fn write_field(&self, index: u64, field: usize, value: Value) -> Result<(), MemoryError> {
        self.check_index(index)?;
        let expected = &self.layout.schema.field(field);
        if value.ty() != expected.ty {
            return Err(MemoryError::InvalidRecord {
                reason: format!(
                    "field `{}` has type {} but the value is {}",
                    expected.name,
                    expected.ty,
                    value.ty(),
                ),
            });
        }

        let mut bytes = [0u8; 8];
        value.write_le(&mut bytes);
        self.buffer.write_from(
            self.layout.field_offset(index, field),
            &bytes[..expected.ty.size()],
        );
        Ok(())
    }

    pub fn read_record(&self, index: u64) -> Result<Record, MemoryError> {
        let mut record = Record::new();
        for (field_idx, field) in self.layout.schema.fields().iter().enumerate() {
            record.insert(field.name.clone(), self.read_field(index, field_idx)?);
        }
        Ok(record)
    }

    /// Writes every schema field of `record` at `index`. Extra fields in the
    /// record are ignored.
    pub fn write_record(&self, index: u64, record: &Record) -> Result<(), MemoryError> {
        self.check_index(index)?;
        for (field_idx, field) in self.layout.schema.fields().iter().enumerate() {
            let value = record
                .get(&field.name)
                .ok_or_else(|| MemoryError::InvalidRecord {
                    reason: format!("missing field `{}`", field.name),
                })?;
            self.write_field(index, field_idx, *value)?;
        }
        Ok(())
    }

    /// Appends a record after the last one and bumps the tuple count.
    pub fn push_record(&self, record: &Record) -> Result<u64, MemoryError> {
        let index = self.num_records();
        self.write_record(index, record)?;
        self.buffer.set_num_tuples(index + 1);
        Ok(index)
    }

    /// Reads the first `num_records()` records.
    pub fn records(&self) -> Result<Vec<Record>, MemoryError> {
        (0..self.num_records().min(self.capacity))
            .map(|index| self.read_record(index))
            .collect()
    }
}
