// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Row and column memory layouts over tuple-buffer payloads.
//!
//! The row layout packs whole tuples back to back at schema offsets. The column layout
//! lays out one contiguous array per column, sized by the buffer's row capacity, followed
//! by per-column validity bitmaps.

use std::borrow::Cow;

use crate::config::MemoryLayoutPolicy;
use crate::plan::schema::{PhysicalType, Schema};
use crate::plan::value::Value;
use crate::ErrorKind;

fn encode_value(dst: &mut [u8], data_type: PhysicalType, value: &Value) -> crate::Result<()> {
    let width = data_type.size_in_bytes();
    match data_type {
        PhysicalType::Bool => dst[0] = if value.as_bool()? { 1 } else { 0 },
        PhysicalType::Char(n) => {
            let Value::Char(bytes) = value else {
                return Err(ErrorKind::SchemaMismatch
                    .with_message(format!("expected CHAR[{n}], found {value}")));
            };
            let copy = bytes.len().min(n);
            dst[..copy].copy_from_slice(&bytes[..copy]);
            dst[copy..n].fill(0);
        }
        t if t.is_float() => {
            let v = value.as_f64()?;
            if width == 4 {
                dst.copy_from_slice(&(v as f32).to_le_bytes());
            } else {
                dst.copy_from_slice(&v.to_le_bytes());
            }
        }
        t if t.is_signed_integer() => {
            let v = match value {
                Value::Int(v) => *v,
                Value::UInt(v) => *v as i64,
                other => {
                    return Err(ErrorKind::SchemaMismatch
                        .with_message(format!("expected {t}, found {other}")))
                }
            };
            dst.copy_from_slice(&v.to_le_bytes()[..width]);
        }
        t => {
            let v = match value {
                Value::UInt(v) => *v,
                Value::Int(v) if *v >= 0 => *v as u64,
                other => {
                    return Err(ErrorKind::SchemaMismatch
                        .with_message(format!("expected {t}, found {other}")))
                }
            };
            dst.copy_from_slice(&v.to_le_bytes()[..width]);
        }
    }
    Ok(())
}

fn decode_value(src: &[u8], data_type: PhysicalType) -> Value {
    match data_type {
        PhysicalType::Bool => Value::Bool(src[0] != 0),
        PhysicalType::Char(_) => Value::Char(src.to_vec()),
        PhysicalType::Float32 => {
            Value::Float(f32::from_le_bytes(src.try_into().expect("width")) as f64)
        }
        PhysicalType::Float64 => Value::Float(f64::from_le_bytes(src.try_into().expect("width"))),
        t if t.is_signed_integer() => {
            let mut bytes = [0u8; 8];
            bytes[..src.len()].copy_from_slice(src);
            // Sign-extend the narrow value.
            if src[src.len() - 1] & 0x80 != 0 {
                bytes[src.len()..].fill(0xFF);
            }
            Value::Int(i64::from_le_bytes(bytes))
        }
        _ => {
            let mut bytes = [0u8; 8];
            bytes[..src.len()].copy_from_slice(src);
            Value::UInt(u64::from_le_bytes(bytes))
        }
    }
}

#[derive(Clone, Debug)]
pub struct RowLayout {
    field_types: Vec<PhysicalType>,
    field_offsets: Vec<usize>,
    tuple_size: usize,
}

impl RowLayout {
    pub fn new(schema: &Schema) -> Self {
        let mut offsets = Vec::with_capacity(schema.len());
        let mut offset = 0;
        let mut types = Vec::with_capacity(schema.len());
        for field in schema.fields() {
            offsets.push(offset);
            offset += field.data_type.size_in_bytes();
            types.push(field.data_type);
        }
        Self {
            field_types: types,
            field_offsets: offsets,
            tuple_size: offset,
        }
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn capacity(&self, payload_len: usize) -> usize {
        if self.tuple_size == 0 {
            0
        } else {
            payload_len / self.tuple_size
        }
    }

    fn field_slice<'a>(&self, payload: &'a [u8], row: usize, field: usize) -> &'a [u8] {
        let base = row * self.tuple_size + self.field_offsets[field];
        &payload[base..base + self.field_types[field].size_in_bytes()]
    }

    pub fn read_value(&self, payload: &[u8], row: usize, field: usize) -> Value {
        decode_value(self.field_slice(payload, row, field), self.field_types[field])
    }

    /// Reads the first row's values, for single-tuple regions such as hash-map keys.
    pub fn read_row_values(&self, payload: &[u8], fields: usize) -> Vec<Value> {
        (0..fields).map(|f| self.read_value(payload, 0, f)).collect()
    }

    pub fn write_value(
        &self,
        payload: &mut [u8],
        row: usize,
        field: usize,
        value: &Value,
    ) -> crate::Result<()> {
        let base = row * self.tuple_size + self.field_offsets[field];
        let width = self.field_types[field].size_in_bytes();
        encode_value(&mut payload[base..base + width], self.field_types[field], value)
    }
}

#[derive(Clone, Debug)]
pub struct ColumnLayout {
    field_types: Vec<PhysicalType>,
    /// Byte offset of each column array, for the computed capacity.
    column_offsets: Vec<usize>,
    /// Offset of the validity area (one bitmap per column, capacity bits each).
    validity_offset: usize,
    capacity: usize,
    /// Payload length the offsets were computed for.
    payload_len: usize,
}

impl ColumnLayout {
    pub fn new(schema: &Schema, payload_len: usize) -> Self {
        let types = schema.fields().iter().map(|f| f.data_type).collect();
        Self::from_types(types, payload_len)
    }

    fn from_types(field_types: Vec<PhysicalType>, payload_len: usize) -> Self {
        let tuple_size: usize = field_types.iter().map(|t| t.size_in_bytes()).sum();
        let fields = field_types.len();
        // Capacity: rows * tuple_size plus one validity bit per row per column must fit.
        let mut capacity = if tuple_size == 0 {
            0
        } else {
            payload_len / tuple_size
        };
        while capacity > 0 && capacity * tuple_size + fields * capacity.div_ceil(8) > payload_len
        {
            capacity -= 1;
        }
        let mut column_offsets = Vec::with_capacity(fields);
        let mut offset = 0;
        for data_type in &field_types {
            column_offsets.push(offset);
            offset += data_type.size_in_bytes() * capacity;
        }
        Self {
            field_types,
            column_offsets,
            validity_offset: offset,
            capacity,
            payload_len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn cell(&self, row: usize, field: usize) -> (usize, usize) {
        let width = self.field_types[field].size_in_bytes();
        let base = self.column_offsets[field] + row * width;
        (base, width)
    }

    pub fn read_value(&self, payload: &[u8], row: usize, field: usize) -> Value {
        let (base, width) = self.cell(row, field);
        decode_value(&payload[base..base + width], self.field_types[field])
    }

    pub fn write_value(
        &self,
        payload: &mut [u8],
        row: usize,
        field: usize,
        value: &Value,
    ) -> crate::Result<()> {
        let (base, width) = self.cell(row, field);
        encode_value(&mut payload[base..base + width], self.field_types[field], value)?;
        self.set_valid(payload, row, field);
        Ok(())
    }

    fn validity_bit(&self, row: usize, field: usize) -> (usize, u8) {
        let bitmap_len = self.capacity.div_ceil(8);
        let byte = self.validity_offset + field * bitmap_len + row / 8;
        (byte, 1 << (row % 8))
    }

    fn set_valid(&self, payload: &mut [u8], row: usize, field: usize) {
        let (byte, mask) = self.validity_bit(row, field);
        payload[byte] |= mask;
    }

    pub fn is_valid(&self, payload: &[u8], row: usize, field: usize) -> bool {
        let (byte, mask) = self.validity_bit(row, field);
        payload[byte] & mask != 0
    }
}

/// Layout selected for one pipeline, per the configured policy.
#[derive(Clone, Debug)]
pub enum MemoryLayout {
    Row(RowLayout),
    Column(ColumnLayout),
}

impl MemoryLayout {
    pub fn of(policy: MemoryLayoutPolicy, schema: &Schema, payload_len: usize) -> Self {
        match policy {
            MemoryLayoutPolicy::ForceRowLayout => MemoryLayout::Row(RowLayout::new(schema)),
            MemoryLayoutPolicy::ForceColumnLayout => {
                MemoryLayout::Column(ColumnLayout::new(schema, payload_len))
            }
        }
    }

    pub fn capacity(&self, payload_len: usize) -> usize {
        match self {
            MemoryLayout::Row(layout) => layout.capacity(payload_len),
            MemoryLayout::Column(layout) => layout.capacity(),
        }
    }

    /// The payload length needed to hold the given number of rows.
    pub fn payload_for_rows(&self, rows: usize) -> usize {
        match self {
            MemoryLayout::Row(layout) => rows * layout.tuple_size(),
            MemoryLayout::Column(layout) => {
                let tuple_size: usize = layout
                    .field_types
                    .iter()
                    .map(|t| t.size_in_bytes())
                    .sum();
                rows * tuple_size + layout.field_types.len() * rows.div_ceil(8)
            }
        }
    }

    /// A layout addressing a payload of the given length.
    ///
    /// Row layouts are length-independent; a column layout is rebuilt when the payload
    /// differs from the one its offsets were computed for, as with unpooled buffers
    /// carrying oversized tuples.
    pub fn sized_for(&self, payload_len: usize) -> Cow<'_, MemoryLayout> {
        match self {
            MemoryLayout::Row(_) => Cow::Borrowed(self),
            MemoryLayout::Column(layout) if layout.payload_len == payload_len => {
                Cow::Borrowed(self)
            }
            MemoryLayout::Column(layout) => Cow::Owned(MemoryLayout::Column(
                ColumnLayout::from_types(layout.field_types.clone(), payload_len),
            )),
        }
    }

    pub fn read_value(&self, payload: &[u8], row: usize, field: usize) -> Value {
        match self {
            MemoryLayout::Row(layout) => layout.read_value(payload, row, field),
            MemoryLayout::Column(layout) => layout.read_value(payload, row, field),
        }
    }

    pub fn write_value(
        &self,
        payload: &mut [u8],
        row: usize,
        field: usize,
        value: &Value,
    ) -> crate::Result<()> {
        match self {
            MemoryLayout::Row(layout) => layout.write_value(payload, row, field, value),
            MemoryLayout::Column(layout) => layout.write_value(payload, row, field, value),
        }
    }

    /// Reads one whole row.
    pub fn read_row(&self, payload: &[u8], row: usize, fields: usize) -> Vec<Value> {
        (0..fields).map(|f| self.read_value(payload, row, f)).collect()
    }

    /// Writes one whole row.
    pub fn write_row(
        &self,
        payload: &mut [u8],
        row: usize,
        values: &[Value],
    ) -> crate::Result<()> {
        for (field, value) in values.iter().enumerate() {
            self.write_value(payload, row, field, value)?;
        }
        Ok(())
    }
}
