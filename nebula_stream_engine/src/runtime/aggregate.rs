// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Incremental aggregation state and the lift/combine/lower protocol.
//!
//! Each aggregate keeps a fixed-size state blob per key per slice: `{count}`, `{sum}`,
//! `{value, count}` for min/max, `{sum, count}` for avg. Lift folds one input value into
//! the state, combine merges two states associatively, lower projects the final value.
//! Min, max, and avg lower to `None` (null) when no value was ever lifted.

use crate::plan::operator::AggregationKind;
use crate::plan::schema::PhysicalType;
use crate::plan::value::Value;
use crate::ErrorKind;

/// Numeric class an aggregate accumulates in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NumericClass {
    Signed,
    Unsigned,
    Float,
}

impl NumericClass {
    fn of(data_type: PhysicalType) -> NumericClass {
        if data_type.is_float() {
            NumericClass::Float
        } else if data_type.is_signed_integer() {
            NumericClass::Signed
        } else {
            NumericClass::Unsigned
        }
    }

    fn decode(self, bytes: &[u8]) -> Value {
        let raw: [u8; 8] = bytes.try_into().expect("state width");
        match self {
            NumericClass::Signed => Value::Int(i64::from_le_bytes(raw)),
            NumericClass::Unsigned => Value::UInt(u64::from_le_bytes(raw)),
            NumericClass::Float => Value::Float(f64::from_le_bytes(raw)),
        }
    }

    fn encode(self, value: &Value, bytes: &mut [u8]) -> crate::Result<()> {
        let raw = match (self, value) {
            (NumericClass::Signed, Value::Int(v)) => v.to_le_bytes(),
            (NumericClass::Signed, Value::UInt(v)) => (*v as i64).to_le_bytes(),
            (NumericClass::Unsigned, Value::UInt(v)) => v.to_le_bytes(),
            (NumericClass::Unsigned, Value::Int(v)) if *v >= 0 => (*v as u64).to_le_bytes(),
            (NumericClass::Float, v) => v.as_f64()?.to_le_bytes(),
            (_, other) => {
                return Err(ErrorKind::SchemaMismatch
                    .with_message(format!("cannot accumulate {other} in aggregation state")))
            }
        };
        bytes.copy_from_slice(&raw);
        Ok(())
    }

    fn add(self, a: &Value, b: &Value) -> crate::Result<Value> {
        fn as_i64(value: &Value) -> crate::Result<i64> {
            match value {
                Value::Int(v) => Ok(*v),
                Value::UInt(v) => Ok(*v as i64),
                other => Err(ErrorKind::SchemaMismatch
                    .with_message(format!("expected integer, found {other}"))),
            }
        }
        Ok(match self {
            NumericClass::Signed => Value::Int(as_i64(a)?.wrapping_add(as_i64(b)?)),
            NumericClass::Unsigned => Value::UInt(a.as_u64()?.wrapping_add(b.as_u64()?)),
            NumericClass::Float => Value::Float(a.as_f64()? + b.as_f64()?),
        })
    }
}

/// One aggregate over one input field.
#[derive(Clone, Copy, Debug)]
pub struct AggregateFunction {
    pub kind: AggregationKind,
    class: NumericClass,
}

impl AggregateFunction {
    pub fn new(kind: AggregationKind, input_type: PhysicalType) -> crate::Result<Self> {
        if kind != AggregationKind::Count && !input_type.is_numeric() {
            return Err(ErrorKind::SchemaMismatch
                .with_message(format!("cannot aggregate over {input_type}")));
        }
        let class = match kind {
            AggregationKind::Count => NumericClass::Unsigned,
            AggregationKind::Avg => NumericClass::Float,
            _ => NumericClass::of(input_type),
        };
        Ok(Self { kind, class })
    }

    /// Size of this aggregate's state blob.
    pub fn state_size(&self) -> usize {
        match self.kind {
            AggregationKind::Count | AggregationKind::Sum => 8,
            AggregationKind::Min | AggregationKind::Max | AggregationKind::Avg => 16,
        }
    }

    /// A zeroed blob is a valid empty state for every kind.
    pub fn init(&self, state: &mut [u8]) {
        state.fill(0);
    }

    /// Folds one input value into the state.
    pub fn lift(&self, state: &mut [u8], value: &Value) -> crate::Result<()> {
        match self.kind {
            AggregationKind::Count => {
                let count = u64::from_le_bytes(state[..8].try_into().expect("state"));
                state[..8].copy_from_slice(&(count + 1).to_le_bytes());
            }
            AggregationKind::Sum => {
                let sum = self.class.decode(&state[..8]);
                self.class.encode(&self.class.add(&sum, value)?, &mut state[..8])?;
            }
            AggregationKind::Min | AggregationKind::Max => {
                let count = u64::from_le_bytes(state[8..16].try_into().expect("state"));
                let keep_new = if count == 0 {
                    true
                } else {
                    let current = self.class.decode(&state[..8]);
                    let ordering = value.compare(&current)?;
                    if self.kind == AggregationKind::Min {
                        ordering == std::cmp::Ordering::Less
                    } else {
                        ordering == std::cmp::Ordering::Greater
                    }
                };
                if keep_new {
                    self.class.encode(value, &mut state[..8])?;
                }
                state[8..16].copy_from_slice(&(count + 1).to_le_bytes());
            }
            AggregationKind::Avg => {
                let sum = f64::from_le_bytes(state[..8].try_into().expect("state"));
                let count = u64::from_le_bytes(state[8..16].try_into().expect("state"));
                state[..8].copy_from_slice(&(sum + value.as_f64()?).to_le_bytes());
                state[8..16].copy_from_slice(&(count + 1).to_le_bytes());
            }
        }
        Ok(())
    }

    /// Merges state `b` into state `a`.
    pub fn combine(&self, a: &mut [u8], b: &[u8]) -> crate::Result<()> {
        match self.kind {
            AggregationKind::Count => {
                let left = u64::from_le_bytes(a[..8].try_into().expect("state"));
                let right = u64::from_le_bytes(b[..8].try_into().expect("state"));
                a[..8].copy_from_slice(&(left + right).to_le_bytes());
            }
            AggregationKind::Sum => {
                let left = self.class.decode(&a[..8]);
                let right = self.class.decode(&b[..8]);
                self.class.encode(&self.class.add(&left, &right)?, &mut a[..8])?;
            }
            AggregationKind::Min | AggregationKind::Max => {
                let left_count = u64::from_le_bytes(a[8..16].try_into().expect("state"));
                let right_count = u64::from_le_bytes(b[8..16].try_into().expect("state"));
                if right_count > 0 {
                    let take_right = if left_count == 0 {
                        true
                    } else {
                        let left = self.class.decode(&a[..8]);
                        let right = self.class.decode(&b[..8]);
                        let ordering = right.compare(&left)?;
                        if self.kind == AggregationKind::Min {
                            ordering == std::cmp::Ordering::Less
                        } else {
                            ordering == std::cmp::Ordering::Greater
                        }
                    };
                    if take_right {
                        a[..8].copy_from_slice(&b[..8]);
                    }
                }
                a[8..16].copy_from_slice(&(left_count + right_count).to_le_bytes());
            }
            AggregationKind::Avg => {
                let left_sum = f64::from_le_bytes(a[..8].try_into().expect("state"));
                let right_sum = f64::from_le_bytes(b[..8].try_into().expect("state"));
                let left_count = u64::from_le_bytes(a[8..16].try_into().expect("state"));
                let right_count = u64::from_le_bytes(b[8..16].try_into().expect("state"));
                a[..8].copy_from_slice(&(left_sum + right_sum).to_le_bytes());
                a[8..16].copy_from_slice(&(left_count + right_count).to_le_bytes());
            }
        }
        Ok(())
    }

    /// Projects the final value; `None` is the null result of an empty min/max/avg.
    pub fn lower(&self, state: &[u8]) -> Option<Value> {
        match self.kind {
            AggregationKind::Count => Some(self.class.decode(&state[..8])),
            AggregationKind::Sum => Some(self.class.decode(&state[..8])),
            AggregationKind::Min | AggregationKind::Max => {
                let count = u64::from_le_bytes(state[8..16].try_into().expect("state"));
                (count > 0).then(|| self.class.decode(&state[..8]))
            }
            AggregationKind::Avg => {
                let count = u64::from_le_bytes(state[8..16].try_into().expect("state"));
                if count == 0 {
                    return None;
                }
                let sum = f64::from_le_bytes(state[..8].try_into().expect("state"));
                Some(Value::Float(sum / count as f64))
            }
        }
    }
}

/// The concatenated state blobs of a window's aggregates.
#[derive(Clone, Debug)]
pub struct AggregateLayout {
    functions: Vec<AggregateFunction>,
    offsets: Vec<usize>,
    total_size: usize,
}

impl AggregateLayout {
    pub fn new(functions: Vec<AggregateFunction>) -> Self {
        let mut offsets = Vec::with_capacity(functions.len());
        let mut offset = 0;
        for function in &functions {
            offsets.push(offset);
            offset += function.state_size();
        }
        Self {
            functions,
            offsets,
            total_size: offset,
        }
    }

    pub fn functions(&self) -> &[AggregateFunction] {
        &self.functions
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn state_of<'a>(&self, blob: &'a [u8], index: usize) -> &'a [u8] {
        &blob[self.offsets[index]..self.offsets[index] + self.functions[index].state_size()]
    }

    pub fn state_of_mut<'a>(&self, blob: &'a mut [u8], index: usize) -> &'a mut [u8] {
        &mut blob[self.offsets[index]..self.offsets[index] + self.functions[index].state_size()]
    }

    /// Lifts one row's input values (one per aggregate, in order).
    pub fn lift(&self, blob: &mut [u8], inputs: &[Value]) -> crate::Result<()> {
        for (index, function) in self.functions.iter().enumerate() {
            function.lift(self.state_of_mut(blob, index), &inputs[index])?;
        }
        Ok(())
    }

    /// Combines blob `b` into blob `a`, per aggregate.
    pub fn combine(&self, a: &mut [u8], b: &[u8]) -> crate::Result<()> {
        for (index, function) in self.functions.iter().enumerate() {
            let right = self.state_of(b, index).to_vec();
            function.combine(self.state_of_mut(a, index), &right)?;
        }
        Ok(())
    }

    /// Lowers every aggregate; empty states lower to `None`.
    pub fn lower(&self, blob: &[u8]) -> Vec<Option<Value>> {
        self.functions
            .iter()
            .enumerate()
            .map(|(index, function)| function.lower(self.state_of(blob, index)))
            .collect()
    }
}
