// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cmp::Ordering;
use std::fmt::Display;

use crate::plan::schema::PhysicalType;
use crate::ErrorKind;

/// A runtime value of one tuple field.
///
/// Narrow integer types widen into the 64-bit representative of their class; the physical
/// layout keeps the declared width, the interpreter does not.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Char(Vec<u8>),
}

impl Value {
    pub fn data_type_class(&self) -> PhysicalType {
        match self {
            Value::Int(_) => PhysicalType::Int64,
            Value::UInt(_) => PhysicalType::UInt64,
            Value::Float(_) => PhysicalType::Float64,
            Value::Bool(_) => PhysicalType::Bool,
            Value::Char(bytes) => PhysicalType::Char(bytes.len()),
        }
    }

    pub fn as_bool(&self) -> crate::Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ErrorKind::SchemaMismatch
                .with_message(format!("expected BOOL, found {}", other.data_type_class()))),
        }
    }

    pub fn as_u64(&self) -> crate::Result<u64> {
        match self {
            Value::UInt(v) => Ok(*v),
            Value::Int(v) if *v >= 0 => Ok(*v as u64),
            other => Err(ErrorKind::SchemaMismatch
                .with_message(format!("expected UINT64, found {}", other.data_type_class()))),
        }
    }

    pub fn as_f64(&self) -> crate::Result<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            Value::UInt(v) => Ok(*v as f64),
            other => Err(ErrorKind::SchemaMismatch
                .with_message(format!("expected numeric, found {}", other.data_type_class()))),
        }
    }

    /// Numeric comparison across the integer and float classes; byte-wise for CHAR.
    pub fn compare(&self, other: &Self) -> crate::Result<Ordering> {
        let ordering = match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::UInt(a), Value::UInt(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Char(a), Value::Char(b)) => a.cmp(b),
            (Value::Int(a), Value::UInt(b)) => compare_int_uint(*a, *b),
            (Value::UInt(a), Value::Int(b)) => compare_int_uint(*b, *a).reverse(),
            (a, b) if a.data_type_class().is_numeric() && b.data_type_class().is_numeric() => {
                return a
                    .as_f64()?
                    .partial_cmp(&b.as_f64()?)
                    .ok_or_else(|| ErrorKind::InternalError.with_message("NaN in comparison"));
            }
            (a, b) => {
                return Err(ErrorKind::SchemaMismatch.with_message(format!(
                    "cannot compare {} with {}",
                    a.data_type_class(),
                    b.data_type_class()
                )))
            }
        };
        Ok(ordering)
    }

    /// The zero value of a physical type, used to initialize aggregation state.
    pub fn zero_of(data_type: PhysicalType) -> Self {
        if data_type.is_signed_integer() {
            Value::Int(0)
        } else if data_type.is_unsigned_integer() {
            Value::UInt(0)
        } else if data_type.is_float() {
            Value::Float(0.0)
        } else if data_type == PhysicalType::Bool {
            Value::Bool(false)
        } else {
            Value::Char(vec![0; data_type.size_in_bytes()])
        }
    }
}

fn compare_int_uint(a: i64, b: u64) -> Ordering {
    if a < 0 {
        Ordering::Less
    } else {
        (a as u64).cmp(&b)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Char(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_sign_comparison() -> crate::Result<()> {
        assert_eq!(Value::Int(-1).compare(&Value::UInt(0))?, Ordering::Less);
        assert_eq!(Value::UInt(5).compare(&Value::Int(3))?, Ordering::Greater);
        assert_eq!(Value::Int(4).compare(&Value::UInt(4))?, Ordering::Equal);
        Ok(())
    }

    #[test]
    fn float_widening_comparison() -> crate::Result<()> {
        assert_eq!(Value::UInt(2).compare(&Value::Float(2.5))?, Ordering::Less);
        Ok(())
    }

    #[test]
    fn bool_and_char_are_not_numeric() {
        assert!(Value::Bool(true).compare(&Value::UInt(1)).is_err());
        assert!(Value::Char(b"ab".to_vec()).compare(&Value::UInt(1)).is_err());
    }
}
