// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Display;

use serde::Deserialize;

use crate::ErrorKind;

/// Physical type of a single tuple field.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
pub enum PhysicalType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    /// Fixed-width character field of the given byte length.
    Char(usize),
}

impl PhysicalType {
    /// Width of the type in a row-layout tuple, in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            PhysicalType::Int8 | PhysicalType::UInt8 | PhysicalType::Bool => 1,
            PhysicalType::Int16 | PhysicalType::UInt16 => 2,
            PhysicalType::Int32 | PhysicalType::UInt32 | PhysicalType::Float32 => 4,
            PhysicalType::Int64 | PhysicalType::UInt64 | PhysicalType::Float64 => 8,
            PhysicalType::Char(n) => n,
        }
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(
            self,
            PhysicalType::Int8 | PhysicalType::Int16 | PhysicalType::Int32 | PhysicalType::Int64
        )
    }

    pub fn is_unsigned_integer(self) -> bool {
        matches!(
            self,
            PhysicalType::UInt8
                | PhysicalType::UInt16
                | PhysicalType::UInt32
                | PhysicalType::UInt64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, PhysicalType::Float32 | PhysicalType::Float64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer() || self.is_float()
    }
}

impl Display for PhysicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PhysicalType::Int8 => write!(f, "INT8"),
            PhysicalType::Int16 => write!(f, "INT16"),
            PhysicalType::Int32 => write!(f, "INT32"),
            PhysicalType::Int64 => write!(f, "INT64"),
            PhysicalType::UInt8 => write!(f, "UINT8"),
            PhysicalType::UInt16 => write!(f, "UINT16"),
            PhysicalType::UInt32 => write!(f, "UINT32"),
            PhysicalType::UInt64 => write!(f, "UINT64"),
            PhysicalType::Float32 => write!(f, "FLOAT"),
            PhysicalType::Float64 => write!(f, "DOUBLE"),
            PhysicalType::Bool => write!(f, "BOOL"),
            PhysicalType::Char(n) => write!(f, "CHAR[{n}]"),
        }
    }
}

/// Separator between the source qualifier and the field name, as in `cars$speed`.
pub const QUALIFIER_SEPARATOR: char = '$';

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type: PhysicalType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// The field name without its source qualifier, if it carries one.
    pub fn unqualified_name(&self) -> &str {
        match self.name.rsplit_once(QUALIFIER_SEPARATOR) {
            Some((_, unqualified)) => unqualified,
            None => &self.name,
        }
    }
}

/// An ordered sequence of typed, source-qualified fields.
///
/// Fields are looked up by their full qualified name first; a lookup by unqualified name
/// succeeds when exactly one field matches, mirroring how queries reference columns without
/// repeating the source prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, data_type: PhysicalType) -> Self {
        self.fields.push(Field::new(name, data_type));
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns a copy of this schema with every field prefixed by `<source>$`.
    ///
    /// Fields that already carry a qualifier keep it.
    pub fn qualified(&self, source: &str) -> Self {
        let fields = self
            .fields
            .iter()
            .map(|f| {
                if f.name.contains(QUALIFIER_SEPARATOR) {
                    f.clone()
                } else {
                    Field::new(
                        format!("{source}{QUALIFIER_SEPARATOR}{}", f.name),
                        f.data_type,
                    )
                }
            })
            .collect();
        Self { fields }
    }

    /// Resolves a field by qualified or unqualified name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        if let Some(index) = self.fields.iter().position(|f| f.name == name) {
            return Some(index);
        }
        let mut matches = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.unqualified_name() == name);
        match (matches.next(), matches.next()) {
            (Some((index, _)), None) => Some(index),
            // Ambiguous or absent: the caller has to qualify the name.
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index_of(name).map(|i| &self.fields[i])
    }

    pub fn field_type(&self, name: &str) -> crate::Result<PhysicalType> {
        self.field(name).map(|f| f.data_type).ok_or_else(|| {
            ErrorKind::SchemaMismatch.with_message(format!("unknown field: {name}"))
        })
    }

    /// Size of one row-layout tuple of this schema.
    pub fn size_in_bytes(&self) -> usize {
        self.fields.iter().map(|f| f.data_type.size_in_bytes()).sum()
    }

    /// Checks that two schemas agree field-for-field on type, ignoring qualifiers.
    ///
    /// This is the union compatibility rule: names may differ between the two inputs, but
    /// arity and types must line up positionally.
    pub fn union_compatible(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|(a, b)| a.data_type == b.data_type)
    }
}

impl Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field.name, field.data_type)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle_schema() -> Schema {
        Schema::new()
            .with_field("id", PhysicalType::UInt64)
            .with_field("speed", PhysicalType::Float64)
            .qualified("cars")
    }

    #[test]
    fn qualification_prefixes_fields() {
        let schema = vehicle_schema();
        assert_eq!(schema.fields()[0].name, "cars$id");
        assert_eq!(schema.fields()[1].name, "cars$speed");
    }

    #[test]
    fn unqualified_lookup_resolves_unique_fields() {
        let schema = vehicle_schema();
        assert_eq!(schema.index_of("speed"), Some(1));
        assert_eq!(schema.index_of("cars$id"), Some(0));
        assert_eq!(schema.index_of("missing"), None);
    }

    #[test]
    fn ambiguous_unqualified_lookup_fails() {
        let schema = Schema::new()
            .with_field("cars$id", PhysicalType::UInt64)
            .with_field("bikes$id", PhysicalType::UInt64);
        assert_eq!(schema.index_of("id"), None);
        assert_eq!(schema.index_of("bikes$id"), Some(1));
    }

    #[test]
    fn union_compatibility_is_positional_on_types() {
        let left = vehicle_schema();
        let right = Schema::new()
            .with_field("id", PhysicalType::UInt64)
            .with_field("velocity", PhysicalType::Float64)
            .qualified("trucks");
        assert!(left.union_compatible(&right));

        let mismatched = Schema::new()
            .with_field("id", PhysicalType::UInt64)
            .qualified("trucks");
        assert!(!left.union_compatible(&mismatched));
    }

    #[test]
    fn row_size_sums_field_widths() {
        assert_eq!(vehicle_schema().size_in_bytes(), 16);
        assert_eq!(PhysicalType::Char(10).size_in_bytes(), 10);
    }
}
