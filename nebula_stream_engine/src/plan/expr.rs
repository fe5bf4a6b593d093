// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scalar expressions over tuple fields.
//!
//! Expressions are built with the [`col`]/[`lit`] helpers and combinators, evaluated by the
//! interpreted data plane, and translated into the solver vocabulary by the signature phase.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Display;

use crate::plan::schema::{PhysicalType, Schema};
use crate::plan::value::Value;
use crate::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl Display for ArithmeticOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ArithmeticOp::Add => write!(f, "+"),
            ArithmeticOp::Sub => write!(f, "-"),
            ArithmeticOp::Mul => write!(f, "*"),
            ArithmeticOp::Div => write!(f, "/"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    LtEq,
    Eq,
    NotEq,
    GtEq,
    Gt,
}

impl CompareOp {
    pub fn matches(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::GtEq => ordering != Ordering::Less,
            CompareOp::Gt => ordering == Ordering::Greater,
        }
    }

    /// The comparison that holds when the operand order is flipped.
    pub fn flipped(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::NotEq => CompareOp::NotEq,
            CompareOp::GtEq => CompareOp::LtEq,
            CompareOp::Gt => CompareOp::Lt,
        }
    }
}

impl Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CompareOp::Lt => write!(f, "<"),
            CompareOp::LtEq => write!(f, "<="),
            CompareOp::Eq => write!(f, "=="),
            CompareOp::NotEq => write!(f, "!="),
            CompareOp::GtEq => write!(f, ">="),
            CompareOp::Gt => write!(f, ">"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    Column(String),
    Literal(Value),
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

/// References the named tuple field.
pub fn col(name: impl Into<String>) -> Expression {
    Expression::Column(name.into())
}

/// A literal constant.
pub fn lit(value: impl Into<Value>) -> Expression {
    Expression::Literal(value.into())
}

macro_rules! binary_combinator {
    ($name:ident, $variant:ident, $op:expr) => {
        pub fn $name(self, other: Expression) -> Expression {
            Expression::$variant {
                op: $op,
                left: Box::new(self),
                right: Box::new(other),
            }
        }
    };
}

impl Expression {
    binary_combinator!(add, Arithmetic, ArithmeticOp::Add);
    binary_combinator!(sub, Arithmetic, ArithmeticOp::Sub);
    binary_combinator!(mul, Arithmetic, ArithmeticOp::Mul);
    binary_combinator!(div, Arithmetic, ArithmeticOp::Div);
    binary_combinator!(lt, Compare, CompareOp::Lt);
    binary_combinator!(lt_eq, Compare, CompareOp::LtEq);
    binary_combinator!(equals, Compare, CompareOp::Eq);
    binary_combinator!(not_equals, Compare, CompareOp::NotEq);
    binary_combinator!(gt_eq, Compare, CompareOp::GtEq);
    binary_combinator!(gt, Compare, CompareOp::Gt);

    pub fn and(self, other: Expression) -> Expression {
        Expression::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expression) -> Expression {
        Expression::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expression {
        Expression::Not(Box::new(self))
    }

    /// All field names referenced anywhere in this expression.
    pub fn referenced_columns(&self) -> BTreeSet<String> {
        let mut columns = BTreeSet::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns(&self, into: &mut BTreeSet<String>) {
        match self {
            Expression::Column(name) => {
                into.insert(name.clone());
            }
            Expression::Literal(_) => {}
            Expression::Arithmetic { left, right, .. }
            | Expression::Compare { left, right, .. } => {
                left.collect_columns(into);
                right.collect_columns(into);
            }
            Expression::And(left, right) | Expression::Or(left, right) => {
                left.collect_columns(into);
                right.collect_columns(into);
            }
            Expression::Not(inner) => inner.collect_columns(into),
        }
    }

    /// Infers the result type against the given input schema.
    pub fn data_type(&self, schema: &Schema) -> crate::Result<PhysicalType> {
        match self {
            Expression::Column(name) => schema.field_type(name),
            Expression::Literal(value) => Ok(value.data_type_class()),
            Expression::Arithmetic { left, right, .. } => {
                let lt = left.data_type(schema)?;
                let rt = right.data_type(schema)?;
                if !lt.is_numeric() || !rt.is_numeric() {
                    return Err(ErrorKind::SchemaMismatch
                        .with_message(format!("arithmetic over {lt} and {rt}")));
                }
                // Widen within the numeric tower: float wins, then signedness of the left side.
                if lt.is_float() || rt.is_float() {
                    Ok(PhysicalType::Float64)
                } else if lt.is_signed_integer() || rt.is_signed_integer() {
                    Ok(PhysicalType::Int64)
                } else {
                    Ok(PhysicalType::UInt64)
                }
            }
            Expression::Compare { left, right, .. } => {
                let lt = left.data_type(schema)?;
                let rt = right.data_type(schema)?;
                let comparable = (lt.is_numeric() && rt.is_numeric()) || lt == rt;
                if !comparable {
                    return Err(ErrorKind::SchemaMismatch
                        .with_message(format!("comparison over {lt} and {rt}")));
                }
                Ok(PhysicalType::Bool)
            }
            Expression::And(left, right) | Expression::Or(left, right) => {
                for side in [left, right] {
                    if side.data_type(schema)? != PhysicalType::Bool {
                        return Err(ErrorKind::SchemaMismatch
                            .with_message("boolean connective over non-BOOL operand"));
                    }
                }
                Ok(PhysicalType::Bool)
            }
            Expression::Not(inner) => {
                if inner.data_type(schema)? != PhysicalType::Bool {
                    return Err(
                        ErrorKind::SchemaMismatch.with_message("negation of non-BOOL operand")
                    );
                }
                Ok(PhysicalType::Bool)
            }
        }
    }

    /// Evaluates this expression against one row.
    ///
    /// The row is positional over `schema`; field references resolve through the schema's
    /// qualified/unqualified lookup.
    pub fn evaluate(&self, schema: &Schema, row: &[Value]) -> crate::Result<Value> {
        match self {
            Expression::Column(name) => {
                let index = schema.index_of(name).ok_or_else(|| {
                    ErrorKind::SchemaMismatch.with_message(format!("unknown field: {name}"))
                })?;
                Ok(row[index].clone())
            }
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Arithmetic { op, left, right } => {
                let lhs = left.evaluate(schema, row)?;
                let rhs = right.evaluate(schema, row)?;
                evaluate_arithmetic(*op, &lhs, &rhs)
            }
            Expression::Compare { op, left, right } => {
                let lhs = left.evaluate(schema, row)?;
                let rhs = right.evaluate(schema, row)?;
                Ok(Value::Bool(op.matches(lhs.compare(&rhs)?)))
            }
            Expression::And(left, right) => {
                // No short-circuit: both sides must be well-typed for every row.
                let lhs = left.evaluate(schema, row)?.as_bool()?;
                let rhs = right.evaluate(schema, row)?.as_bool()?;
                Ok(Value::Bool(lhs && rhs))
            }
            Expression::Or(left, right) => {
                let lhs = left.evaluate(schema, row)?.as_bool()?;
                let rhs = right.evaluate(schema, row)?.as_bool()?;
                Ok(Value::Bool(lhs || rhs))
            }
            Expression::Not(inner) => {
                Ok(Value::Bool(!inner.evaluate(schema, row)?.as_bool()?))
            }
        }
    }
}

fn evaluate_arithmetic(op: ArithmeticOp, lhs: &Value, rhs: &Value) -> crate::Result<Value> {
    match (lhs, rhs) {
        (Value::UInt(a), Value::UInt(b)) => {
            let result = match op {
                ArithmeticOp::Add => a.wrapping_add(*b),
                ArithmeticOp::Sub => a.wrapping_sub(*b),
                ArithmeticOp::Mul => a.wrapping_mul(*b),
                ArithmeticOp::Div => a.checked_div(*b).ok_or_else(division_by_zero)?,
            };
            Ok(Value::UInt(result))
        }
        (Value::Int(_), Value::Int(_))
        | (Value::Int(_), Value::UInt(_))
        | (Value::UInt(_), Value::Int(_)) => {
            let a = as_i64(lhs)?;
            let b = as_i64(rhs)?;
            let result = match op {
                ArithmeticOp::Add => a.wrapping_add(b),
                ArithmeticOp::Sub => a.wrapping_sub(b),
                ArithmeticOp::Mul => a.wrapping_mul(b),
                ArithmeticOp::Div => a.checked_div(b).ok_or_else(division_by_zero)?,
            };
            Ok(Value::Int(result))
        }
        _ => {
            let a = lhs.as_f64()?;
            let b = rhs.as_f64()?;
            let result = match op {
                ArithmeticOp::Add => a + b,
                ArithmeticOp::Sub => a - b,
                ArithmeticOp::Mul => a * b,
                ArithmeticOp::Div => a / b,
            };
            Ok(Value::Float(result))
        }
    }
}

fn as_i64(value: &Value) -> crate::Result<i64> {
    match value {
        Value::Int(v) => Ok(*v),
        Value::UInt(v) if *v <= i64::MAX as u64 => Ok(*v as i64),
        _ => Err(ErrorKind::SchemaMismatch.with_message("integer out of range")),
    }
}

fn division_by_zero() -> crate::Error {
    ErrorKind::SchemaMismatch.with_message("division by zero")
}

impl Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Expression::Column(name) => write!(f, "{name}"),
            Expression::Literal(value) => write!(f, "{value}"),
            Expression::Arithmetic { op, left, right } => write!(f, "({left} {op} {right})"),
            Expression::Compare { op, left, right } => write!(f, "({left} {op} {right})"),
            Expression::And(left, right) => write!(f, "({left} && {right})"),
            Expression::Or(left, right) => write!(f, "({left} || {right})"),
            Expression::Not(inner) => write!(f, "!({inner})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::new()
            .with_field("id", PhysicalType::UInt64)
            .with_field("speed", PhysicalType::Float64)
            .qualified("cars")
    }

    #[test]
    fn filter_predicate_evaluates_per_row() -> crate::Result<()> {
        let schema = schema();
        let predicate = col("id").lt(lit(5u64)).and(col("speed").gt_eq(lit(10.0)));

        let row = vec![Value::UInt(3), Value::Float(12.0)];
        assert_eq!(predicate.evaluate(&schema, &row)?, Value::Bool(true));

        let row = vec![Value::UInt(7), Value::Float(12.0)];
        assert_eq!(predicate.evaluate(&schema, &row)?, Value::Bool(false));
        Ok(())
    }

    #[test]
    fn arithmetic_widens_to_float() -> crate::Result<()> {
        let schema = schema();
        let expr = col("id").add(lit(0.5));
        assert_eq!(expr.data_type(&schema)?, PhysicalType::Float64);
        let value = expr.evaluate(&schema, &[Value::UInt(2), Value::Float(0.0)])?;
        assert_eq!(value, Value::Float(2.5));
        Ok(())
    }

    #[test]
    fn type_errors_surface_as_schema_mismatch() {
        let schema = schema();
        let expr = col("id").and(col("speed"));
        let err = expr.data_type(&schema).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SchemaMismatch);
    }

    #[test]
    fn referenced_columns_are_collected_once() {
        let expr = col("cars$id")
            .lt(lit(5u64))
            .and(col("cars$id").gt(lit(1u64)));
        let columns = expr.referenced_columns();
        assert_eq!(columns.len(), 1);
        assert!(columns.contains("cars$id"));
    }
}
