// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Algebraic query signatures.
//!
//! A signature is a logical formula over a free column space plus a column map from output
//! columns to defining terms. Signatures are computed bottom-up per operator; column
//! references in predicates and assignments are substituted through the child's column map,
//! so two plans that compute the same thing through different operator orders arrive at the
//! same terms.

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::plan::expr::{ArithmeticOp, CompareOp, Expression};
use crate::plan::operator::{
    AggregationKind, JoinDefinition, LogicalOperator, TimeCharacteristic, WindowDefinition,
    WindowDescriptor,
};
use crate::plan::value::Value;
use crate::plan::{LogicalPlan, OperatorId};
use crate::ErrorKind;

/// A term in the solver vocabulary: typed free variables (columns), constants, linear
/// arithmetic, and uninterpreted function applications.
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    Column(String),
    Literal(Value),
    /// An interned name, e.g. a source or an aggregation kind.
    Symbol(String),
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Term>,
        right: Box<Term>,
    },
    /// Uninterpreted function application; equal only to a structurally equal application.
    Apply { function: String, args: Vec<Term> },
}

impl Term {
    pub fn apply(function: impl Into<String>, args: Vec<Term>) -> Self {
        Term::Apply {
            function: function.into(),
            args,
        }
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Term::Column(name) => write!(f, "{name}"),
            Term::Literal(value) => write!(f, "{value}"),
            Term::Symbol(name) => write!(f, "'{name}"),
            Term::Arithmetic { op, left, right } => write!(f, "({left} {op} {right})"),
            Term::Apply { function, args } => {
                write!(f, "{function}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A formula in the solver vocabulary.
#[derive(Clone, Debug, PartialEq)]
pub enum Formula {
    True,
    /// Uninterpreted predicate, e.g. `source('cars)` or a window descriptor.
    Atom { predicate: String, args: Vec<Term> },
    Compare {
        op: CompareOp,
        left: Term,
        right: Term,
    },
    And(Vec<Formula>),
    Or(Vec<Formula>),
    Not(Box<Formula>),
}

impl Formula {
    pub fn atom(predicate: impl Into<String>, args: Vec<Term>) -> Self {
        Formula::Atom {
            predicate: predicate.into(),
            args,
        }
    }

    /// Conjunction that flattens nested conjunctions and drops `true`.
    pub fn and(parts: Vec<Formula>) -> Self {
        let mut flat = Vec::new();
        for part in parts {
            match part {
                Formula::True => {}
                Formula::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Formula::True,
            1 => flat.into_iter().next().expect("one element"),
            _ => Formula::And(flat),
        }
    }

    /// The conjuncts of this formula (itself, when not a conjunction).
    pub fn conjuncts(&self) -> &[Formula] {
        match self {
            Formula::And(parts) => parts,
            other => std::slice::from_ref(other),
        }
    }
}

impl Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Formula::True => write!(f, "true"),
            Formula::Atom { predicate, args } => {
                write!(f, "{predicate}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Formula::Compare { op, left, right } => write!(f, "({left} {op} {right})"),
            Formula::And(parts) => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " && ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
            Formula::Or(parts) => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " || ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
            Formula::Not(inner) => write!(f, "!{inner}"),
        }
    }
}

/// Signature of one operator's output stream.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySignature {
    /// The condition a tuple satisfies to appear in the stream.
    pub predicate: Formula,
    /// Output column name to defining term.
    pub columns: BTreeMap<String, Term>,
}

impl QuerySignature {
    /// Resolves a column by qualified name, falling back to a unique unqualified match.
    fn resolve_column(&self, name: &str) -> Option<&Term> {
        if let Some(term) = self.columns.get(name) {
            return Some(term);
        }
        let suffix = format!("${name}");
        let mut matches = self
            .columns
            .iter()
            .filter(|(key, _)| key.ends_with(&suffix));
        match (matches.next(), matches.next()) {
            (Some((_, term)), None) => Some(term),
            _ => None,
        }
    }
}

/// Bottom-up signature computation over a logical plan.
///
/// The computation is deterministic: the same plan yields structurally equal signatures.
pub struct SignatureComputation<'a> {
    plan: &'a LogicalPlan,
    signatures: BTreeMap<OperatorId, QuerySignature>,
}

impl<'a> SignatureComputation<'a> {
    /// Computes signatures for every operator of the plan.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn run(plan: &'a LogicalPlan) -> crate::Result<Self> {
        let mut computation = Self {
            plan,
            signatures: BTreeMap::new(),
        };
        for id in plan.topological_order()? {
            let signature = computation.compute(id)?;
            tracing::trace!(operator = %id, predicate = %signature.predicate, "computed signature");
            computation.signatures.insert(id, signature);
        }
        Ok(computation)
    }

    pub fn signature(&self, id: OperatorId) -> crate::Result<&QuerySignature> {
        self.signatures.get(&id).ok_or_else(|| {
            ErrorKind::InternalError.with_message(format!("no signature for operator {id}"))
        })
    }

    /// Signature of the plan as seen by its sink: the sink's (single) child.
    pub fn sink_signature(&self, plan: &LogicalPlan) -> crate::Result<&QuerySignature> {
        let sinks = plan.sink_ids();
        let sink = sinks.first().ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message("plan has no sink operator")
        })?;
        let child = *plan
            .node(*sink)?
            .children
            .first()
            .ok_or_else(|| ErrorKind::InvalidQueryPlan.with_message("sink has no input"))?;
        self.signature(child)
    }

    fn compute(&self, id: OperatorId) -> crate::Result<QuerySignature> {
        let node = self.plan.node(id)?;
        let children: Vec<&QuerySignature> = node
            .children
            .iter()
            .map(|c| self.signature(*c))
            .collect::<crate::Result<_>>()?;
        match &node.operator {
            LogicalOperator::Source { name, schema } => {
                let predicate =
                    Formula::atom("source", vec![Term::Symbol(name.clone())]);
                let columns = schema
                    .fields()
                    .iter()
                    .map(|f| (f.name.clone(), Term::Column(f.name.clone())))
                    .collect();
                Ok(QuerySignature { predicate, columns })
            }
            LogicalOperator::Filter { predicate } => {
                let parent = children[0];
                let condition = translate_predicate(predicate, parent)?;
                Ok(QuerySignature {
                    predicate: Formula::and(vec![parent.predicate.clone(), condition]),
                    columns: parent.columns.clone(),
                })
            }
            LogicalOperator::Projection { fields } => {
                let parent = children[0];
                let mut columns = BTreeMap::new();
                for field in fields {
                    let term = translate_term(&field.expr, parent)?;
                    let name = match (&field.alias, &field.expr) {
                        (Some(alias), _) => alias.clone(),
                        (None, Expression::Column(name)) => resolve_output_name(parent, name)?,
                        (None, _) => {
                            return Err(ErrorKind::SchemaMismatch
                                .with_message("computed projection field requires an alias"))
                        }
                    };
                    columns.insert(name, term);
                }
                Ok(QuerySignature {
                    predicate: parent.predicate.clone(),
                    columns,
                })
            }
            LogicalOperator::Map { field, expr } => {
                let parent = children[0];
                let term = translate_term(expr, parent)?;
                let mut columns = parent.columns.clone();
                let name = resolve_output_name(parent, field).unwrap_or_else(|_| field.clone());
                columns.insert(name, term);
                Ok(QuerySignature {
                    predicate: parent.predicate.clone(),
                    columns,
                })
            }
            LogicalOperator::Union => {
                let (left, right) = (children[0], children[1]);
                // Align columns positionally over the input schemas, not by sorted name.
                let left_schema = &self.plan.node(node.children[0])?.output_schema;
                let right_schema = &self.plan.node(node.children[1])?.output_schema;
                let mut columns = BTreeMap::new();
                for (left_field, right_field) in
                    left_schema.fields().iter().zip(right_schema.fields())
                {
                    let left_term = left.columns.get(&left_field.name).cloned();
                    let right_term = right.columns.get(&right_field.name).cloned();
                    let term = match (left_term, right_term) {
                        (Some(l), Some(r)) if l == r => l,
                        (Some(l), Some(r)) => Term::apply("union", vec![l, r]),
                        _ => Term::Column(left_field.name.clone()),
                    };
                    columns.insert(left_field.name.clone(), term);
                }
                Ok(QuerySignature {
                    predicate: Formula::Or(vec![
                        left.predicate.clone(),
                        right.predicate.clone(),
                    ]),
                    columns,
                })
            }
            LogicalOperator::Join(definition) => self.join_signature(definition, &children),
            LogicalOperator::Window(definition) => {
                self.window_signature(definition, children[0], &node.output_schema)
            }
            LogicalOperator::WatermarkAssigner(_) | LogicalOperator::Sink(_) => {
                Ok(children[0].clone())
            }
        }
    }

    fn join_signature(
        &self,
        definition: &JoinDefinition,
        children: &[&QuerySignature],
    ) -> crate::Result<QuerySignature> {
        let (left, right) = (children[0], children[1]);
        let left_key = left.resolve_column(&definition.left_key).ok_or_else(|| {
            ErrorKind::SchemaMismatch
                .with_message(format!("unknown join key: {}", definition.left_key))
        })?;
        let right_key = right.resolve_column(&definition.right_key).ok_or_else(|| {
            ErrorKind::SchemaMismatch
                .with_message(format!("unknown join key: {}", definition.right_key))
        })?;
        let key_equality = Formula::Compare {
            op: CompareOp::Eq,
            left: left_key.clone(),
            right: right_key.clone(),
        };
        let mut columns = left.columns.clone();
        for (name, term) in &right.columns {
            columns.insert(name.clone(), term.clone());
        }
        let window = window_atom(&definition.window);
        columns.insert(
            "$start".into(),
            Term::apply("window_start", window_terms(&definition.window)),
        );
        columns.insert(
            "$end".into(),
            Term::apply("window_end", window_terms(&definition.window)),
        );
        Ok(QuerySignature {
            predicate: Formula::and(vec![
                left.predicate.clone(),
                right.predicate.clone(),
                key_equality,
                window,
            ]),
            columns,
        })
    }

    fn window_signature(
        &self,
        definition: &WindowDefinition,
        parent: &QuerySignature,
        output_schema: &crate::plan::schema::Schema,
    ) -> crate::Result<QuerySignature> {
        let window = window_atom(&definition.descriptor);
        let mut conjuncts = vec![parent.predicate.clone(), window];
        let mut columns = BTreeMap::new();
        // The output schema fixes the qualified names of start/end and the aggregate fields.
        let field_names: Vec<&str> = output_schema
            .fields()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        columns.insert(
            field_names[0].to_string(),
            Term::apply("window_start", window_terms(&definition.descriptor)),
        );
        columns.insert(
            field_names[1].to_string(),
            Term::apply("window_end", window_terms(&definition.descriptor)),
        );
        let mut next_field = 2;
        for key in &definition.keys {
            let term = parent.resolve_column(key).ok_or_else(|| {
                ErrorKind::SchemaMismatch.with_message(format!("unknown key field: {key}"))
            })?;
            columns.insert(field_names[next_field].to_string(), term.clone());
            next_field += 1;
        }
        for aggregation in &definition.aggregations {
            let input = match aggregation.kind {
                AggregationKind::Count => Term::Symbol("*".into()),
                _ => parent
                    .resolve_column(&aggregation.field)
                    .ok_or_else(|| {
                        ErrorKind::SchemaMismatch.with_message(format!(
                            "unknown aggregation field: {}",
                            aggregation.field
                        ))
                    })?
                    .clone(),
            };
            let term = Term::apply(aggregation.kind.to_string(), vec![input.clone()]);
            conjuncts.push(Formula::atom(
                "aggregate",
                vec![Term::Symbol(aggregation.kind.to_string()), input],
            ));
            columns.insert(field_names[next_field].to_string(), term);
            next_field += 1;
        }
        Ok(QuerySignature {
            predicate: Formula::and(conjuncts),
            columns,
        })
    }
}

/// The uninterpreted descriptor atom of a window: shape, size, slide, and time origin.
fn window_atom(descriptor: &WindowDescriptor) -> Formula {
    Formula::atom("window", window_terms(descriptor))
}

fn window_terms(descriptor: &WindowDescriptor) -> Vec<Term> {
    let shape = match descriptor.window_type {
        crate::plan::operator::WindowType::Tumbling { .. } => "tumbling",
        crate::plan::operator::WindowType::Sliding { .. } => "sliding",
    };
    let time = match &descriptor.time {
        TimeCharacteristic::EventTime { field } => format!("event_time:{field}"),
        TimeCharacteristic::IngestionTime => "ingestion_time".to_string(),
    };
    vec![
        Term::Symbol(shape.into()),
        Term::Literal(Value::UInt(descriptor.window_type.size_ms())),
        Term::Literal(Value::UInt(descriptor.window_type.slide_ms())),
        Term::Symbol(time),
    ]
}

fn resolve_output_name(signature: &QuerySignature, name: &str) -> crate::Result<String> {
    if signature.columns.contains_key(name) {
        return Ok(name.to_string());
    }
    let suffix = format!("${name}");
    let mut matches = signature.columns.keys().filter(|key| key.ends_with(&suffix));
    match (matches.next(), matches.next()) {
        (Some(key), None) => Ok(key.clone()),
        _ => Err(ErrorKind::SchemaMismatch.with_message(format!("unknown field: {name}"))),
    }
}

/// Translates a scalar expression into a term, substituting column references through the
/// input signature's column map.
fn translate_term(expr: &Expression, input: &QuerySignature) -> crate::Result<Term> {
    match expr {
        Expression::Column(name) => input.resolve_column(name).cloned().ok_or_else(|| {
            ErrorKind::SchemaMismatch.with_message(format!("unknown field: {name}"))
        }),
        Expression::Literal(value) => Ok(Term::Literal(value.clone())),
        Expression::Arithmetic { op, left, right } => Ok(Term::Arithmetic {
            op: *op,
            left: Box::new(translate_term(left, input)?),
            right: Box::new(translate_term(right, input)?),
        }),
        Expression::Compare { .. }
        | Expression::And(..)
        | Expression::Or(..)
        | Expression::Not(..) => Err(ErrorKind::SchemaMismatch
            .with_message("boolean expression where a scalar term was expected")),
    }
}

/// Translates a boolean expression into a formula over the input signature's column space.
fn translate_predicate(expr: &Expression, input: &QuerySignature) -> crate::Result<Formula> {
    match expr {
        Expression::Compare { op, left, right } => Ok(Formula::Compare {
            op: *op,
            left: translate_term(left, input)?,
            right: translate_term(right, input)?,
        }),
        Expression::And(left, right) => Ok(Formula::and(vec![
            translate_predicate(left, input)?,
            translate_predicate(right, input)?,
        ])),
        Expression::Or(left, right) => Ok(Formula::Or(vec![
            translate_predicate(left, input)?,
            translate_predicate(right, input)?,
        ])),
        Expression::Not(inner) => Ok(Formula::Not(Box::new(translate_predicate(inner, input)?))),
        Expression::Literal(Value::Bool(true)) => Ok(Formula::True),
        Expression::Literal(Value::Bool(false)) => {
            Ok(Formula::Not(Box::new(Formula::True)))
        }
        Expression::Column(_) | Expression::Literal(_) | Expression::Arithmetic { .. } => {
            Err(ErrorKind::SchemaMismatch
                .with_message("scalar expression where a predicate was expected"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::expr::{col, lit};
    use crate::plan::operator::SinkDescriptor;
    use crate::plan::schema::{PhysicalType, Schema};
    use crate::plan::Query;
    use pretty_assertions::assert_eq;

    fn car_schema() -> Schema {
        Schema::new()
            .with_field("id", PhysicalType::UInt64)
            .with_field("value", PhysicalType::UInt64)
    }

    fn signature_of(plan: &LogicalPlan) -> QuerySignature {
        SignatureComputation::run(plan)
            .expect("signatures")
            .sink_signature(plan)
            .expect("sink signature")
            .clone()
    }

    #[test]
    fn signatures_are_stable() -> crate::Result<()> {
        let plan = Query::from_source("car", car_schema())
            .map("value", lit(40u64))
            .filter(col("id").lt(lit(45u64)))
            .sink(SinkDescriptor::Collect)?;
        assert_eq!(signature_of(&plan), signature_of(&plan));
        Ok(())
    }

    #[test]
    fn map_assignments_substitute_into_filters() -> crate::Result<()> {
        // filter(value < 45) after map(value := 40) constrains the constant, not the column
        let plan = Query::from_source("car", car_schema())
            .map("value", lit(40u64))
            .filter(col("value").lt(lit(45u64)))
            .sink(SinkDescriptor::Collect)?;
        let signature = signature_of(&plan);
        let expected = Formula::Compare {
            op: CompareOp::Lt,
            left: Term::Literal(Value::UInt(40)),
            right: Term::Literal(Value::UInt(45)),
        };
        assert!(signature.predicate.conjuncts().contains(&expected));
        assert_eq!(signature.columns["car$value"], Term::Literal(Value::UInt(40)));
        Ok(())
    }

    #[test]
    fn repeated_identical_filters_collapse_to_equal_signatures() -> crate::Result<()> {
        let once = Query::from_source("car", car_schema())
            .filter(col("id").lt(lit(45u64)))
            .sink(SinkDescriptor::Collect)?;
        let twice = Query::from_source("car", car_schema())
            .filter(col("id").lt(lit(45u64)))
            .filter(col("id").lt(lit(45u64)))
            .sink(SinkDescriptor::Collect)?;
        // Not structurally equal (the duplicate conjunct survives), but the containment
        // checker reports equality; here we only pin the shared prefix.
        let once_sig = signature_of(&once);
        let twice_sig = signature_of(&twice);
        assert_eq!(once_sig.columns, twice_sig.columns);
        assert!(twice_sig
            .predicate
            .conjuncts()
            .iter()
            .all(|c| once_sig.predicate.conjuncts().contains(c)));
        Ok(())
    }

    #[test]
    fn window_descriptors_are_uninterpreted_atoms() -> crate::Result<()> {
        let schema = Schema::new()
            .with_field("k", PhysicalType::UInt64)
            .with_field("v", PhysicalType::UInt64)
            .with_field("ts", PhysicalType::UInt64);
        let plan = Query::from_source("car", schema)
            .window(
                crate::plan::operator::WindowDescriptor::tumbling(
                    1000,
                    crate::plan::operator::TimeCharacteristic::EventTime { field: "ts".into() },
                ),
                vec!["k".into()],
                vec![crate::plan::operator::WindowAggregation::new(
                    AggregationKind::Sum,
                    "v",
                    "sum_v",
                )],
            )
            .sink(SinkDescriptor::Collect)?;
        let signature = signature_of(&plan);
        assert!(signature
            .predicate
            .conjuncts()
            .iter()
            .any(|c| matches!(c, Formula::Atom { predicate, .. } if predicate == "window")));
        assert_eq!(
            signature.columns["car$sum_v"],
            Term::apply("sum", vec![Term::Column("car$v".into())])
        );
        Ok(())
    }
}
