// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The logical plan model.
//!
//! A plan is an arena of operator nodes addressed by stable [`OperatorId`]s; edges are id
//! pairs held on the nodes. `children` point upstream (toward sources), `parents` point
//! downstream (toward sinks). Back-references are ids, never owning, so merged plans can
//! share arbitrary DAG shapes without reference cycles.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::plan::operator::{LogicalOperator, TimeCharacteristic};
use crate::plan::schema::{PhysicalType, Schema, QUALIFIER_SEPARATOR};
use crate::ErrorKind;

pub mod builder;
pub mod expr;
pub mod operator;
pub mod schema;
pub mod value;

pub use builder::Query;

/// Stable operator identifier, unique within the process.
///
/// Ids are process-unique rather than plan-unique so that merging plans into a shared query
/// plan never has to renumber operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperatorId(u64);

static NEXT_OPERATOR_ID: AtomicU64 = AtomicU64::new(1);

impl OperatorId {
    pub fn next() -> Self {
        Self(NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for OperatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct OperatorNode {
    pub id: OperatorId,
    pub operator: LogicalOperator,
    /// Upstream operators feeding this one.
    pub children: Vec<OperatorId>,
    /// Downstream consumers.
    pub parents: Vec<OperatorId>,
    /// Filled in by [`LogicalPlan::infer_schemas`]; empty before inference.
    pub output_schema: Schema,
}

#[derive(Clone, Debug, Default)]
pub struct LogicalPlan {
    nodes: BTreeMap<OperatorId, OperatorNode>,
}

impl LogicalPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operator fed by `children` and returns its id.
    pub fn add_operator(
        &mut self,
        operator: LogicalOperator,
        children: &[OperatorId],
    ) -> OperatorId {
        let id = OperatorId::next();
        self.nodes.insert(
            id,
            OperatorNode {
                id,
                operator,
                children: children.to_vec(),
                parents: Vec::new(),
                output_schema: Schema::new(),
            },
        );
        for child in children {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parents.push(id);
            }
        }
        id
    }

    pub fn node(&self, id: OperatorId) -> crate::Result<&OperatorNode> {
        self.nodes.get(&id).ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("unknown operator {id}"))
        })
    }

    pub fn node_mut(&mut self, id: OperatorId) -> crate::Result<&mut OperatorNode> {
        self.nodes.get_mut(&id).ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("unknown operator {id}"))
        })
    }

    pub fn contains(&self, id: OperatorId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn operators(&self) -> impl Iterator<Item = &OperatorNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn source_ids(&self) -> Vec<OperatorId> {
        self.nodes
            .values()
            .filter(|n| n.operator.is_source())
            .map(|n| n.id)
            .collect()
    }

    pub fn sink_ids(&self) -> Vec<OperatorId> {
        self.nodes
            .values()
            .filter(|n| n.operator.is_sink())
            .map(|n| n.id)
            .collect()
    }

    /// Names of all sources consumed by this plan.
    pub fn consumed_sources(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter_map(|n| match &n.operator {
                LogicalOperator::Source { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Adds an edge making `child` feed `parent`.
    pub fn connect(&mut self, parent: OperatorId, child: OperatorId) -> crate::Result<()> {
        self.node_mut(child)?.parents.push(parent);
        self.node_mut(parent)?.children.push(child);
        Ok(())
    }

    /// Removes the edge between `parent` and `child`.
    pub fn disconnect(&mut self, parent: OperatorId, child: OperatorId) -> crate::Result<()> {
        self.node_mut(child)?.parents.retain(|p| *p != parent);
        self.node_mut(parent)?.children.retain(|c| *c != child);
        Ok(())
    }

    /// Removes an operator and all edges touching it.
    pub fn remove_operator(&mut self, id: OperatorId) -> crate::Result<OperatorNode> {
        let node = self.nodes.remove(&id).ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("unknown operator {id}"))
        })?;
        for other in self.nodes.values_mut() {
            other.children.retain(|c| *c != id);
            other.parents.retain(|p| *p != id);
        }
        Ok(node)
    }

    /// Children-first topological order; fails on cycles.
    pub fn topological_order(&self) -> crate::Result<Vec<OperatorId>> {
        let mut remaining_children: BTreeMap<OperatorId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.children.len()))
            .collect();
        let mut ready: Vec<OperatorId> = remaining_children
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            for parent in &self.nodes[&id].parents {
                let count = remaining_children.get_mut(parent).ok_or_else(|| {
                    ErrorKind::InvalidQueryPlan
                        .with_message(format!("edge to operator {parent} outside the plan"))
                })?;
                *count -= 1;
                if *count == 0 {
                    ready.push(*parent);
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(ErrorKind::InvalidQueryPlan.with_message("plan contains a cycle"));
        }
        Ok(order)
    }

    /// Checks the structural invariants: acyclic, every non-source has an input, every
    /// non-sink has a consumer, and all edges resolve.
    pub fn validate(&self) -> crate::Result<()> {
        for node in self.nodes.values() {
            for edge in node.children.iter().chain(node.parents.iter()) {
                if !self.nodes.contains_key(edge) {
                    return Err(ErrorKind::InvalidQueryPlan.with_message(format!(
                        "operator {} references {edge}, which is not in the plan",
                        node.id
                    )));
                }
            }
            if !node.operator.is_source() && node.children.is_empty() {
                return Err(ErrorKind::InvalidQueryPlan.with_message(format!(
                    "{} operator {} has no input",
                    node.operator.kind(),
                    node.id
                )));
            }
            if !node.operator.is_sink() && node.parents.is_empty() {
                return Err(ErrorKind::InvalidQueryPlan.with_message(format!(
                    "{} operator {} has no consumer",
                    node.operator.kind(),
                    node.id
                )));
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Infers output schemas bottom-up. Fails with `SchemaMismatch` on type errors.
    pub fn infer_schemas(&mut self) -> crate::Result<()> {
        for id in self.topological_order()? {
            let node = &self.nodes[&id];
            let child_schemas: Vec<Schema> = node
                .children
                .iter()
                .map(|c| self.nodes[c].output_schema.clone())
                .collect();
            let schema = infer_operator_schema(&node.operator, &child_schemas)?;
            self.nodes.get_mut(&id).expect("node exists").output_schema = schema;
        }
        Ok(())
    }

    /// Copies every operator strictly downstream of `anchor_in_other` into this plan,
    /// re-attaching the boundary operators to `anchor_in_self`.
    ///
    /// Operator ids are process-unique, so adopted nodes keep their ids. Fails when the
    /// adopted region has an input edge that is neither the anchor nor part of the region,
    /// since such a shape cannot be grafted onto a single anchor.
    pub fn adopt_downstream(
        &mut self,
        other: &LogicalPlan,
        anchor_in_other: OperatorId,
        anchor_in_self: OperatorId,
    ) -> crate::Result<Vec<OperatorId>> {
        let mut region = Vec::new();
        let mut frontier = vec![anchor_in_other];
        while let Some(id) = frontier.pop() {
            for parent in &other.node(id)?.parents {
                if !region.contains(parent) {
                    region.push(*parent);
                    frontier.push(*parent);
                }
            }
        }
        // Validate the whole region before touching this plan, so a rejected graft
        // leaves it unchanged.
        for id in &region {
            for child in &other.node(*id)?.children {
                if *child != anchor_in_other && !region.contains(child) {
                    return Err(ErrorKind::InvalidQueryPlan.with_message(format!(
                        "operator {id} draws from {child}, outside the adopted region"
                    )));
                }
            }
        }
        for id in &region {
            let node = other.node(*id)?;
            let mut adopted = node.clone();
            adopted.children = node
                .children
                .iter()
                .map(|c| {
                    if *c == anchor_in_other {
                        anchor_in_self
                    } else {
                        *c
                    }
                })
                .collect();
            adopted.parents.retain(|p| region.contains(p));
            self.nodes.insert(adopted.id, adopted);
        }
        for id in &region {
            let attaches_to_anchor = other.node(*id)?.children.contains(&anchor_in_other);
            if attaches_to_anchor {
                self.nodes
                    .get_mut(&anchor_in_self)
                    .ok_or_else(|| {
                        ErrorKind::InvalidQueryPlan
                            .with_message(format!("unknown anchor {anchor_in_self}"))
                    })?
                    .parents
                    .push(*id);
            }
        }
        Ok(region)
    }
}

impl Display for LogicalPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for node in self.nodes.values() {
            writeln!(
                f,
                "{} {} <- {:?}",
                node.id,
                node.operator.kind(),
                node.children.iter().map(|c| c.as_u64()).collect::<Vec<_>>()
            )?;
        }
        Ok(())
    }
}

/// The qualifier shared by all fields of a schema, or empty when mixed.
fn dominant_qualifier(schema: &Schema) -> String {
    let mut qualifier: Option<&str> = None;
    for field in schema.fields() {
        let Some((prefix, _)) = field.name.rsplit_once(QUALIFIER_SEPARATOR) else {
            return String::new();
        };
        match qualifier {
            None => qualifier = Some(prefix),
            Some(existing) if existing == prefix => {}
            Some(_) => return String::new(),
        }
    }
    qualifier.unwrap_or_default().to_string()
}

fn qualify_with(qualifier: &str, name: &str) -> String {
    if qualifier.is_empty() || name.contains(QUALIFIER_SEPARATOR) {
        name.to_string()
    } else {
        format!("{qualifier}{QUALIFIER_SEPARATOR}{name}")
    }
}

/// Result type of one aggregate, widened to the 64-bit representative of its input class.
fn aggregation_output_type(
    kind: crate::plan::operator::AggregationKind,
    input: PhysicalType,
) -> crate::Result<PhysicalType> {
    use crate::plan::operator::AggregationKind;
    if kind != AggregationKind::Count && !input.is_numeric() {
        return Err(
            ErrorKind::SchemaMismatch.with_message(format!("cannot aggregate over {input}"))
        );
    }
    Ok(match kind {
        AggregationKind::Count => PhysicalType::UInt64,
        AggregationKind::Avg => PhysicalType::Float64,
        AggregationKind::Sum | AggregationKind::Min | AggregationKind::Max => {
            if input.is_float() {
                PhysicalType::Float64
            } else if input.is_signed_integer() {
                PhysicalType::Int64
            } else {
                PhysicalType::UInt64
            }
        }
    })
}

fn infer_operator_schema(
    operator: &LogicalOperator,
    children: &[Schema],
) -> crate::Result<Schema> {
    let single_child = || -> crate::Result<&Schema> {
        children.first().ok_or_else(|| {
            ErrorKind::InvalidQueryPlan
                .with_message(format!("{} operator has no input", operator.kind()))
        })
    };
    match operator {
        LogicalOperator::Source { schema, .. } => Ok(schema.clone()),
        LogicalOperator::Filter { predicate } => {
            let schema = single_child()?;
            if predicate.data_type(schema)? != PhysicalType::Bool {
                return Err(
                    ErrorKind::SchemaMismatch.with_message("filter predicate is not BOOL")
                );
            }
            Ok(schema.clone())
        }
        LogicalOperator::Projection { fields } => {
            let input = single_child()?;
            let mut output = Schema::new();
            for field in fields {
                let data_type = field.expr.data_type(input)?;
                let name = match (&field.alias, &field.expr) {
                    (Some(alias), _) => alias.clone(),
                    (None, crate::plan::expr::Expression::Column(name)) => {
                        match input.field(name) {
                            Some(resolved) => resolved.name.clone(),
                            None => {
                                return Err(ErrorKind::SchemaMismatch
                                    .with_message(format!("unknown field: {name}")))
                            }
                        }
                    }
                    (None, _) => {
                        return Err(ErrorKind::SchemaMismatch
                            .with_message("computed projection field requires an alias"))
                    }
                };
                output = output.with_field(name, data_type);
            }
            Ok(output)
        }
        LogicalOperator::Map { field, expr } => {
            let input = single_child()?;
            let data_type = expr.data_type(input)?;
            let mut output = Schema::new();
            let mut replaced = false;
            let target_index = input.index_of(field);
            for (index, existing) in input.fields().iter().enumerate() {
                if Some(index) == target_index {
                    output = output.with_field(existing.name.clone(), data_type);
                    replaced = true;
                } else {
                    output = output.with_field(existing.name.clone(), existing.data_type);
                }
            }
            if !replaced {
                let name = qualify_with(&dominant_qualifier(input), field);
                output = output.with_field(name, data_type);
            }
            Ok(output)
        }
        LogicalOperator::Union => {
            if children.len() != 2 {
                return Err(ErrorKind::InvalidQueryPlan.with_message("union requires two inputs"));
            }
            if !children[0].union_compatible(&children[1]) {
                return Err(ErrorKind::SchemaMismatch.with_message(format!(
                    "union over incompatible schemas {} and {}",
                    children[0], children[1]
                )));
            }
            Ok(children[0].clone())
        }
        LogicalOperator::Join(definition) => {
            if children.len() != 2 {
                return Err(ErrorKind::InvalidQueryPlan.with_message("join requires two inputs"));
            }
            let (left, right) = (&children[0], &children[1]);
            let key_type = left.field_type(&definition.left_key)?;
            let right_key_type = right.field_type(&definition.right_key)?;
            if key_type != right_key_type {
                return Err(ErrorKind::SchemaMismatch.with_message(format!(
                    "join keys disagree: {key_type} vs {right_key_type}"
                )));
            }
            let qualifier = dominant_qualifier(left);
            let mut output = Schema::new()
                .with_field(qualify_with(&qualifier, "start"), PhysicalType::UInt64)
                .with_field(qualify_with(&qualifier, "end"), PhysicalType::UInt64);
            let key_name = left
                .field(&definition.left_key)
                .expect("key resolved above")
                .name
                .clone();
            output = output.with_field(key_name, key_type);
            for (schema, key) in [(left, &definition.left_key), (right, &definition.right_key)] {
                let key_index = schema.index_of(key);
                let ts_index = match &definition.window.time {
                    TimeCharacteristic::EventTime { field } => schema.index_of(field),
                    TimeCharacteristic::IngestionTime => None,
                };
                for (index, field) in schema.fields().iter().enumerate() {
                    if Some(index) == key_index || Some(index) == ts_index {
                        continue;
                    }
                    output = output.with_field(field.name.clone(), field.data_type);
                }
            }
            Ok(output)
        }
        LogicalOperator::Window(definition) => {
            let input = single_child()?;
            let qualifier = dominant_qualifier(input);
            let mut output = Schema::new()
                .with_field(qualify_with(&qualifier, "start"), PhysicalType::UInt64)
                .with_field(qualify_with(&qualifier, "end"), PhysicalType::UInt64);
            for key in &definition.keys {
                let field = input.field(key).ok_or_else(|| {
                    ErrorKind::SchemaMismatch.with_message(format!("unknown key field: {key}"))
                })?;
                output = output.with_field(field.name.clone(), field.data_type);
            }
            for aggregation in &definition.aggregations {
                let input_type = match aggregation.kind {
                    crate::plan::operator::AggregationKind::Count => PhysicalType::UInt64,
                    _ => input.field_type(&aggregation.field)?,
                };
                output = output.with_field(
                    qualify_with(&qualifier, &aggregation.output_name),
                    aggregation_output_type(aggregation.kind, input_type)?,
                );
            }
            Ok(output)
        }
        LogicalOperator::WatermarkAssigner(strategy) => {
            let schema = single_child()?;
            if let crate::plan::operator::WatermarkStrategy::EventTime { field, .. } = strategy {
                schema.field_type(field)?;
            }
            Ok(schema.clone())
        }
        LogicalOperator::Sink(_) => Ok(single_child()?.clone()),
    }
}
