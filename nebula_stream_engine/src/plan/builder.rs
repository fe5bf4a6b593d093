// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fluent construction of logical plans.
//!
//! Queries read the way they are written in client code: start from a source, chain
//! operators, finish with a sink. The finished plan is validated and type-inferred.

use crate::plan::expr::Expression;
use crate::plan::operator::{
    JoinDefinition, JoinVariant, LogicalOperator, ProjectionField, SinkDescriptor,
    WatermarkStrategy, WindowAggregation, WindowDefinition, WindowDescriptor,
};
use crate::plan::schema::Schema;
use crate::plan::{LogicalPlan, OperatorId};

/// A query under construction: a plan plus the operator new stages attach to.
#[derive(Clone, Debug)]
pub struct Query {
    plan: LogicalPlan,
    head: OperatorId,
}

impl Query {
    /// Starts a query from a named source with the given (unqualified) schema.
    ///
    /// The schema is qualified with the source name, mirroring how the source catalog
    /// qualifies registered streams.
    pub fn from_source(name: impl Into<String>, schema: Schema) -> Self {
        let name = name.into();
        let mut plan = LogicalPlan::new();
        let head = plan.add_operator(
            LogicalOperator::Source {
                schema: schema.qualified(&name),
                name,
            },
            &[],
        );
        Self { plan, head }
    }

    pub fn filter(mut self, predicate: Expression) -> Self {
        self.head = self
            .plan
            .add_operator(LogicalOperator::Filter { predicate }, &[self.head]);
        self
    }

    pub fn map(mut self, field: impl Into<String>, expr: Expression) -> Self {
        self.head = self.plan.add_operator(
            LogicalOperator::Map {
                field: field.into(),
                expr,
            },
            &[self.head],
        );
        self
    }

    pub fn project(mut self, fields: Vec<ProjectionField>) -> Self {
        self.head = self
            .plan
            .add_operator(LogicalOperator::Projection { fields }, &[self.head]);
        self
    }

    pub fn assign_watermark(mut self, strategy: WatermarkStrategy) -> Self {
        self.head = self
            .plan
            .add_operator(LogicalOperator::WatermarkAssigner(strategy), &[self.head]);
        self
    }

    /// Merges another query stream into this one; schemas must be union compatible.
    pub fn union(mut self, other: Query) -> Self {
        let other_head = self.absorb(other);
        self.head = self
            .plan
            .add_operator(LogicalOperator::Union, &[self.head, other_head]);
        self
    }

    /// Joins this stream (left) with another (right) over a window.
    pub fn join_with(
        mut self,
        other: Query,
        left_key: impl Into<String>,
        right_key: impl Into<String>,
        window: WindowDescriptor,
        variant: JoinVariant,
    ) -> Self {
        let other_head = self.absorb(other);
        self.head = self.plan.add_operator(
            LogicalOperator::Join(JoinDefinition {
                variant,
                left_key: left_key.into(),
                right_key: right_key.into(),
                window,
            }),
            &[self.head, other_head],
        );
        self
    }

    /// Keyed windowed aggregation.
    pub fn window(
        mut self,
        descriptor: WindowDescriptor,
        keys: Vec<String>,
        aggregations: Vec<WindowAggregation>,
    ) -> Self {
        self.head = self.plan.add_operator(
            LogicalOperator::Window(WindowDefinition {
                descriptor,
                keys,
                aggregations,
            }),
            &[self.head],
        );
        self
    }

    /// Terminates the query, validates the plan, and infers all schemas.
    pub fn sink(mut self, descriptor: SinkDescriptor) -> crate::Result<LogicalPlan> {
        self.plan
            .add_operator(LogicalOperator::Sink(descriptor), &[self.head]);
        self.plan.validate()?;
        self.plan.infer_schemas()?;
        Ok(self.plan)
    }

    /// Moves the other query's operators into this plan, returning its head id.
    fn absorb(&mut self, other: Query) -> OperatorId {
        for (id, node) in other.plan.nodes {
            self.plan.nodes.insert(id, node);
        }
        other.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::expr::{col, lit};
    use crate::plan::operator::TimeCharacteristic;
    use crate::plan::schema::PhysicalType;
    use pretty_assertions::assert_eq;

    fn keyed_schema() -> Schema {
        Schema::new()
            .with_field("k", PhysicalType::UInt64)
            .with_field("v", PhysicalType::UInt64)
            .with_field("ts", PhysicalType::UInt64)
    }

    #[test]
    fn linear_query_builds_and_infers() -> crate::Result<()> {
        let plan = Query::from_source("car", keyed_schema())
            .map("v", lit(40u64))
            .filter(col("k").lt(lit(60u64)))
            .sink(SinkDescriptor::Collect)?;
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.consumed_sources(), vec!["car".to_string()]);
        Ok(())
    }

    #[test]
    fn window_query_produces_window_schema() -> crate::Result<()> {
        let plan = Query::from_source("car", keyed_schema())
            .window(
                WindowDescriptor::tumbling(
                    1000,
                    TimeCharacteristic::EventTime { field: "ts".into() },
                ),
                vec!["k".into()],
                vec![WindowAggregation::new(
                    crate::plan::operator::AggregationKind::Sum,
                    "v",
                    "sum_v",
                )],
            )
            .sink(SinkDescriptor::Collect)?;
        let window_id = plan
            .operators()
            .find(|n| matches!(n.operator, LogicalOperator::Window(_)))
            .map(|n| n.id)
            .expect("window operator");
        let schema = &plan.node(window_id)?.output_schema;
        let names: Vec<_> = schema.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["car$start", "car$end", "car$k", "car$sum_v"]);
        Ok(())
    }

    #[test]
    fn join_query_concatenates_payloads() -> crate::Result<()> {
        let right_schema = Schema::new()
            .with_field("k", PhysicalType::UInt64)
            .with_field("w", PhysicalType::UInt64)
            .with_field("ts", PhysicalType::UInt64);
        let plan = Query::from_source("left", keyed_schema())
            .join_with(
                Query::from_source("right", right_schema),
                "left$k",
                "right$k",
                WindowDescriptor::tumbling(
                    1000,
                    TimeCharacteristic::EventTime { field: "ts".into() },
                ),
                JoinVariant::InnerEqui,
            )
            .sink(SinkDescriptor::Collect)?;
        let join_id = plan
            .operators()
            .find(|n| matches!(n.operator, LogicalOperator::Join(_)))
            .map(|n| n.id)
            .expect("join operator");
        let names: Vec<_> = plan
            .node(join_id)?
            .output_schema
            .fields()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["left$start", "left$end", "left$k", "left$v", "right$w"]
        );
        Ok(())
    }
}
