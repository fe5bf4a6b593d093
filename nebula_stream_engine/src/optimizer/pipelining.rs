// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Splitting a logical plan into pipelines.
//!
//! A pipeline is a linear scan → ops → emit chain executed as one stage over tuple
//! buffers. Pipelines end at pipeline breakers (windows, joins, unions) and wherever the
//! operator graph fans in or out. Stage ids are assigned in topological order, so the same
//! plan always compiles to the same ids.

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::plan::{LogicalPlan, OperatorId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineStageId(u32);

impl PipelineStageId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for PipelineStageId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "stage-{}", self.0)
    }
}

/// One linear chain of operators, scan side first.
#[derive(Clone, Debug)]
pub struct Pipeline {
    pub id: PipelineStageId,
    pub operators: Vec<OperatorId>,
    /// Stages consuming this pipeline's output buffers.
    pub successors: Vec<PipelineStageId>,
}

/// All pipelines of one plan, in dependency order.
#[derive(Clone, Debug, Default)]
pub struct PipelinePlan {
    pipelines: Vec<Pipeline>,
}

impl PipelinePlan {
    /// Splits the plan at its breakers.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn from_plan(plan: &LogicalPlan) -> crate::Result<Self> {
        let mut pipelines: Vec<Pipeline> = Vec::new();
        let mut pipeline_of: BTreeMap<OperatorId, usize> = BTreeMap::new();

        for id in plan.topological_order()? {
            let node = plan.node(id)?;
            // An operator extends its child's pipeline only along a pure linear edge:
            // exactly one child, which has exactly one consumer and is not a breaker.
            // Breakers always open their own stage.
            let extends = !node.operator.is_pipeline_breaker()
                && match node.children.as_slice() {
                    [child] => {
                        let child_node = plan.node(*child)?;
                        child_node.parents.len() == 1
                            && !child_node.operator.is_pipeline_breaker()
                    }
                    _ => false,
                };
            if extends {
                let index = pipeline_of[&node.children[0]];
                pipelines[index].operators.push(id);
                pipeline_of.insert(id, index);
                continue;
            }
            let index = pipelines.len();
            let stage_id = PipelineStageId(index as u32 + 1);
            pipelines.push(Pipeline {
                id: stage_id,
                operators: vec![id],
                successors: Vec::new(),
            });
            pipeline_of.insert(id, index);
            for child in &node.children {
                let child_pipeline = pipeline_of[child];
                if !pipelines[child_pipeline].successors.contains(&stage_id) {
                    pipelines[child_pipeline].successors.push(stage_id);
                }
            }
        }
        tracing::debug!(pipelines = pipelines.len(), "split plan into pipelines");
        Ok(Self { pipelines })
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn pipeline(&self, id: PipelineStageId) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    /// The pipeline containing the given operator.
    pub fn pipeline_of(&self, operator: OperatorId) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.operators.contains(&operator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::expr::{col, lit};
    use crate::plan::operator::{
        AggregationKind, JoinVariant, SinkDescriptor, TimeCharacteristic, WindowAggregation,
        WindowDescriptor,
    };
    use crate::plan::schema::{PhysicalType, Schema};
    use crate::plan::Query;
    use pretty_assertions::assert_eq;

    fn keyed_schema() -> Schema {
        Schema::new()
            .with_field("k", PhysicalType::UInt64)
            .with_field("v", PhysicalType::UInt64)
            .with_field("ts", PhysicalType::UInt64)
    }

    fn event_time() -> TimeCharacteristic {
        TimeCharacteristic::EventTime { field: "ts".into() }
    }

    #[test]
    fn linear_plan_is_one_pipeline() -> crate::Result<()> {
        let plan = Query::from_source("car", keyed_schema())
            .filter(col("k").lt(lit(5u64)))
            .map("v", lit(1u64))
            .sink(SinkDescriptor::Collect)?;
        let pipelines = PipelinePlan::from_plan(&plan)?;
        assert_eq!(pipelines.pipelines().len(), 1);
        assert_eq!(pipelines.pipelines()[0].operators.len(), 4);
        Ok(())
    }

    #[test]
    fn window_breaks_the_pipeline() -> crate::Result<()> {
        let plan = Query::from_source("car", keyed_schema())
            .filter(col("k").lt(lit(5u64)))
            .window(
                WindowDescriptor::tumbling(1000, event_time()),
                vec!["k".into()],
                vec![WindowAggregation::new(AggregationKind::Sum, "v", "sum_v")],
            )
            .sink(SinkDescriptor::Collect)?;
        let pipelines = PipelinePlan::from_plan(&plan)?;
        // scan+filter | window | sink
        assert_eq!(pipelines.pipelines().len(), 3);
        let window_pipeline = &pipelines.pipelines()[1];
        assert_eq!(window_pipeline.operators.len(), 1);
        assert_eq!(pipelines.pipelines()[0].successors, vec![window_pipeline.id]);
        Ok(())
    }

    #[test]
    fn join_fans_in_two_pipelines() -> crate::Result<()> {
        let plan = Query::from_source("left", keyed_schema())
            .join_with(
                Query::from_source("right", keyed_schema()),
                "left$k",
                "right$k",
                WindowDescriptor::tumbling(1000, event_time()),
                JoinVariant::InnerEqui,
            )
            .sink(SinkDescriptor::Collect)?;
        let pipelines = PipelinePlan::from_plan(&plan)?;
        // left scan | right scan | join | sink
        assert_eq!(pipelines.pipelines().len(), 4);
        let join_id = plan
            .operators()
            .find(|n| n.operator.kind() == "join")
            .map(|n| n.id)
            .expect("join operator");
        let join_pipeline = pipelines.pipeline_of(join_id).expect("join pipeline");
        let feeding: Vec<_> = pipelines
            .pipelines()
            .iter()
            .filter(|p| p.successors.contains(&join_pipeline.id))
            .collect();
        assert_eq!(feeding.len(), 2);
        Ok(())
    }

    #[test]
    fn stage_ids_are_deterministic() -> crate::Result<()> {
        let build = || -> crate::Result<Vec<(u32, usize)>> {
            let plan = Query::from_source("car", keyed_schema())
                .filter(col("k").lt(lit(5u64)))
                .window(
                    WindowDescriptor::tumbling(1000, event_time()),
                    vec!["k".into()],
                    vec![WindowAggregation::new(AggregationKind::Sum, "v", "sum_v")],
                )
                .sink(SinkDescriptor::Collect)?;
            Ok(PipelinePlan::from_plan(&plan)?
                .pipelines()
                .iter()
                .map(|p| (p.id.as_u32(), p.operators.len()))
                .collect())
        };
        assert_eq!(build()?, build()?);
        Ok(())
    }
}
