// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Operator placement onto the worker topology.
//!
//! Sources are pinned to the nodes emitting them, sinks to the topology root. Everything in
//! between consumes CPU slots and is assigned by the configured strategy. Pinned operators
//! and forwarders do not consume slots; placement fails when an intermediate operator finds
//! no node with free capacity.

use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::SourceCatalog;
use crate::optimizer::global_plan::{SharedQueryId, SharedQueryPlan};
use crate::plan::operator::LogicalOperator;
use crate::plan::OperatorId;
use crate::topology::{Topology, TopologyNodeId};
use crate::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Assign from the sources upward, keeping operators close to the data.
    BottomUp,
    /// Assign from the sink downward, keeping operators close to the root.
    TopDown,
    /// Placement is provided externally; recognized but not performed here.
    Manual,
    /// Cost-model driven placement; recognized but not performed here.
    Elegant,
}

/// One operator instance assigned to a topology node.
#[derive(Clone, Debug)]
pub struct PlacedOperator {
    pub operator: OperatorId,
    pub shared_plan: SharedQueryId,
    /// Label for diagnostics, e.g. `filter(op-12)`.
    pub label: String,
    /// Network no-op bridging non-adjacent hosts.
    pub forwarder: bool,
    /// Whether this instance occupies a CPU slot on its node.
    consumes_slot: bool,
}

/// The operators assigned to one topology node.
#[derive(Clone, Debug)]
pub struct ExecutionNode {
    pub node: TopologyNodeId,
    pub placed: Vec<PlacedOperator>,
}

/// topology-node-id → assigned operator instances, across all shared plans.
#[derive(Clone, Debug, Default)]
pub struct GlobalExecutionPlan {
    nodes: BTreeMap<TopologyNodeId, ExecutionNode>,
    assignments: BTreeMap<(SharedQueryId, OperatorId), TopologyNodeId>,
}

impl GlobalExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_nodes(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.nodes.values()
    }

    pub fn node_of(&self, plan: SharedQueryId, operator: OperatorId) -> Option<TopologyNodeId> {
        self.assignments.get(&(plan, operator)).copied()
    }

    pub fn is_placed(&self, plan: SharedQueryId, operator: OperatorId) -> bool {
        self.assignments.contains_key(&(plan, operator))
    }

    /// Topology nodes hosting any operator of the given shared plan.
    pub fn hosts_of(&self, plan: SharedQueryId) -> BTreeSet<TopologyNodeId> {
        self.assignments
            .iter()
            .filter(|((p, _), _)| *p == plan)
            .map(|(_, node)| *node)
            .collect()
    }

    /// Number of placed operator instances that occupy a CPU slot.
    pub fn occupied_slots(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|n| n.placed.iter())
            .filter(|p| p.consumes_slot)
            .count()
    }

    fn assign(&mut self, node: TopologyNodeId, placed: PlacedOperator) {
        self.assignments
            .insert((placed.shared_plan, placed.operator), node);
        self.nodes
            .entry(node)
            .or_insert_with(|| ExecutionNode {
                node,
                placed: Vec::new(),
            })
            .placed
            .push(placed);
    }

    /// Removes every assignment of the shared plan, releasing CPU slots.
    pub fn remove_shared_plan(
        &mut self,
        plan: SharedQueryId,
        topology: &mut Topology,
    ) -> crate::Result<()> {
        self.assignments.retain(|(p, _), _| *p != plan);
        for execution_node in self.nodes.values_mut() {
            for placed in &execution_node.placed {
                if placed.shared_plan == plan && placed.consumes_slot {
                    topology.release_slot(execution_node.node)?;
                }
            }
            execution_node.placed.retain(|p| p.shared_plan != plan);
        }
        self.nodes.retain(|_, n| !n.placed.is_empty());
        Ok(())
    }

    /// Removes the assignments of specific operators (on member undeploy).
    pub fn remove_operators(
        &mut self,
        plan: SharedQueryId,
        operators: &[OperatorId],
        topology: &mut Topology,
    ) -> crate::Result<()> {
        for operator in operators {
            self.assignments.remove(&(plan, *operator));
        }
        for execution_node in self.nodes.values_mut() {
            for placed in &execution_node.placed {
                if placed.shared_plan == plan
                    && placed.consumes_slot
                    && operators.contains(&placed.operator)
                {
                    topology.release_slot(execution_node.node)?;
                }
            }
            execution_node
                .placed
                .retain(|p| !(p.shared_plan == plan && operators.contains(&p.operator)));
        }
        self.nodes.retain(|_, n| !n.placed.is_empty());
        Ok(())
    }
}

/// Assigns a shared query plan's operators to topology nodes.
pub struct QueryPlacementPhase {
    strategy: PlacementStrategy,
    incremental: bool,
}

impl QueryPlacementPhase {
    pub fn new(strategy: PlacementStrategy, incremental: bool) -> Self {
        Self {
            strategy,
            incremental,
        }
    }

    /// Places the shared plan, or only its changed subtree in incremental mode.
    ///
    /// Already-assigned operators are never relocated: a later query merged into the same
    /// shared plan must not move the operators of earlier members.
    #[tracing::instrument(level = "debug", skip_all, fields(shared_plan = %shared_plan.id), err)]
    pub fn execute(
        &self,
        shared_plan: &SharedQueryPlan,
        topology: &mut Topology,
        source_catalog: &SourceCatalog,
        execution_plan: &mut GlobalExecutionPlan,
    ) -> crate::Result<()> {
        match self.strategy {
            PlacementStrategy::BottomUp => {}
            PlacementStrategy::TopDown => {}
            PlacementStrategy::Manual | PlacementStrategy::Elegant => {
                return Err(ErrorKind::PlacementFailed.with_message(
                    "manual and elegant placement are performed by an external planner",
                ))
            }
        }

        // Full mode re-derives the whole assignment; incremental mode keeps existing
        // assignments and only places the operators the last merge introduced.
        if !self.incremental {
            execution_plan.remove_shared_plan(shared_plan.id, topology)?;
        }

        let order = match self.strategy {
            PlacementStrategy::TopDown => {
                let mut order = shared_plan.plan.topological_order()?;
                order.reverse();
                order
            }
            _ => shared_plan.plan.topological_order()?,
        };

        for operator in order {
            if execution_plan.is_placed(shared_plan.id, operator) {
                continue;
            }
            let node = self.find_node(
                shared_plan,
                operator,
                topology,
                source_catalog,
                execution_plan,
            )?;
            let logical = &shared_plan.plan.node(operator)?.operator;
            let consumes_slot = !logical.is_source() && !logical.is_sink();
            if consumes_slot {
                topology.occupy_slot(node)?;
            }
            tracing::debug!(operator = %operator, kind = logical.kind(), node = %node, "placed operator");
            execution_plan.assign(
                node,
                PlacedOperator {
                    operator,
                    shared_plan: shared_plan.id,
                    label: format!("{}({})", logical.kind(), operator),
                    forwarder: false,
                    consumes_slot,
                },
            );
        }

        self.add_forwarders(shared_plan, topology, execution_plan)
    }

    /// Candidate node selection for one operator.
    fn find_node(
        &self,
        shared_plan: &SharedQueryPlan,
        operator: OperatorId,
        topology: &Topology,
        source_catalog: &SourceCatalog,
        execution_plan: &GlobalExecutionPlan,
    ) -> crate::Result<TopologyNodeId> {
        let node = shared_plan.plan.node(operator)?;
        match &node.operator {
            LogicalOperator::Sink(_) => topology.root(),
            LogicalOperator::Source { name, .. } => {
                let nodes = source_catalog.nodes_for(name)?;
                nodes.first().copied().ok_or_else(|| {
                    ErrorKind::PlacementFailed
                        .with_message(format!("source {name} has no physical emitter"))
                })
            }
            _ => {
                // Anchor on the node already hosting a neighbor of this operator: the first
                // child for bottom-up, the first parent for top-down.
                let anchors = match self.strategy {
                    PlacementStrategy::TopDown => &node.parents,
                    _ => &node.children,
                };
                let anchor_host = anchors
                    .iter()
                    .find_map(|a| execution_plan.node_of(shared_plan.id, *a))
                    .ok_or_else(|| {
                        ErrorKind::PlacementFailed.with_message(format!(
                            "no placed neighbor to anchor operator {operator}"
                        ))
                    })?;
                if topology.remaining_cpu(anchor_host)? > 0 {
                    return Ok(anchor_host);
                }
                let neighbors = match self.strategy {
                    PlacementStrategy::TopDown => topology.downstream_neighbors(anchor_host),
                    _ => topology.upstream_neighbors(anchor_host),
                };
                let preferred = execution_plan.hosts_of(shared_plan.id);
                let best = neighbors
                    .into_iter()
                    .filter(|n| topology.remaining_cpu(*n).unwrap_or(0) > 0)
                    .max_by_key(|n| {
                        // Highest capacity wins; prefer nodes already hosting this plan.
                        (
                            topology.remaining_cpu(*n).unwrap_or(0),
                            preferred.contains(n),
                        )
                    });
                best.ok_or_else(|| {
                    ErrorKind::PlacementFailed.with_message(format!(
                        "no resource: no node with free capacity near {anchor_host}"
                    ))
                })
            }
        }
    }

    /// Bridges every parent/child pair that landed on non-adjacent nodes with forwarder
    /// operators along the topology path.
    fn add_forwarders(
        &self,
        shared_plan: &SharedQueryPlan,
        topology: &Topology,
        execution_plan: &mut GlobalExecutionPlan,
    ) -> crate::Result<()> {
        let mut forwarders: Vec<(TopologyNodeId, OperatorId)> = Vec::new();
        for node in shared_plan.plan.operators() {
            let Some(child_host) = execution_plan.node_of(shared_plan.id, node.id) else {
                continue;
            };
            for parent in &node.parents {
                let Some(parent_host) = execution_plan.node_of(shared_plan.id, *parent) else {
                    continue;
                };
                if topology.are_adjacent(child_host, parent_host) {
                    continue;
                }
                let path = topology.find_path(child_host, parent_host)?;
                for hop in &path[1..path.len() - 1] {
                    forwarders.push((*hop, node.id));
                }
            }
        }
        for (hop, source_operator) in forwarders {
            let forwarder_id = OperatorId::next();
            tracing::debug!(node = %hop, bridges = %source_operator, "adding forwarder");
            execution_plan.assign(
                hop,
                PlacedOperator {
                    operator: forwarder_id,
                    shared_plan: shared_plan.id,
                    label: format!("forward({source_operator})"),
                    forwarder: true,
                    consumes_slot: false,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::OriginId;
    use crate::catalog::QueryId;
    use crate::config::QueryMergerRule;
    use crate::optimizer::containment::ContainmentChecker;
    use crate::optimizer::global_plan::{GlobalQueryPlan, GlobalQueryPlanUpdatePhase};
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

    /// Root (no slots) fed by one worker with two slots hosting the `car` source.
    fn small_world() -> (Topology, SourceCatalog, TopologyNodeId, TopologyNodeId) {
        let mut topology = Topology::new();
        let root = topology.add_root(TopologyNodeId::new(1), "coordinator:4000", 0);
        let worker = topology.add_node(TopologyNodeId::new(2), "worker:4000", 2);
        topology.add_link(worker, root, 100, 5);
        let mut catalog = SourceCatalog::new();
        catalog.register("car", car_schema());
        catalog
            .add_physical("car", OriginId(1), worker)
            .expect("register physical source");
        (topology, catalog, root, worker)
    }

    fn admitted(
        global_plan: &mut GlobalQueryPlan,
        plan: crate::plan::LogicalPlan,
    ) -> crate::optimizer::global_plan::SharedQueryId {
        let query = QueryId::next();
        global_plan.add_query_plan(query, plan);
        let phase = GlobalQueryPlanUpdatePhase::new(
            QueryMergerRule::SignatureContainment,
            ContainmentChecker::default(),
            1,
        );
        let outcomes = phase.execute(global_plan);
        *outcomes[0].result.as_ref().expect("admitted")
    }

    #[test]
    fn bottom_up_places_filter_on_the_source_node() -> crate::Result<()> {
        let (mut topology, catalog, root, worker) = small_world();
        let mut global_plan = GlobalQueryPlan::new();
        let sqp_id = admitted(
            &mut global_plan,
            Query::from_source("car", car_schema())
                .filter(col("id").lt(lit(5u64)))
                .sink(SinkDescriptor::Collect)?,
        );
        let mut execution_plan = GlobalExecutionPlan::new();
        let phase = QueryPlacementPhase::new(PlacementStrategy::BottomUp, false);
        phase.execute(
            global_plan.shared_plan(sqp_id)?,
            &mut topology,
            &catalog,
            &mut execution_plan,
        )?;

        let sqp = global_plan.shared_plan(sqp_id)?;
        let filter = sqp
            .plan
            .operators()
            .find(|n| n.operator.kind() == "filter")
            .map(|n| n.id)
            .expect("filter");
        assert_eq!(execution_plan.node_of(sqp_id, filter), Some(worker));
        assert_eq!(topology.remaining_cpu(worker)?, 1);
        assert_eq!(topology.remaining_cpu(root)?, 0);
        assert_eq!(execution_plan.occupied_slots(), 1);
        Ok(())
    }

    #[test]
    fn placement_conservation() -> crate::Result<()> {
        let (mut topology, catalog, _, worker) = small_world();
        let before = topology.remaining_cpu(worker)?;
        let mut global_plan = GlobalQueryPlan::new();
        let sqp_id = admitted(
            &mut global_plan,
            Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .filter(col("id").lt(lit(5u64)))
                .sink(SinkDescriptor::Collect)?,
        );
        let mut execution_plan = GlobalExecutionPlan::new();
        QueryPlacementPhase::new(PlacementStrategy::BottomUp, false).execute(
            global_plan.shared_plan(sqp_id)?,
            &mut topology,
            &catalog,
            &mut execution_plan,
        )?;
        let used = before - topology.remaining_cpu(worker)?;
        assert_eq!(used as usize, execution_plan.occupied_slots());
        Ok(())
    }

    #[test]
    fn placement_fails_without_capacity() -> crate::Result<()> {
        let (mut topology, catalog, _, worker) = small_world();
        // Exhaust the worker up front.
        topology.occupy_slot(worker)?;
        topology.occupy_slot(worker)?;
        let mut global_plan = GlobalQueryPlan::new();
        let sqp_id = admitted(
            &mut global_plan,
            Query::from_source("car", car_schema())
                .filter(col("id").lt(lit(5u64)))
                .sink(SinkDescriptor::Collect)?,
        );
        let mut execution_plan = GlobalExecutionPlan::new();
        let err = QueryPlacementPhase::new(PlacementStrategy::BottomUp, false)
            .execute(
                global_plan.shared_plan(sqp_id)?,
                &mut topology,
                &catalog,
                &mut execution_plan,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlacementFailed);
        Ok(())
    }

    #[test]
    fn incremental_merge_places_only_the_new_branch() -> crate::Result<()> {
        let (mut topology, catalog, _, worker) = small_world();
        let mut global_plan = GlobalQueryPlan::new();
        let sqp_id = admitted(
            &mut global_plan,
            Query::from_source("car", car_schema())
                .filter(col("id").lt(lit(60u64)))
                .sink(SinkDescriptor::Collect)?,
        );
        let mut execution_plan = GlobalExecutionPlan::new();
        let phase = QueryPlacementPhase::new(PlacementStrategy::BottomUp, true);
        phase.execute(
            global_plan.shared_plan(sqp_id)?,
            &mut topology,
            &catalog,
            &mut execution_plan,
        )?;
        let first_hosts: Vec<_> = global_plan
            .shared_plan(sqp_id)?
            .plan
            .operators()
            .map(|n| (n.id, execution_plan.node_of(sqp_id, n.id)))
            .collect();

        // Merge a contained query; its filter branch is the changed subtree.
        let merged = admitted(
            &mut global_plan,
            Query::from_source("car", car_schema())
                .filter(col("id").lt(lit(45u64)))
                .sink(SinkDescriptor::Collect)?,
        );
        assert_eq!(merged, sqp_id);
        phase.execute(
            global_plan.shared_plan(sqp_id)?,
            &mut topology,
            &catalog,
            &mut execution_plan,
        )?;

        // Earlier assignments did not move.
        for (operator, host) in first_hosts {
            assert_eq!(execution_plan.node_of(sqp_id, operator), host);
        }
        // The new filter landed on the worker, which is now down to zero slots.
        assert_eq!(topology.remaining_cpu(worker)?, 0);
        assert_eq!(execution_plan.occupied_slots(), 2);
        Ok(())
    }

    #[test]
    fn forwarders_bridge_non_adjacent_hosts() -> crate::Result<()> {
        // leaf -> relay -> root; the source sits on the leaf, the relay has no capacity,
        // so the filter lands on the leaf and the leaf->root edge skips the relay.
        let mut topology = Topology::new();
        let root = topology.add_root(TopologyNodeId::new(1), "coordinator:4000", 0);
        let relay = topology.add_node(TopologyNodeId::new(2), "relay:4000", 0);
        let leaf = topology.add_node(TopologyNodeId::new(3), "leaf:4000", 4);
        topology.add_link(relay, root, 100, 5);
        topology.add_link(leaf, relay, 50, 10);
        let mut catalog = SourceCatalog::new();
        catalog.register("car", car_schema());
        catalog.add_physical("car", OriginId(1), leaf)?;

        let mut global_plan = GlobalQueryPlan::new();
        let sqp_id = admitted(
            &mut global_plan,
            Query::from_source("car", car_schema())
                .filter(col("id").lt(lit(5u64)))
                .sink(SinkDescriptor::Collect)?,
        );
        let mut execution_plan = GlobalExecutionPlan::new();
        QueryPlacementPhase::new(PlacementStrategy::BottomUp, false).execute(
            global_plan.shared_plan(sqp_id)?,
            &mut topology,
            &catalog,
            &mut execution_plan,
        )?;

        let relay_node = execution_plan
            .execution_nodes()
            .find(|n| n.node == relay)
            .expect("relay hosts a forwarder");
        assert!(relay_node.placed.iter().all(|p| p.forwarder));
        assert_eq!(relay_node.placed.len(), 1);
        let _ = root;
        Ok(())
    }

    #[test]
    fn top_down_prefers_the_root_side() -> crate::Result<()> {
        let mut topology = Topology::new();
        let root = topology.add_root(TopologyNodeId::new(1), "coordinator:4000", 4);
        let worker = topology.add_node(TopologyNodeId::new(2), "worker:4000", 4);
        topology.add_link(worker, root, 100, 5);
        let mut catalog = SourceCatalog::new();
        catalog.register("car", car_schema());
        catalog.add_physical("car", OriginId(1), worker)?;

        let mut global_plan = GlobalQueryPlan::new();
        let sqp_id = admitted(
            &mut global_plan,
            Query::from_source("car", car_schema())
                .filter(col("id").lt(lit(5u64)))
                .sink(SinkDescriptor::Collect)?,
        );
        let mut execution_plan = GlobalExecutionPlan::new();
        QueryPlacementPhase::new(PlacementStrategy::TopDown, false).execute(
            global_plan.shared_plan(sqp_id)?,
            &mut topology,
            &catalog,
            &mut execution_plan,
        )?;
        let sqp = global_plan.shared_plan(sqp_id)?;
        let filter = sqp
            .plan
            .operators()
            .find(|n| n.operator.kind() == "filter")
            .map(|n| n.id)
            .expect("filter");
        assert_eq!(execution_plan.node_of(sqp_id, filter), Some(root));
        Ok(())
    }
}
