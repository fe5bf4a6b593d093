// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The worker topology: a rooted, directed graph of processing nodes.
//!
//! Edges point from a node toward the coordinator root, the direction data flows. Nodes
//! carry the CPU slots placement consumes; links carry bandwidth and latency properties
//! used by cost-aware strategies.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;

use crate::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopologyNodeId(u64);

impl TopologyNodeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for TopologyNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct TopologyNode {
    pub id: TopologyNodeId,
    pub address: String,
    pub remaining_cpu_slots: u32,
}

/// Directed link from `source` toward `destination` (towards the root).
#[derive(Clone, Debug)]
pub struct TopologyLink {
    pub source: TopologyNodeId,
    pub destination: TopologyNodeId,
    pub bandwidth_mbps: u64,
    pub latency_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Topology {
    nodes: BTreeMap<TopologyNodeId, TopologyNode>,
    links: Vec<TopologyLink>,
    root: Option<TopologyNodeId>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the coordinator root node.
    pub fn add_root(
        &mut self,
        id: TopologyNodeId,
        address: impl Into<String>,
        cpu_slots: u32,
    ) -> TopologyNodeId {
        self.add_node(id, address, cpu_slots);
        self.root = Some(id);
        id
    }

    pub fn add_node(
        &mut self,
        id: TopologyNodeId,
        address: impl Into<String>,
        cpu_slots: u32,
    ) -> TopologyNodeId {
        self.nodes.insert(
            id,
            TopologyNode {
                id,
                address: address.into(),
                remaining_cpu_slots: cpu_slots,
            },
        );
        id
    }

    /// Adds a directed link from `source` up toward `destination`.
    pub fn add_link(
        &mut self,
        source: TopologyNodeId,
        destination: TopologyNodeId,
        bandwidth_mbps: u64,
        latency_ms: u64,
    ) {
        self.links.push(TopologyLink {
            source,
            destination,
            bandwidth_mbps,
            latency_ms,
        });
    }

    pub fn root(&self) -> crate::Result<TopologyNodeId> {
        self.root
            .ok_or_else(|| ErrorKind::PlacementFailed.with_message("topology has no root node"))
    }

    pub fn node(&self, id: TopologyNodeId) -> crate::Result<&TopologyNode> {
        self.nodes.get(&id).ok_or_else(|| {
            ErrorKind::PlacementFailed.with_message(format!("unknown topology node {id}"))
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.values()
    }

    pub fn contains(&self, id: TopologyNodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Nodes reachable over one outgoing link of `id`.
    pub fn upstream_neighbors(&self, id: TopologyNodeId) -> Vec<TopologyNodeId> {
        self.links
            .iter()
            .filter(|l| l.source == id)
            .map(|l| l.destination)
            .collect()
    }

    /// Nodes with a link into `id`, i.e. one hop away from the root side.
    pub fn downstream_neighbors(&self, id: TopologyNodeId) -> Vec<TopologyNodeId> {
        self.links
            .iter()
            .filter(|l| l.destination == id)
            .map(|l| l.source)
            .collect()
    }

    pub fn are_adjacent(&self, source: TopologyNodeId, destination: TopologyNodeId) -> bool {
        source == destination
            || self
                .links
                .iter()
                .any(|l| l.source == source && l.destination == destination)
    }

    pub fn remaining_cpu(&self, id: TopologyNodeId) -> crate::Result<u32> {
        Ok(self.node(id)?.remaining_cpu_slots)
    }

    /// Consumes one CPU slot on the node; fails when none remain.
    pub fn occupy_slot(&mut self, id: TopologyNodeId) -> crate::Result<()> {
        let node = self.nodes.get_mut(&id).ok_or_else(|| {
            ErrorKind::PlacementFailed.with_message(format!("unknown topology node {id}"))
        })?;
        if node.remaining_cpu_slots == 0 {
            return Err(ErrorKind::PlacementFailed
                .with_message(format!("no free CPU slots on {id} ({})", node.address)));
        }
        node.remaining_cpu_slots -= 1;
        Ok(())
    }

    /// Returns one CPU slot to the node, on operator undeployment.
    pub fn release_slot(&mut self, id: TopologyNodeId) -> crate::Result<()> {
        let node = self.nodes.get_mut(&id).ok_or_else(|| {
            ErrorKind::PlacementFailed.with_message(format!("unknown topology node {id}"))
        })?;
        node.remaining_cpu_slots += 1;
        Ok(())
    }

    /// Shortest path (in hops) from `from` toward `to`, following link direction.
    ///
    /// The returned path includes both endpoints. Used to route forwarder operators
    /// between non-adjacent hosts.
    pub fn find_path(
        &self,
        from: TopologyNodeId,
        to: TopologyNodeId,
    ) -> crate::Result<Vec<TopologyNodeId>> {
        if from == to {
            return Ok(vec![from]);
        }
        let mut predecessor: BTreeMap<TopologyNodeId, TopologyNodeId> = BTreeMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for neighbor in self.upstream_neighbors(current) {
                if neighbor != from && !predecessor.contains_key(&neighbor) {
                    predecessor.insert(neighbor, current);
                    if neighbor == to {
                        let mut path = vec![to];
                        let mut step = to;
                        while let Some(prev) = predecessor.get(&step) {
                            path.push(*prev);
                            step = *prev;
                        }
                        path.reverse();
                        return Ok(path);
                    }
                    queue.push_back(neighbor);
                }
            }
        }
        Err(ErrorKind::PlacementFailed
            .with_message(format!("no path from {from} to {to} in the topology")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// root <- relay <- leaf, plus a disconnected island.
    fn chain() -> (Topology, TopologyNodeId, TopologyNodeId, TopologyNodeId) {
        let mut topology = Topology::new();
        let root = topology.add_root(TopologyNodeId::new(1), "coordinator:4000", 4);
        let relay = topology.add_node(TopologyNodeId::new(2), "relay:4000", 2);
        let leaf = topology.add_node(TopologyNodeId::new(3), "leaf:4000", 2);
        topology.add_link(relay, root, 100, 5);
        topology.add_link(leaf, relay, 50, 10);
        (topology, root, relay, leaf)
    }

    #[test]
    fn path_follows_link_direction() -> crate::Result<()> {
        let (topology, root, relay, leaf) = chain();
        assert_eq!(topology.find_path(leaf, root)?, vec![leaf, relay, root]);
        // Links are directed toward the root; the reverse direction has no path.
        assert!(topology.find_path(root, leaf).is_err());
        Ok(())
    }

    #[test]
    fn slot_accounting() -> crate::Result<()> {
        let (mut topology, _, relay, _) = chain();
        topology.occupy_slot(relay)?;
        topology.occupy_slot(relay)?;
        let err = topology.occupy_slot(relay).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlacementFailed);
        topology.release_slot(relay)?;
        assert_eq!(topology.remaining_cpu(relay)?, 1);
        Ok(())
    }

    #[test]
    fn adjacency_is_directed() {
        let (topology, root, relay, leaf) = chain();
        assert!(topology.are_adjacent(leaf, relay));
        assert!(!topology.are_adjacent(relay, leaf));
        assert!(!topology.are_adjacent(leaf, root));
    }
}
