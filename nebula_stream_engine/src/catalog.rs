// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Catalogs: registered sources, submitted queries, and user-defined functions.
//!
//! Catalogs are plain data guarded by the storage handler; none of them is a global. The
//! engine context owns one of each and threads them through the optimizer phases.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::plan::schema::Schema;
use crate::plan::LogicalPlan;
use crate::topology::TopologyNodeId;
use crate::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(u64);

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

impl QueryId {
    pub fn next() -> Self {
        Self(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "query-{}", self.0)
    }
}

/// A distinct physical stream contributing buffers to a stateful operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OriginId(pub u64);

impl Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "origin-{}", self.0)
    }
}

/// One physical emitter of a logical source.
#[derive(Clone, Debug)]
pub struct PhysicalSource {
    pub origin: OriginId,
    pub node: TopologyNodeId,
}

#[derive(Clone, Debug)]
pub struct LogicalSource {
    pub name: String,
    /// Unqualified schema; qualified with the source name when bound into a plan.
    pub schema: Schema,
    pub physical: Vec<PhysicalSource>,
}

/// Registered logical sources and their physical placements.
#[derive(Clone, Debug, Default)]
pub struct SourceCatalog {
    sources: BTreeMap<String, LogicalSource>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, schema: Schema) {
        let name = name.into();
        self.sources.insert(
            name.clone(),
            LogicalSource {
                name,
                schema,
                physical: Vec::new(),
            },
        );
    }

    /// Attaches a physical emitter of `name` running on `node`.
    pub fn add_physical(
        &mut self,
        name: &str,
        origin: OriginId,
        node: TopologyNodeId,
    ) -> crate::Result<()> {
        let source = self.sources.get_mut(name).ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("unknown source: {name}"))
        })?;
        source.physical.push(PhysicalSource { origin, node });
        Ok(())
    }

    pub fn source(&self, name: &str) -> crate::Result<&LogicalSource> {
        self.sources.get(name).ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("unknown source: {name}"))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Topology nodes hosting physical emitters of the named source.
    pub fn nodes_for(&self, name: &str) -> crate::Result<Vec<TopologyNodeId>> {
        Ok(self.source(name)?.physical.iter().map(|p| p.node).collect())
    }
}

/// Lifecycle of a submitted query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Registered,
    Optimizing,
    Placed,
    Deployed,
    Running,
    Stopped,
    Failed,
}

impl Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            QueryStatus::Registered => "registered",
            QueryStatus::Optimizing => "optimizing",
            QueryStatus::Placed => "placed",
            QueryStatus::Deployed => "deployed",
            QueryStatus::Running => "running",
            QueryStatus::Stopped => "stopped",
            QueryStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug)]
pub struct QueryCatalogEntry {
    pub id: QueryId,
    pub plan: LogicalPlan,
    pub status: QueryStatus,
    /// Failure or progress detail, for status queries.
    pub status_message: Option<String>,
}

/// All queries known to the coordinator, by id.
#[derive(Clone, Debug, Default)]
pub struct QueryCatalog {
    entries: BTreeMap<QueryId, QueryCatalogEntry>,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plan: LogicalPlan) -> QueryId {
        let id = QueryId::next();
        self.entries.insert(
            id,
            QueryCatalogEntry {
                id,
                plan,
                status: QueryStatus::Registered,
                status_message: None,
            },
        );
        id
    }

    pub fn entry(&self, id: QueryId) -> crate::Result<&QueryCatalogEntry> {
        self.entries.get(&id).ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("unknown query {id}"))
        })
    }

    pub fn status(&self, id: QueryId) -> crate::Result<QueryStatus> {
        Ok(self.entry(id)?.status)
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueryCatalogEntry> {
        self.entries.values()
    }

    pub fn set_status(&mut self, id: QueryId, status: QueryStatus) -> crate::Result<()> {
        self.update(id, status, None)
    }

    pub fn mark_failed(&mut self, id: QueryId, message: impl Into<String>) -> crate::Result<()> {
        self.update(id, QueryStatus::Failed, Some(message.into()))
    }

    fn update(
        &mut self,
        id: QueryId,
        status: QueryStatus,
        message: Option<String>,
    ) -> crate::Result<()> {
        let entry = self.entries.get_mut(&id).ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("unknown query {id}"))
        })?;
        tracing::debug!(query = %id, from = %entry.status, to = %status, "query status change");
        entry.status = status;
        entry.status_message = message;
        Ok(())
    }

    pub fn remove(&mut self, id: QueryId) -> Option<QueryCatalogEntry> {
        self.entries.remove(&id)
    }
}

/// A registered user-defined function: an opaque descriptor the compiler hands through to
/// the execution backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdfDescriptor {
    pub name: String,
    /// Serialized implementation reference, e.g. a class name or wasm module id.
    pub implementation: String,
}

#[derive(Clone, Debug, Default)]
pub struct UdfCatalog {
    functions: BTreeMap<String, UdfDescriptor>,
}

impl UdfCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, implementation: impl Into<String>) {
        let name = name.into();
        self.functions.insert(
            name.clone(),
            UdfDescriptor {
                name,
                implementation: implementation.into(),
            },
        );
    }

    pub fn descriptor(&self, name: &str) -> Option<&UdfDescriptor> {
        self.functions.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::expr::{col, lit};
    use crate::plan::operator::SinkDescriptor;
    use crate::plan::schema::PhysicalType;
    use crate::plan::Query;
    use pretty_assertions::assert_eq;

    #[test]
    fn physical_sources_resolve_to_nodes() -> crate::Result<()> {
        let mut catalog = SourceCatalog::new();
        catalog.register("cars", Schema::new().with_field("id", PhysicalType::UInt64));
        catalog.add_physical("cars", OriginId(1), TopologyNodeId::new(7))?;
        catalog.add_physical("cars", OriginId(2), TopologyNodeId::new(8))?;
        assert_eq!(
            catalog.nodes_for("cars")?,
            vec![TopologyNodeId::new(7), TopologyNodeId::new(8)]
        );
        assert!(catalog.nodes_for("bikes").is_err());
        Ok(())
    }

    #[test]
    fn query_lifecycle_is_recorded() -> crate::Result<()> {
        let plan = Query::from_source(
            "cars",
            Schema::new().with_field("id", PhysicalType::UInt64),
        )
        .filter(col("id").lt(lit(5u64)))
        .sink(SinkDescriptor::Collect)?;

        let mut catalog = QueryCatalog::new();
        let id = catalog.register(plan);
        assert_eq!(catalog.status(id)?, QueryStatus::Registered);
        catalog.set_status(id, QueryStatus::Running)?;
        assert_eq!(catalog.status(id)?, QueryStatus::Running);
        catalog.mark_failed(id, "placement failed")?;
        assert_eq!(catalog.status(id)?, QueryStatus::Failed);
        assert_eq!(
            catalog.entry(id)?.status_message.as_deref(),
            Some("placement failed")
        );
        Ok(())
    }
}
