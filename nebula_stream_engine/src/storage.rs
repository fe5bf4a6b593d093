// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Two-phase-locked access to the coordinator's shared structures.
//!
//! A request declares up front which resources it touches and in which mode. The handler
//! acquires all declared locks together, in one canonical total order, which makes the
//! scheme deadlock-free; accessing an undeclared resource is an error. Read-only requests
//! take shared locks and run concurrently; writers take exclusive locks. Locks release
//! together when the handler drops (the shrinking phase).

use std::ops::Deref;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::catalog::{QueryCatalog, SourceCatalog, UdfCatalog};
use crate::optimizer::global_plan::GlobalQueryPlan;
use crate::optimizer::placement::GlobalExecutionPlan;
use crate::topology::Topology;
use crate::ErrorKind;

/// The lockable resources, in canonical acquisition order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceType {
    Topology,
    GlobalExecutionPlan,
    QueryCatalog,
    GlobalQueryPlan,
    SourceCatalog,
    UdfCatalog,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ResourceType::Topology => "topology",
            ResourceType::GlobalExecutionPlan => "global execution plan",
            ResourceType::QueryCatalog => "query catalog",
            ResourceType::GlobalQueryPlan => "global query plan",
            ResourceType::SourceCatalog => "source catalog",
            ResourceType::UdfCatalog => "udf catalog",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
enum Guard<'a, T> {
    Shared(RwLockReadGuard<'a, T>),
    Exclusive(RwLockWriteGuard<'a, T>),
}

impl<'a, T> Deref for Guard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Guard::Shared(guard) => guard,
            Guard::Exclusive(guard) => guard,
        }
    }
}

impl<'a, T> Guard<'a, T> {
    fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Guard::Shared(_) => None,
            Guard::Exclusive(guard) => Some(&mut *guard),
        }
    }
}

/// Owner of the shared coordinator structures.
#[derive(Default)]
pub struct StorageManager {
    topology: RwLock<Topology>,
    execution_plan: RwLock<GlobalExecutionPlan>,
    query_catalog: RwLock<QueryCatalog>,
    global_query_plan: RwLock<GlobalQueryPlan>,
    source_catalog: RwLock<SourceCatalog>,
    udf_catalog: RwLock<UdfCatalog>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the declared resources and returns the handle bundle.
    ///
    /// Duplicate declarations are rejected; the declared set is sorted into the canonical
    /// order before any lock is taken.
    pub fn handler(
        &self,
        declared: &[(ResourceType, AccessMode)],
    ) -> crate::Result<StorageHandler<'_>> {
        let mut declared = declared.to_vec();
        declared.sort_by_key(|(resource, _)| *resource);
        for window in declared.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(ErrorKind::ResourceUndeclared
                    .with_message(format!("{} declared twice", window[0].0)));
            }
        }

        let mut handler = StorageHandler {
            topology: None,
            execution_plan: None,
            query_catalog: None,
            global_query_plan: None,
            source_catalog: None,
            udf_catalog: None,
        };
        for (resource, mode) in declared {
            tracing::trace!(%resource, ?mode, "acquiring resource");
            match resource {
                ResourceType::Topology => {
                    handler.topology = Some(lock(&self.topology, mode));
                }
                ResourceType::GlobalExecutionPlan => {
                    handler.execution_plan = Some(lock(&self.execution_plan, mode));
                }
                ResourceType::QueryCatalog => {
                    handler.query_catalog = Some(lock(&self.query_catalog, mode));
                }
                ResourceType::GlobalQueryPlan => {
                    handler.global_query_plan = Some(lock(&self.global_query_plan, mode));
                }
                ResourceType::SourceCatalog => {
                    handler.source_catalog = Some(lock(&self.source_catalog, mode));
                }
                ResourceType::UdfCatalog => {
                    handler.udf_catalog = Some(lock(&self.udf_catalog, mode));
                }
            }
        }
        Ok(handler)
    }
}

fn lock<T>(resource: &RwLock<T>, mode: AccessMode) -> Guard<'_, T> {
    match mode {
        AccessMode::Shared => Guard::Shared(resource.read().expect("resource lock")),
        AccessMode::Exclusive => Guard::Exclusive(resource.write().expect("resource lock")),
    }
}

fn undeclared<T>(resource: ResourceType) -> crate::Result<T> {
    Err(ErrorKind::ResourceUndeclared
        .with_message(format!("request did not declare the {resource}")))
}

fn not_exclusive<T>(resource: ResourceType) -> crate::Result<T> {
    Err(ErrorKind::ResourceUndeclared
        .with_message(format!("request holds the {resource} in shared mode")))
}

macro_rules! resource_accessors {
    ($field:ident, $get:ident, $get_mut:ident, $ty:ty, $resource:expr) => {
        pub fn $get(&self) -> crate::Result<&$ty> {
            match &self.$field {
                Some(guard) => Ok(guard.deref()),
                None => undeclared($resource),
            }
        }

        pub fn $get_mut(&mut self) -> crate::Result<&mut $ty> {
            match &mut self.$field {
                Some(guard) => guard.get_mut().map_or_else(|| not_exclusive($resource), Ok),
                None => undeclared($resource),
            }
        }
    };
}

/// The typed handles of one request. Dropping the handler releases every lock.
#[derive(Debug)]
pub struct StorageHandler<'a> {
    topology: Option<Guard<'a, Topology>>,
    execution_plan: Option<Guard<'a, GlobalExecutionPlan>>,
    query_catalog: Option<Guard<'a, QueryCatalog>>,
    global_query_plan: Option<Guard<'a, GlobalQueryPlan>>,
    source_catalog: Option<Guard<'a, SourceCatalog>>,
    udf_catalog: Option<Guard<'a, UdfCatalog>>,
}

impl<'a> StorageHandler<'a> {
    resource_accessors!(topology, topology, topology_mut, Topology, ResourceType::Topology);
    resource_accessors!(
        execution_plan,
        execution_plan,
        execution_plan_mut,
        GlobalExecutionPlan,
        ResourceType::GlobalExecutionPlan
    );
    resource_accessors!(
        query_catalog,
        query_catalog,
        query_catalog_mut,
        QueryCatalog,
        ResourceType::QueryCatalog
    );
    resource_accessors!(
        global_query_plan,
        global_query_plan,
        global_query_plan_mut,
        GlobalQueryPlan,
        ResourceType::GlobalQueryPlan
    );
    resource_accessors!(
        source_catalog,
        source_catalog,
        source_catalog_mut,
        SourceCatalog,
        ResourceType::SourceCatalog
    );
    resource_accessors!(
        udf_catalog,
        udf_catalog,
        udf_catalog_mut,
        UdfCatalog,
        ResourceType::UdfCatalog
    );

    /// The resource bundle of the placement phase, borrowed disjointly.
    pub fn placement_resources(
        &mut self,
    ) -> crate::Result<(&mut Topology, &SourceCatalog, &mut GlobalExecutionPlan)> {
        let topology = match &mut self.topology {
            Some(guard) => match guard.get_mut() {
                Some(topology) => topology,
                None => return not_exclusive(ResourceType::Topology),
            },
            None => return undeclared(ResourceType::Topology),
        };
        let source_catalog = match &self.source_catalog {
            Some(guard) => guard.deref(),
            None => return undeclared(ResourceType::SourceCatalog),
        };
        let execution_plan = match &mut self.execution_plan {
            Some(guard) => match guard.get_mut() {
                Some(plan) => plan,
                None => return not_exclusive(ResourceType::GlobalExecutionPlan),
            },
            None => return undeclared(ResourceType::GlobalExecutionPlan),
        };
        Ok((topology, source_catalog, execution_plan))
    }

    /// The resource pair released on undeployment, borrowed disjointly.
    pub fn undeploy_resources(
        &mut self,
    ) -> crate::Result<(&mut GlobalExecutionPlan, &mut Topology)> {
        let execution_plan = match &mut self.execution_plan {
            Some(guard) => match guard.get_mut() {
                Some(plan) => plan,
                None => return not_exclusive(ResourceType::GlobalExecutionPlan),
            },
            None => return undeclared(ResourceType::GlobalExecutionPlan),
        };
        let topology = match &mut self.topology {
            Some(guard) => match guard.get_mut() {
                Some(topology) => topology,
                None => return not_exclusive(ResourceType::Topology),
            },
            None => return undeclared(ResourceType::Topology),
        };
        Ok((execution_plan, topology))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn undeclared_resources_are_inaccessible() -> crate::Result<()> {
        let manager = StorageManager::new();
        let handler = manager.handler(&[(ResourceType::Topology, AccessMode::Shared)])?;
        assert!(handler.topology().is_ok());
        let err = handler.source_catalog().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUndeclared);
        Ok(())
    }

    #[test]
    fn shared_handles_refuse_mutation() -> crate::Result<()> {
        let manager = StorageManager::new();
        let mut handler = manager.handler(&[(ResourceType::QueryCatalog, AccessMode::Shared)])?;
        assert!(handler.query_catalog().is_ok());
        let err = handler.query_catalog_mut().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUndeclared);
        Ok(())
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let manager = StorageManager::new();
        let err = manager
            .handler(&[
                (ResourceType::Topology, AccessMode::Shared),
                (ResourceType::Topology, AccessMode::Exclusive),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUndeclared);
    }

    #[test]
    fn readers_run_concurrently() -> crate::Result<()> {
        let manager = StorageManager::new();
        let first = manager.handler(&[(ResourceType::Topology, AccessMode::Shared)])?;
        let second = manager.handler(&[(ResourceType::Topology, AccessMode::Shared)])?;
        assert!(first.topology().is_ok());
        assert!(second.topology().is_ok());
        Ok(())
    }

    #[test]
    fn writers_wait_for_the_shrinking_phase() -> crate::Result<()> {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let manager = Arc::new(StorageManager::new());
        let entered = Arc::new(AtomicBool::new(false));
        let reader = manager.handler(&[(ResourceType::GlobalQueryPlan, AccessMode::Shared)])?;

        let writer = {
            let manager = Arc::clone(&manager);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                let mut handler = manager
                    .handler(&[(ResourceType::GlobalQueryPlan, AccessMode::Exclusive)])
                    .expect("handler");
                entered.store(true, Ordering::SeqCst);
                handler.global_query_plan_mut().map(|_| ()).expect("declared");
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst), "writer blocked by the reader");
        drop(reader);
        writer.join().expect("writer");
        assert!(entered.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn mixed_declarations_acquire_in_canonical_order() -> crate::Result<()> {
        let manager = StorageManager::new();
        // Declaration order is irrelevant; acquisition is sorted internally.
        let mut handler = manager.handler(&[
            (ResourceType::UdfCatalog, AccessMode::Exclusive),
            (ResourceType::Topology, AccessMode::Exclusive),
            (ResourceType::GlobalQueryPlan, AccessMode::Shared),
        ])?;
        handler.topology_mut()?.add_root(crate::topology::TopologyNodeId::new(1), "c:0", 1);
        assert!(handler.global_query_plan().is_ok());
        assert!(handler.execution_plan().is_err());
        Ok(())
    }
}
