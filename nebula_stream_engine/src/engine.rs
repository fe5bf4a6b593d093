// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The engine context.
//!
//! An [`Engine`] owns the catalogs, the global query plan, the topology, the buffer pool,
//! and the deployed executables, and drives a submitted query through the optimizer
//! phases: global-query-plan update (merge), placement, and pipeline compilation. All
//! control-plane mutations run under the two-phase storage handler; the data plane runs
//! synchronously on the calling thread.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::catalog::{OriginId, QueryId, QueryStatus};
use crate::config::EngineConfig;
use crate::optimizer::containment::ContainmentChecker;
use crate::optimizer::global_plan::{GlobalQueryPlanUpdatePhase, SharedQueryId};
use crate::optimizer::pipelining::PipelinePlan;
use crate::optimizer::placement::{PlacementStrategy, QueryPlacementPhase};
use crate::plan::schema::Schema;
use crate::plan::value::Value;
use crate::plan::{LogicalPlan, OperatorId};
use crate::runtime::buffer::BufferManager;
use crate::runtime::layout::MemoryLayout;
use crate::runtime::pipeline::{ExecutableQueryPlan, WorkerContext};
use crate::storage::{AccessMode, ResourceType, StorageManager};
use crate::topology::TopologyNodeId;
use crate::ErrorKind;

pub struct Engine {
    config: EngineConfig,
    storage: StorageManager,
    buffer_manager: Arc<BufferManager>,
    update_phase: GlobalQueryPlanUpdatePhase,
    placement_phase: QueryPlacementPhase,
    executables: Mutex<BTreeMap<SharedQueryId, ExecutableQueryPlan>>,
    /// Query → (shared plan, member sink), kept across undeploys for result retrieval.
    sink_index: Mutex<BTreeMap<QueryId, (SharedQueryId, OperatorId)>>,
    sequence_numbers: Mutex<BTreeMap<OriginId, u64>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> crate::Result<Self> {
        config.validate()?;
        let buffer_manager = Arc::new(BufferManager::new(
            config.number_of_buffers_in_global_buffer_manager,
            config.buffer_size_in_bytes,
        ));
        let update_phase = GlobalQueryPlanUpdatePhase::new(
            config.query_merger_rule,
            ContainmentChecker::new(
                Box::new(crate::optimizer::containment::IntervalSolver),
                Duration::from_millis(config.solver_timeout_ms),
            ),
            config.query_batch_size,
        );
        let placement_phase =
            QueryPlacementPhase::new(PlacementStrategy::BottomUp, config.incremental_placement);
        Ok(Self {
            config,
            storage: StorageManager::new(),
            buffer_manager,
            update_phase,
            placement_phase,
            executables: Mutex::new(BTreeMap::new()),
            sink_index: Mutex::new(BTreeMap::new()),
            sequence_numbers: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn worker(&self) -> WorkerContext {
        WorkerContext::new(
            0,
            Arc::clone(&self.buffer_manager),
            Duration::from_millis(self.config.buffer_acquisition_timeout_ms),
        )
    }

    /// Adds the coordinator root to the topology.
    pub fn add_topology_root(
        &self,
        id: TopologyNodeId,
        address: impl Into<String>,
        cpu_slots: u32,
    ) -> crate::Result<()> {
        let mut handler = self
            .storage
            .handler(&[(ResourceType::Topology, AccessMode::Exclusive)])?;
        handler.topology_mut()?.add_root(id, address, cpu_slots);
        Ok(())
    }

    /// Adds a worker node to the topology.
    pub fn add_topology_node(
        &self,
        id: TopologyNodeId,
        address: impl Into<String>,
        cpu_slots: u32,
    ) -> crate::Result<()> {
        let mut handler = self
            .storage
            .handler(&[(ResourceType::Topology, AccessMode::Exclusive)])?;
        handler.topology_mut()?.add_node(id, address, cpu_slots);
        Ok(())
    }

    /// Adds a directed link toward the root.
    pub fn add_topology_link(
        &self,
        source: TopologyNodeId,
        destination: TopologyNodeId,
        bandwidth_mbps: u64,
        latency_ms: u64,
    ) -> crate::Result<()> {
        let mut handler = self
            .storage
            .handler(&[(ResourceType::Topology, AccessMode::Exclusive)])?;
        handler
            .topology_mut()?
            .add_link(source, destination, bandwidth_mbps, latency_ms);
        Ok(())
    }

    /// Registers a logical source with its unqualified schema.
    pub fn register_logical_source(
        &self,
        name: impl Into<String>,
        schema: Schema,
    ) -> crate::Result<()> {
        let mut handler = self
            .storage
            .handler(&[(ResourceType::SourceCatalog, AccessMode::Exclusive)])?;
        handler.source_catalog_mut()?.register(name, schema);
        Ok(())
    }

    /// Attaches a physical emitter of a logical source to a topology node.
    pub fn register_physical_source(
        &self,
        name: &str,
        origin: OriginId,
        node: TopologyNodeId,
    ) -> crate::Result<()> {
        let mut handler = self
            .storage
            .handler(&[(ResourceType::SourceCatalog, AccessMode::Exclusive)])?;
        handler.source_catalog_mut()?.add_physical(name, origin, node)
    }

    /// Submits a query: merge into the global query plan, place, compile, deploy.
    ///
    /// On any phase failure the query is marked failed in the catalog and the error is
    /// returned to the submitter.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn submit_query(&self, plan: LogicalPlan) -> crate::Result<QueryId> {
        let mut handler = self.storage.handler(&[
            (ResourceType::Topology, AccessMode::Exclusive),
            (ResourceType::GlobalExecutionPlan, AccessMode::Exclusive),
            (ResourceType::QueryCatalog, AccessMode::Exclusive),
            (ResourceType::GlobalQueryPlan, AccessMode::Exclusive),
            (ResourceType::SourceCatalog, AccessMode::Shared),
        ])?;

        for source in plan.consumed_sources() {
            handler.source_catalog()?.source(&source)?;
        }

        let query_id = handler.query_catalog_mut()?.register(plan.clone());
        tracing::debug!(query = %query_id, "registered query");
        handler
            .query_catalog_mut()?
            .set_status(query_id, QueryStatus::Optimizing)?;
        handler
            .global_query_plan_mut()?
            .add_query_plan(query_id, plan);

        let outcomes = self.update_phase.execute(handler.global_query_plan_mut()?);
        let mut result = Err(ErrorKind::InternalError
            .with_message("update phase dropped the submitted query"));
        for outcome in outcomes {
            match outcome.result {
                Err(error) => {
                    handler
                        .query_catalog_mut()?
                        .mark_failed(outcome.query, error.to_string())?;
                    if outcome.query == query_id {
                        result = Err(error);
                    }
                }
                Ok(shared_plan) => {
                    let deployed = self.deploy(&mut handler, shared_plan);
                    match deployed {
                        Ok(()) => {
                            let sqp = handler.global_query_plan()?.shared_plan(shared_plan)?;
                            if let Some(sink) = sqp.sink_of(outcome.query) {
                                self.sink_index
                                    .lock()
                                    .expect("sink index lock")
                                    .insert(outcome.query, (shared_plan, sink));
                            }
                            handler
                                .query_catalog_mut()?
                                .set_status(outcome.query, QueryStatus::Running)?;
                            if outcome.query == query_id {
                                result = Ok(query_id);
                            }
                        }
                        Err(error) => {
                            handler
                                .query_catalog_mut()?
                                .mark_failed(outcome.query, error.to_string())?;
                            // The merged-in plan cannot run; take the query back out and
                            // release whatever the partial placement assigned.
                            if let Ok((_, removed, retired)) =
                                handler.global_query_plan_mut()?.remove_query(outcome.query)
                            {
                                let (execution_plan, topology) = handler.undeploy_resources()?;
                                if retired {
                                    execution_plan.remove_shared_plan(shared_plan, topology)?;
                                } else {
                                    execution_plan
                                        .remove_operators(shared_plan, &removed, topology)?;
                                }
                            }
                            if outcome.query == query_id {
                                result = Err(error);
                            }
                        }
                    }
                }
            }
        }
        result
    }

    /// Places and compiles one shared query plan.
    fn deploy(
        &self,
        handler: &mut crate::storage::StorageHandler<'_>,
        shared_plan: SharedQueryId,
    ) -> crate::Result<()> {
        let sqp = handler.global_query_plan()?.shared_plan(shared_plan)?.clone();
        {
            let (topology, source_catalog, execution_plan) = handler.placement_resources()?;
            self.placement_phase
                .execute(&sqp, topology, source_catalog, execution_plan)?;
        }
        let pipelines = PipelinePlan::from_plan(&sqp.plan)?;
        let executable = ExecutableQueryPlan::compile(&sqp.plan, &pipelines, &self.config)?;
        tracing::debug!(shared_plan = %shared_plan, pipelines = pipelines.pipelines().len(), "deployed shared plan");
        // Deploying a merged plan replaces the previous executable of this shared plan;
        // in-flight window state starts fresh, as in a coordinator-driven redeploy.
        self.executables
            .lock()
            .expect("executables lock")
            .insert(shared_plan, executable);
        Ok(())
    }

    /// Stops a query: removes it from its shared plan, releases placement, and when the
    /// last member leaves, drains the executable with a final trigger.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn stop_query(&self, query: QueryId) -> crate::Result<()> {
        let mut handler = self.storage.handler(&[
            (ResourceType::Topology, AccessMode::Exclusive),
            (ResourceType::GlobalExecutionPlan, AccessMode::Exclusive),
            (ResourceType::QueryCatalog, AccessMode::Exclusive),
            (ResourceType::GlobalQueryPlan, AccessMode::Exclusive),
        ])?;
        let (shared_plan, removed, retired) =
            handler.global_query_plan_mut()?.remove_query(query)?;
        {
            let (execution_plan, topology) = handler.undeploy_resources()?;
            if retired {
                execution_plan.remove_shared_plan(shared_plan, topology)?;
            } else {
                execution_plan.remove_operators(shared_plan, &removed, topology)?;
            }
        }
        handler
            .query_catalog_mut()?
            .set_status(query, QueryStatus::Stopped)?;

        let mut worker = self.worker();
        let mut executables = self.executables.lock().expect("executables lock");
        if retired {
            // Final trigger flushes remaining window state into the sinks; the stopped
            // executable stays around so results remain readable.
            if let Some(executable) = executables.get_mut(&shared_plan) {
                executable.stop(&mut worker)?;
            }
        }
        Ok(())
    }

    /// Remaining CPU slots on a topology node, for capacity monitoring.
    pub fn remaining_cpu(&self, node: TopologyNodeId) -> crate::Result<u32> {
        let handler = self
            .storage
            .handler(&[(ResourceType::Topology, AccessMode::Shared)])?;
        handler.topology()?.remaining_cpu(node)
    }

    pub fn query_status(&self, query: QueryId) -> crate::Result<QueryStatus> {
        let handler = self
            .storage
            .handler(&[(ResourceType::QueryCatalog, AccessMode::Shared)])?;
        handler.query_catalog()?.status(query)
    }

    /// Number of shared query plans currently in the global plan.
    pub fn shared_plan_count(&self) -> crate::Result<usize> {
        let handler = self
            .storage
            .handler(&[(ResourceType::GlobalQueryPlan, AccessMode::Shared)])?;
        Ok(handler.global_query_plan()?.shared_plans().count())
    }

    /// Pushes rows of a source into every deployed plan consuming it.
    ///
    /// Rows are packed into pooled buffers using the engine's layout policy; `watermark`
    /// rides on the batch's final buffer and drives the window triggers downstream.
    pub fn ingest(
        &self,
        source: &str,
        rows: &[Vec<Value>],
        origin: OriginId,
        watermark: u64,
    ) -> crate::Result<()> {
        let (schema, plans) = {
            let handler = self.storage.handler(&[
                (ResourceType::GlobalQueryPlan, AccessMode::Shared),
                (ResourceType::SourceCatalog, AccessMode::Shared),
            ])?;
            let schema = handler
                .source_catalog()?
                .source(source)?
                .schema
                .qualified(source);
            (schema, handler.global_query_plan()?.plans_for_source(source))
        };
        if plans.is_empty() {
            return Ok(());
        }
        let layout = MemoryLayout::of(
            self.config.memory_layout_policy,
            &schema,
            self.config.buffer_size_in_bytes,
        );

        let mut worker = self.worker();
        let mut executables = self.executables.lock().expect("executables lock");
        for shared_plan in plans {
            let Some(executable) = executables.get_mut(&shared_plan) else {
                continue;
            };
            for chunk in self.pack(&layout, rows, origin, watermark, &mut worker)? {
                executable.inject(source, chunk, &mut worker)?;
            }
        }
        Ok(())
    }

    /// Packs rows into as many buffers as needed.
    ///
    /// Rows wider than one pooled buffer travel one per unpooled buffer.
    fn pack(
        &self,
        layout: &MemoryLayout,
        rows: &[Vec<Value>],
        origin: OriginId,
        watermark: u64,
        worker: &mut WorkerContext,
    ) -> crate::Result<Vec<crate::runtime::buffer::TupleBuffer>> {
        // Only the batch's final buffer asserts the watermark: records later in the
        // same batch would otherwise arrive behind it and be dropped as late.
        let mut buffers = Vec::new();
        let mut buffer = worker.allocate()?;
        let capacity = layout.capacity(buffer.capacity());
        if capacity == 0 && !rows.is_empty() {
            let size = layout.payload_for_rows(1);
            let sized = layout.sized_for(size);
            for (index, row) in rows.iter().enumerate() {
                let mut unpooled = worker.allocate_unpooled(size);
                sized.write_row(unpooled.payload_mut(), 0, row)?;
                let is_last = index + 1 == rows.len();
                self.seal(&mut unpooled, 1, origin, if is_last { watermark } else { 0 });
                buffers.push(unpooled);
            }
            return Ok(buffers);
        }
        let mut in_buffer = 0;
        for row in rows {
            if in_buffer == capacity {
                self.seal(&mut buffer, in_buffer, origin, 0);
                buffers.push(std::mem::replace(&mut buffer, worker.allocate()?));
                in_buffer = 0;
            }
            layout.write_row(buffer.payload_mut(), in_buffer, row)?;
            in_buffer += 1;
        }
        self.seal(&mut buffer, in_buffer, origin, watermark);
        buffers.push(buffer);
        Ok(buffers)
    }

    fn seal(
        &self,
        buffer: &mut crate::runtime::buffer::TupleBuffer,
        rows: usize,
        origin: OriginId,
        watermark: u64,
    ) {
        let mut sequences = self.sequence_numbers.lock().expect("sequence lock");
        let sequence = sequences.entry(origin).or_insert(0);
        buffer.set_num_tuples(rows as u64);
        buffer.set_origin_id(origin);
        buffer.set_watermark(watermark);
        buffer.set_sequence_number(*sequence);
        *sequence += 1;
    }

    /// Rows collected by a query's collect sink so far.
    pub fn collected_output(&self, query: QueryId) -> crate::Result<Vec<Vec<Value>>> {
        let index = self.sink_index.lock().expect("sink index lock");
        let (shared_plan, sink) = index.get(&query).copied().ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("{query} has no collect sink"))
        })?;
        drop(index);
        let executables = self.executables.lock().expect("executables lock");
        let executable = executables.get(&shared_plan).ok_or_else(|| {
            ErrorKind::InvalidQueryPlan.with_message(format!("{query} is not deployed"))
        })?;
        Ok(executable.collected_rows(sink))
    }
}
