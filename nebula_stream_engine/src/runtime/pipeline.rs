// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Executable pipeline stages.
//!
//! The pipeline generator ("code generation" in this engine) turns each pipeline of a
//! [`PipelinePlan`] into one stage: a scan/transform/emit processor, a windowed
//! aggregation, a join, or a sink binding. Every stage follows the
//! `setup / execute(buffer, ctx, worker) / stop` contract; `execute` consumes one buffer
//! synchronously and hands output buffers to the stage context, which the driver routes to
//! successor stages. Within one origin the driver is a FIFO, preserving input order.

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::catalog::OriginId;
use crate::config::{EngineConfig, MemoryLayoutPolicy};
use crate::optimizer::pipelining::{PipelinePlan, PipelineStageId};
use crate::plan::expr::Expression;
use crate::plan::operator::{
    LogicalOperator, ProjectionField, SinkDescriptor, TimeCharacteristic, WatermarkStrategy,
    WindowDefinition,
};
use crate::plan::schema::Schema;
use crate::plan::value::Value;
use crate::plan::{LogicalPlan, OperatorId};
use crate::runtime::aggregate::{AggregateFunction, AggregateLayout};
use crate::runtime::buffer::{BufferManager, TupleBuffer};
use crate::runtime::hash_map::{ChainedHashMap, HashMapOptions};
use crate::runtime::join::JoinTriggerAction;
use crate::runtime::layout::{MemoryLayout, RowLayout};
use crate::runtime::slice_store::SliceStore;
use crate::ErrorKind;

/// Outcome of one stage invocation; errors travel through `crate::Result`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    Ok,
    /// The stage will produce no further output.
    Finished,
}

/// Per-worker execution state: identity and buffer allocation.
pub struct WorkerContext {
    pub worker_id: usize,
    pub buffer_manager: Arc<BufferManager>,
    pub acquisition_timeout: Duration,
}

impl WorkerContext {
    pub fn new(
        worker_id: usize,
        buffer_manager: Arc<BufferManager>,
        acquisition_timeout: Duration,
    ) -> Self {
        Self {
            worker_id,
            buffer_manager,
            acquisition_timeout,
        }
    }

    /// Acquires a pooled buffer within the configured timeout.
    pub fn allocate(&self) -> crate::Result<TupleBuffer> {
        self.buffer_manager
            .get_timeout(self.acquisition_timeout)
            .ok_or_else(|| {
                ErrorKind::CapacityExhausted
                    .with_message("buffer pool exhausted within the acquisition timeout")
            })
    }

    /// Acquires an unpooled buffer, for results wider than the pooled size.
    pub fn allocate_unpooled(&self, size: usize) -> TupleBuffer {
        self.buffer_manager.get_unpooled(size)
    }

    fn clone_buffer(&self, buffer: &TupleBuffer) -> crate::Result<TupleBuffer> {
        // An oversized spill buffer clones to the unpooled tier at its own size.
        let len = buffer.payload().len();
        let mut copy = if len <= self.buffer_manager.buffer_size() {
            self.allocate()?
        } else {
            self.allocate_unpooled(len)
        };
        copy.payload_mut()[..len].copy_from_slice(buffer.payload());
        copy.set_num_tuples(buffer.num_tuples());
        copy.set_origin_id(buffer.origin_id());
        copy.set_watermark(buffer.watermark());
        copy.set_sequence_number(buffer.sequence_number());
        Ok(copy)
    }
}

/// Collects the buffers one invocation emits.
#[derive(Default)]
pub struct StageContext {
    emitted: Vec<TupleBuffer>,
}

impl StageContext {
    pub fn emit(&mut self, buffer: TupleBuffer) {
        self.emitted.push(buffer);
    }
}

/// One compiled pipeline stage.
pub trait PipelineStage: Send {
    fn id(&self) -> PipelineStageId;

    fn setup(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn execute(
        &mut self,
        buffer: TupleBuffer,
        from: Option<PipelineStageId>,
        ctx: &mut StageContext,
        worker: &mut WorkerContext,
    ) -> crate::Result<ExecutionResult>;

    /// Drains remaining state on query stop; stateful stages run a final trigger.
    fn stop(&mut self, ctx: &mut StageContext, worker: &mut WorkerContext) -> crate::Result<()> {
        let _ = (ctx, worker);
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Writes rows into pooled buffers, flushing full ones into the stage context.
///
/// A tuple wider than one pooled buffer spills to the unpooled tier, one tuple per
/// buffer.
struct RowEmitter<'a> {
    layout: &'a MemoryLayout,
    /// Layout addressing the current buffer; set while writing an unpooled spill buffer
    /// whose size differs from the pooled one.
    spill_layout: Option<MemoryLayout>,
    buffer: Option<TupleBuffer>,
    rows_in_buffer: usize,
    capacity: usize,
    watermark: u64,
    origin: OriginId,
    sequence: u64,
}

impl<'a> RowEmitter<'a> {
    fn new(layout: &'a MemoryLayout, origin: OriginId, watermark: u64) -> Self {
        Self {
            layout,
            spill_layout: None,
            buffer: None,
            rows_in_buffer: 0,
            capacity: 0,
            watermark,
            origin,
            sequence: 0,
        }
    }

    fn push(
        &mut self,
        row: &[Value],
        ctx: &mut StageContext,
        worker: &mut WorkerContext,
    ) -> crate::Result<()> {
        if self.buffer.is_none() {
            let pooled = worker.allocate()?;
            self.capacity = self.layout.capacity(pooled.capacity());
            if self.capacity == 0 {
                // The pooled buffer goes straight back; the tuple gets its own
                // unpooled buffer.
                let size = self.layout.payload_for_rows(1);
                self.spill_layout = match self.layout.sized_for(size) {
                    Cow::Borrowed(_) => None,
                    Cow::Owned(resized) => Some(resized),
                };
                self.buffer = Some(worker.allocate_unpooled(size));
                self.capacity = 1;
            } else {
                self.buffer = Some(pooled);
            }
            self.rows_in_buffer = 0;
        }
        let layout = self.spill_layout.as_ref().unwrap_or(self.layout);
        let buffer = self.buffer.as_mut().expect("buffer present");
        layout.write_row(buffer.payload_mut(), self.rows_in_buffer, row)?;
        self.rows_in_buffer += 1;
        buffer.set_num_tuples(self.rows_in_buffer as u64);
        if self.rows_in_buffer == self.capacity {
            self.flush(ctx);
        }
        Ok(())
    }

    fn flush(&mut self, ctx: &mut StageContext) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.set_origin_id(self.origin);
            buffer.set_watermark(self.watermark);
            buffer.set_sequence_number(self.sequence);
            self.sequence += 1;
            ctx.emit(buffer);
        }
        self.rows_in_buffer = 0;
        self.spill_layout = None;
    }

    /// Emits the trailing partial buffer; emits an empty one if nothing was written, so
    /// the watermark still travels downstream.
    fn finish(
        mut self,
        ctx: &mut StageContext,
        worker: &mut WorkerContext,
    ) -> crate::Result<()> {
        if self.buffer.is_none() {
            self.buffer = Some(worker.allocate()?);
            self.rows_in_buffer = 0;
        }
        self.flush(ctx);
        Ok(())
    }
}

/// One transform of a processor chain, with its schema before and after.
enum Transform {
    Filter(Expression),
    Map {
        target_index: usize,
        appends: bool,
        expr: Expression,
    },
    Project(Vec<ProjectionField>),
    /// Adjusts the outgoing watermark instead of the rows.
    Watermark(WatermarkStrategy),
}

struct CompiledOp {
    transform: Transform,
    input_schema: Schema,
}

/// Where a processor chain delivers its rows.
enum Delivery {
    /// Emit buffers to successor stages.
    Emit,
    Collect(Arc<Mutex<Vec<Vec<Value>>>>),
    Print,
    Discard,
}

/// Scan → transforms → emit, executed row by row over one buffer.
struct ProcessorStage {
    id: PipelineStageId,
    input_schema: Schema,
    input_layout: MemoryLayout,
    ops: Vec<CompiledOp>,
    output_layout: MemoryLayout,
    delivery: Delivery,
}

impl ProcessorStage {
    fn apply(
        &self,
        mut row: Vec<Value>,
        watermark: &mut u64,
        max_event_ts: &mut u64,
    ) -> crate::Result<Option<Vec<Value>>> {
        for op in &self.ops {
            match &op.transform {
                Transform::Filter(predicate) => {
                    if !predicate.evaluate(&op.input_schema, &row)?.as_bool()? {
                        return Ok(None);
                    }
                }
                Transform::Map {
                    target_index,
                    appends,
                    expr,
                } => {
                    let value = expr.evaluate(&op.input_schema, &row)?;
                    if *appends {
                        row.push(value);
                    } else {
                        row[*target_index] = value;
                    }
                }
                Transform::Project(fields) => {
                    let mut projected = Vec::with_capacity(fields.len());
                    for field in fields {
                        projected.push(field.expr.evaluate(&op.input_schema, &row)?);
                    }
                    row = projected;
                }
                Transform::Watermark(strategy) => match strategy {
                    WatermarkStrategy::EventTime {
                        field,
                        allowed_lateness_ms,
                    } => {
                        let index = op.input_schema.index_of(field).ok_or_else(|| {
                            ErrorKind::SchemaMismatch
                                .with_message(format!("unknown field: {field}"))
                        })?;
                        let ts = row[index].as_u64()?;
                        *max_event_ts = (*max_event_ts).max(ts);
                        *watermark =
                            (*watermark).max(max_event_ts.saturating_sub(*allowed_lateness_ms));
                    }
                    WatermarkStrategy::IngestionTime => {
                        *watermark = (*watermark).max(now_ms());
                    }
                },
            }
        }
        Ok(Some(row))
    }
}

impl PipelineStage for ProcessorStage {
    fn id(&self) -> PipelineStageId {
        self.id
    }

    fn execute(
        &mut self,
        buffer: TupleBuffer,
        _from: Option<PipelineStageId>,
        ctx: &mut StageContext,
        worker: &mut WorkerContext,
    ) -> crate::Result<ExecutionResult> {
        let mut watermark = buffer.watermark();
        let mut max_event_ts = 0;
        let fields = self.input_schema.len();
        let input_layout = self.input_layout.sized_for(buffer.payload().len());
        let mut rows_out: Vec<Vec<Value>> = Vec::new();
        for index in 0..buffer.num_tuples() as usize {
            let row = input_layout.read_row(buffer.payload(), index, fields);
            if let Some(row) = self.apply(row, &mut watermark, &mut max_event_ts)? {
                rows_out.push(row);
            }
        }
        match &self.delivery {
            Delivery::Emit => {
                let mut emitter =
                    RowEmitter::new(&self.output_layout, buffer.origin_id(), watermark);
                for row in &rows_out {
                    emitter.push(row, ctx, worker)?;
                }
                emitter.finish(ctx, worker)?;
            }
            Delivery::Collect(rows) => {
                rows.lock().expect("sink lock").extend(rows_out);
            }
            Delivery::Print => {
                for row in &rows_out {
                    tracing::info!(stage = %self.id, row = %format_row(row), "sink");
                }
            }
            Delivery::Discard => {}
        }
        Ok(ExecutionResult::Ok)
    }
}

fn format_row(row: &[Value]) -> String {
    let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
    format!("({})", fields.join(", "))
}

/// Per-slice aggregation state: one hash map per worker thread.
struct AggregationSliceState {
    maps: Vec<ChainedHashMap>,
}

impl AggregationSliceState {
    fn new(workers: usize, options: HashMapOptions) -> Self {
        Self {
            maps: (0..workers).map(|_| ChainedHashMap::new(options)).collect(),
        }
    }
}

/// Keyed windowed aggregation: lift on insert, combine and lower on trigger.
struct WindowStage {
    id: PipelineStageId,
    definition: WindowDefinition,
    input_schema: Schema,
    input_layout: MemoryLayout,
    key_indexes: Vec<usize>,
    key_schema: Schema,
    key_layout: RowLayout,
    aggregate_layout: AggregateLayout,
    /// Input field per aggregate; count reads no field and lifts a constant.
    aggregate_inputs: Vec<Option<usize>>,
    ts_index: Option<usize>,
    output_schema: Schema,
    output_layout: MemoryLayout,
    store: SliceStore<AggregationSliceState>,
    map_options: HashMapOptions,
    num_workers: usize,
    origin: OriginId,
}

impl WindowStage {
    fn effective_ts(&self, row: &[Value]) -> crate::Result<u64> {
        match self.ts_index {
            Some(index) => row[index].as_u64(),
            None => Ok(now_ms()),
        }
    }

    fn trigger(
        &mut self,
        to: u64,
        ctx: &mut StageContext,
        worker: &mut WorkerContext,
    ) -> crate::Result<()> {
        if to <= self.store.last_watermark() {
            return Ok(());
        }
        let windows = self.store.triggerable_windows(to);
        tracing::debug!(stage = %self.id, to, windows = windows.len(), "window trigger");
        let mut emitter = RowEmitter::new(&self.output_layout, self.origin, to);
        for (start, end) in windows {
            // Combine the per-worker maps of every slice the window covers.
            let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            for slice in self.store.slices_in_window(start, end) {
                for map in &slice.state().maps {
                    for (key, value) in map.iter() {
                        match merged.get_mut(key) {
                            Some(blob) => self.aggregate_layout.combine(blob, value)?,
                            None => {
                                merged.insert(key.to_vec(), value.to_vec());
                            }
                        }
                    }
                }
            }
            for (key_bytes, blob) in merged {
                let mut row = vec![Value::UInt(start), Value::UInt(end)];
                row.extend(self.key_layout.read_row_values(&key_bytes, self.key_schema.len()));
                for (index, lowered) in self.aggregate_layout.lower(&blob).into_iter().enumerate()
                {
                    let field = 2 + self.key_schema.len() + index;
                    let null = Value::zero_of(self.output_schema.fields()[field].data_type);
                    row.push(lowered.unwrap_or(null));
                }
                emitter.push(&row, ctx, worker)?;
            }
        }
        emitter.finish(ctx, worker)?;
        self.store.advance_last_watermark(to);
        self.store.gc(to);
        Ok(())
    }
}

impl PipelineStage for WindowStage {
    fn id(&self) -> PipelineStageId {
        self.id
    }

    fn execute(
        &mut self,
        buffer: TupleBuffer,
        _from: Option<PipelineStageId>,
        ctx: &mut StageContext,
        worker: &mut WorkerContext,
    ) -> crate::Result<ExecutionResult> {
        let fields = self.input_schema.len();
        let worker_id = worker.worker_id % self.num_workers;
        let input_layout = self.input_layout.sized_for(buffer.payload().len());
        for index in 0..buffer.num_tuples() as usize {
            let row = input_layout.read_row(buffer.payload(), index, fields);
            let ts = self.effective_ts(&row)?;
            let key_values: Vec<Value> =
                self.key_indexes.iter().map(|i| row[*i].clone()).collect();
            let mut key_bytes = vec![0u8; self.key_layout.tuple_size()];
            for (field, value) in key_values.iter().enumerate() {
                self.key_layout.write_value(&mut key_bytes, 0, field, value)?;
            }
            let inputs: Vec<Value> = self
                .aggregate_inputs
                .iter()
                .map(|input| match input {
                    Some(i) => row[*i].clone(),
                    None => Value::UInt(1),
                })
                .collect();
            let (num_workers, options) = (self.num_workers, self.map_options);
            let Some(slice) = self.store.slice_for_insert(ts, buffer.origin_id(), || {
                AggregationSliceState::new(num_workers, options)
            }) else {
                continue;
            };
            let map = &mut slice.state_mut().maps[worker_id];
            let (slot, _) = map.find_or_insert(&key_bytes);
            self.aggregate_layout.lift(map.value_mut(slot), &inputs)?;
        }

        let watermark = match self.definition.descriptor.time {
            TimeCharacteristic::EventTime { .. } => buffer.watermark(),
            TimeCharacteristic::IngestionTime => now_ms(),
        };
        if watermark > 0 && self.store.update_watermark(buffer.origin_id(), watermark) {
            let to = self.store.min_watermark();
            self.trigger(to, ctx, worker)?;
        }
        Ok(ExecutionResult::Ok)
    }

    fn stop(&mut self, ctx: &mut StageContext, worker: &mut WorkerContext) -> crate::Result<()> {
        // Final flush: everything observed becomes triggerable.
        let horizon = self.store.all_max_ts() + self.definition.descriptor.window_type.size_ms();
        self.trigger(horizon, ctx, worker)
    }
}

/// Window-aligned two-input join.
struct JoinStage {
    id: PipelineStageId,
    action: JoinTriggerAction,
    left_feeders: Vec<PipelineStageId>,
    left_schema: Schema,
    left_layout: MemoryLayout,
    left_ts: Option<usize>,
    right_schema: Schema,
    right_layout: MemoryLayout,
    right_ts: Option<usize>,
    output_layout: MemoryLayout,
    origin: OriginId,
}

impl JoinStage {
    fn emit_results(
        &self,
        results: Vec<crate::runtime::join::JoinResult>,
        watermark: u64,
        ctx: &mut StageContext,
        worker: &mut WorkerContext,
    ) -> crate::Result<()> {
        let mut emitter = RowEmitter::new(&self.output_layout, self.origin, watermark);
        for result in &results {
            emitter.push(&result.row, ctx, worker)?;
        }
        emitter.finish(ctx, worker)
    }
}

impl PipelineStage for JoinStage {
    fn id(&self) -> PipelineStageId {
        self.id
    }

    fn execute(
        &mut self,
        buffer: TupleBuffer,
        from: Option<PipelineStageId>,
        ctx: &mut StageContext,
        worker: &mut WorkerContext,
    ) -> crate::Result<ExecutionResult> {
        let from = from.ok_or_else(|| {
            ErrorKind::InternalError.with_message("join stage received an unrouted buffer")
        })?;
        let is_left = self.left_feeders.contains(&from);
        let (schema, layout, ts_index) = if is_left {
            (&self.left_schema, &self.left_layout, self.left_ts)
        } else {
            (&self.right_schema, &self.right_layout, self.right_ts)
        };
        let fields = schema.len();
        let layout = layout.sized_for(buffer.payload().len());
        for index in 0..buffer.num_tuples() as usize {
            let row = layout.read_row(buffer.payload(), index, fields);
            let ts = match ts_index {
                Some(i) => row[i].as_u64()?,
                None => now_ms(),
            };
            if is_left {
                self.action.insert_left(row, ts, buffer.origin_id());
            } else {
                self.action.insert_right(row, ts, buffer.origin_id());
            }
        }
        let watermark = buffer.watermark();
        if watermark > 0 {
            if is_left {
                self.action.left().update_watermark(buffer.origin_id(), watermark);
            } else {
                self.action.right().update_watermark(buffer.origin_id(), watermark);
            }
            let results = self.action.trigger();
            let advanced_to = self.action.last_watermark();
            if !results.is_empty() || advanced_to > 0 {
                self.emit_results(results, advanced_to, ctx, worker)?;
            }
        }
        Ok(ExecutionResult::Ok)
    }

    fn stop(&mut self, ctx: &mut StageContext, worker: &mut WorkerContext) -> crate::Result<()> {
        let results = self.action.flush();
        let watermark = self.action.last_watermark();
        self.emit_results(results, watermark, ctx, worker)
    }
}

/// The compiled, runnable form of one shared query plan.
pub struct ExecutableQueryPlan {
    stages: Vec<Box<dyn PipelineStage>>,
    successors: BTreeMap<PipelineStageId, Vec<PipelineStageId>>,
    /// Scan stages by source name.
    entries: BTreeMap<String, Vec<PipelineStageId>>,
    /// Collected rows per collect-sink operator.
    collected: BTreeMap<OperatorId, Arc<Mutex<Vec<Vec<Value>>>>>,
    stopped: bool,
}

impl ExecutableQueryPlan {
    /// Generates executable stages for every pipeline of the plan.
    ///
    /// The generator is deterministic: the same logical plan and configuration produce the
    /// same stage ids and the same stage order.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn compile(
        plan: &LogicalPlan,
        pipelines: &PipelinePlan,
        config: &EngineConfig,
    ) -> crate::Result<Self> {
        let policy = config.memory_layout_policy;
        let buffer_size = config.buffer_size_in_bytes;
        let mut stages: Vec<Box<dyn PipelineStage>> = Vec::new();
        let mut successors = BTreeMap::new();
        let mut entries: BTreeMap<String, Vec<PipelineStageId>> = BTreeMap::new();
        let mut collected = BTreeMap::new();

        for pipeline in pipelines.pipelines() {
            successors.insert(pipeline.id, pipeline.successors.clone());
            let first = plan.node(pipeline.operators[0])?;
            let stage: Box<dyn PipelineStage> = match &first.operator {
                LogicalOperator::Window(definition) => Box::new(build_window_stage(
                    pipeline.id,
                    definition,
                    plan,
                    first,
                    policy,
                    buffer_size,
                    config.num_worker_threads,
                )?),
                LogicalOperator::Join(definition) => {
                    let left_child = first.children[0];
                    let left_feeders = pipelines
                        .pipeline_of(left_child)
                        .map(|p| vec![p.id])
                        .unwrap_or_default();
                    Box::new(build_join_stage(
                        pipeline.id,
                        definition.clone(),
                        plan,
                        first,
                        left_feeders,
                        policy,
                        buffer_size,
                    )?)
                }
                _ => {
                    let (stage, sink) = build_processor_stage(
                        pipeline.id,
                        &pipeline.operators,
                        plan,
                        policy,
                        buffer_size,
                    )?;
                    if let Some((operator, rows)) = sink {
                        collected.insert(operator, rows);
                    }
                    if let LogicalOperator::Source { name, .. } = &first.operator {
                        entries.entry(name.clone()).or_default().push(pipeline.id);
                    }
                    stage
                }
            };
            stages.push(stage);
        }

        for stage in &mut stages {
            stage.setup()?;
        }

        Ok(Self {
            stages,
            successors,
            entries,
            collected,
            stopped: false,
        })
    }

    /// Stage ids consuming the named source's buffers.
    pub fn entry_stages(&self, source: &str) -> &[PipelineStageId] {
        self.entries
            .get(source)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    /// Rows gathered by a collect sink.
    pub fn collected_rows(&self, sink: OperatorId) -> Vec<Vec<Value>> {
        self.collected
            .get(&sink)
            .map(|rows| rows.lock().expect("sink lock").clone())
            .unwrap_or_default()
    }

    /// All collect sinks, in operator order.
    pub fn collect_sinks(&self) -> Vec<OperatorId> {
        self.collected.keys().copied().collect()
    }

    fn stage_index(&self, id: PipelineStageId) -> crate::Result<usize> {
        self.stages
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| {
                ErrorKind::InternalError.with_message(format!("unknown stage {id}"))
            })
    }

    /// Injects one source buffer and drives the stage graph to quiescence.
    pub fn inject(
        &mut self,
        source: &str,
        buffer: TupleBuffer,
        worker: &mut WorkerContext,
    ) -> crate::Result<()> {
        if self.stopped {
            return Ok(());
        }
        let entry_ids: Vec<PipelineStageId> = self.entry_stages(source).to_vec();
        if entry_ids.is_empty() {
            return Err(ErrorKind::InvalidQueryPlan
                .with_message(format!("plan consumes no source named {source}")));
        }
        let mut queue: VecDeque<(PipelineStageId, Option<PipelineStageId>, TupleBuffer)> =
            VecDeque::new();
        // The last consumer takes the original buffer; earlier ones get copies.
        for id in entry_ids.iter().take(entry_ids.len() - 1) {
            queue.push_back((*id, None, worker.clone_buffer(&buffer)?));
        }
        queue.push_back((*entry_ids.last().expect("non-empty"), None, buffer));
        self.drain(queue, worker)
    }

    fn drain(
        &mut self,
        mut queue: VecDeque<(PipelineStageId, Option<PipelineStageId>, TupleBuffer)>,
        worker: &mut WorkerContext,
    ) -> crate::Result<()> {
        while let Some((target, from, buffer)) = queue.pop_front() {
            let index = self.stage_index(target)?;
            let mut ctx = StageContext::default();
            let result = self.stages[index].execute(buffer, from, &mut ctx, worker)?;
            if result == ExecutionResult::Finished {
                tracing::debug!(stage = %target, "stage finished");
            }
            self.route(target, ctx, &mut queue, worker)?;
        }
        Ok(())
    }

    fn route(
        &self,
        from: PipelineStageId,
        ctx: StageContext,
        queue: &mut VecDeque<(PipelineStageId, Option<PipelineStageId>, TupleBuffer)>,
        worker: &mut WorkerContext,
    ) -> crate::Result<()> {
        let successors = self.successors.get(&from).cloned().unwrap_or_default();
        for buffer in ctx.emitted {
            match successors.as_slice() {
                [] => {}
                [only] => queue.push_back((*only, Some(from), buffer)),
                many => {
                    for target in &many[..many.len() - 1] {
                        queue.push_back((*target, Some(from), worker.clone_buffer(&buffer)?));
                    }
                    queue.push_back((*many.last().expect("non-empty"), Some(from), buffer));
                }
            }
        }
        Ok(())
    }

    /// Stops the query: every stage drains its in-flight state in dependency order and
    /// the emitted flush buffers run through the remainder of the graph.
    pub fn stop(&mut self, worker: &mut WorkerContext) -> crate::Result<()> {
        if self.stopped {
            return Ok(());
        }
        let ids: Vec<PipelineStageId> = self.stages.iter().map(|s| s.id()).collect();
        for id in ids {
            let index = self.stage_index(id)?;
            let mut ctx = StageContext::default();
            self.stages[index].stop(&mut ctx, worker)?;
            let mut queue = VecDeque::new();
            self.route(id, ctx, &mut queue, worker)?;
            self.drain(queue, worker)?;
        }
        self.stopped = true;
        Ok(())
    }
}

fn layout_for(policy: MemoryLayoutPolicy, schema: &Schema, buffer_size: usize) -> MemoryLayout {
    MemoryLayout::of(policy, schema, buffer_size)
}

fn build_processor_stage(
    id: PipelineStageId,
    operators: &[OperatorId],
    plan: &LogicalPlan,
    policy: MemoryLayoutPolicy,
    buffer_size: usize,
) -> crate::Result<(Box<dyn PipelineStage>, Option<(OperatorId, Arc<Mutex<Vec<Vec<Value>>>>)>)> {
    let first = plan.node(operators[0])?;
    let input_schema = if first.operator.is_source() {
        first.output_schema.clone()
    } else {
        let child = first.children.first().copied().ok_or_else(|| {
            ErrorKind::CompilationFailed
                .with_message(format!("{} has no input", first.operator.kind()))
        })?;
        plan.node(child)?.output_schema.clone()
    };

    let mut ops = Vec::new();
    let mut delivery = Delivery::Emit;
    let mut sink_binding = None;
    let mut current_schema = input_schema.clone();
    let mut output_schema = input_schema.clone();
    for operator in operators {
        let node = plan.node(*operator)?;
        match &node.operator {
            LogicalOperator::Source { .. } => {
                if operator != &operators[0] {
                    return Err(ErrorKind::CompilationFailed
                        .with_message("source in the middle of a pipeline"));
                }
            }
            LogicalOperator::Union => {
                // Pass-through merge of union-compatible inputs.
            }
            LogicalOperator::Filter { predicate } => {
                ops.push(CompiledOp {
                    transform: Transform::Filter(predicate.clone()),
                    input_schema: current_schema.clone(),
                });
            }
            LogicalOperator::Map { field, expr } => {
                let target_index = current_schema.index_of(field);
                ops.push(CompiledOp {
                    transform: Transform::Map {
                        target_index: target_index.unwrap_or(current_schema.len()),
                        appends: target_index.is_none(),
                        expr: expr.clone(),
                    },
                    input_schema: current_schema.clone(),
                });
            }
            LogicalOperator::Projection { fields } => {
                ops.push(CompiledOp {
                    transform: Transform::Project(fields.clone()),
                    input_schema: current_schema.clone(),
                });
            }
            LogicalOperator::WatermarkAssigner(strategy) => {
                ops.push(CompiledOp {
                    transform: Transform::Watermark(strategy.clone()),
                    input_schema: current_schema.clone(),
                });
            }
            LogicalOperator::Sink(descriptor) => {
                delivery = match descriptor {
                    SinkDescriptor::Collect => {
                        let rows = Arc::new(Mutex::new(Vec::new()));
                        sink_binding = Some((*operator, Arc::clone(&rows)));
                        Delivery::Collect(rows)
                    }
                    SinkDescriptor::Print => Delivery::Print,
                    SinkDescriptor::Null => Delivery::Discard,
                };
            }
            other => {
                return Err(ErrorKind::CompilationFailed.with_message(format!(
                    "operator {} cannot run inside a scan pipeline",
                    other.kind()
                )))
            }
        }
        current_schema = node.output_schema.clone();
        if !node.operator.is_sink() {
            output_schema = node.output_schema.clone();
        }
    }

    let stage = ProcessorStage {
        id,
        input_layout: layout_for(policy, &input_schema, buffer_size),
        input_schema,
        ops,
        output_layout: layout_for(policy, &output_schema, buffer_size),
        delivery,
    };
    Ok((Box::new(stage), sink_binding))
}

fn build_window_stage(
    id: PipelineStageId,
    definition: &WindowDefinition,
    plan: &LogicalPlan,
    node: &crate::plan::OperatorNode,
    policy: MemoryLayoutPolicy,
    buffer_size: usize,
    num_workers: usize,
) -> crate::Result<WindowStage> {
    let child = node.children.first().copied().ok_or_else(|| {
        ErrorKind::CompilationFailed.with_message("window operator has no input")
    })?;
    let input_schema = plan.node(child)?.output_schema.clone();
    let output_schema = node.output_schema.clone();

    let mut key_indexes = Vec::new();
    let mut key_schema = Schema::new();
    for key in &definition.keys {
        let index = input_schema.index_of(key).ok_or_else(|| {
            ErrorKind::CompilationFailed.with_message(format!("unknown key field: {key}"))
        })?;
        key_indexes.push(index);
        let field = &input_schema.fields()[index];
        key_schema = key_schema.with_field(field.name.clone(), field.data_type);
    }

    let mut functions = Vec::new();
    let mut aggregate_inputs = Vec::new();
    for aggregation in &definition.aggregations {
        let input_index = match aggregation.kind {
            crate::plan::operator::AggregationKind::Count => None,
            _ => Some(input_schema.index_of(&aggregation.field).ok_or_else(|| {
                ErrorKind::CompilationFailed
                    .with_message(format!("unknown aggregation field: {}", aggregation.field))
            })?),
        };
        let input_type = match input_index {
            Some(index) => input_schema.fields()[index].data_type,
            None => crate::plan::schema::PhysicalType::UInt64,
        };
        functions.push(AggregateFunction::new(aggregation.kind, input_type)?);
        aggregate_inputs.push(input_index);
    }
    let aggregate_layout = AggregateLayout::new(functions);

    let ts_index = match &definition.descriptor.time {
        TimeCharacteristic::EventTime { field } => {
            Some(input_schema.index_of(field).ok_or_else(|| {
                ErrorKind::CompilationFailed
                    .with_message(format!("unknown timestamp field: {field}"))
            })?)
        }
        TimeCharacteristic::IngestionTime => None,
    };

    let key_layout = RowLayout::new(&key_schema);
    let map_options = HashMapOptions::for_expected_keys(
        1024,
        key_layout.tuple_size(),
        aggregate_layout.total_size(),
        4096,
    );
    Ok(WindowStage {
        id,
        definition: definition.clone(),
        input_layout: layout_for(policy, &input_schema, buffer_size),
        input_schema,
        key_indexes,
        key_schema,
        key_layout,
        aggregate_layout,
        aggregate_inputs,
        ts_index,
        output_layout: layout_for(policy, &output_schema, buffer_size),
        output_schema,
        store: SliceStore::new(definition.descriptor.clone()),
        map_options,
        num_workers: num_workers.max(1),
        origin: OriginId(id.as_u32() as u64),
    })
}

fn build_join_stage(
    id: PipelineStageId,
    definition: crate::plan::operator::JoinDefinition,
    plan: &LogicalPlan,
    node: &crate::plan::OperatorNode,
    left_feeders: Vec<PipelineStageId>,
    policy: MemoryLayoutPolicy,
    buffer_size: usize,
) -> crate::Result<JoinStage> {
    if node.children.len() != 2 {
        return Err(ErrorKind::CompilationFailed.with_message("join requires two inputs"));
    }
    let left_schema = plan.node(node.children[0])?.output_schema.clone();
    let right_schema = plan.node(node.children[1])?.output_schema.clone();
    let output_schema = node.output_schema.clone();
    let ts_of = |schema: &Schema| match &definition.window.time {
        TimeCharacteristic::EventTime { field } => schema.index_of(field),
        TimeCharacteristic::IngestionTime => None,
    };
    let left_ts = ts_of(&left_schema);
    let right_ts = ts_of(&right_schema);
    let action = JoinTriggerAction::new(definition, &left_schema, &right_schema)?;
    Ok(JoinStage {
        id,
        left_feeders,
        left_ts,
        left_layout: layout_for(policy, &left_schema, buffer_size),
        left_schema,
        right_ts,
        right_layout: layout_for(policy, &right_schema, buffer_size),
        right_schema,
        output_layout: layout_for(policy, &output_schema, buffer_size),
        origin: OriginId(id.as_u32() as u64),
        action,
    })
}
