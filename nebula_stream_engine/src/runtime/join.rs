// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The window-aligned join trigger action.
//!
//! Records of both input streams accumulate in per-key slice stores. When the combined
//! watermark advances, every window that closed joins the matching keys' records and emits
//! `(start, end, key, left payload…, right payload…)` tuples. Keys are encoded to a
//! canonical byte form; each key's store sits behind its own mutex so inserts for
//! different keys do not contend, while the store map itself takes a read lock only.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::catalog::OriginId;
use crate::plan::operator::{JoinDefinition, JoinVariant, TimeCharacteristic, WindowDescriptor};
use crate::plan::schema::Schema;
use crate::plan::value::Value;
use crate::runtime::slice_store::SliceStore;
use crate::ErrorKind;

/// Canonical byte encoding of a join key value.
pub fn encode_key(value: &Value) -> Vec<u8> {
    match value {
        Value::Int(v) => {
            let mut bytes = vec![0u8];
            bytes.extend_from_slice(&v.to_le_bytes());
            bytes
        }
        Value::UInt(v) => {
            let mut bytes = vec![1u8];
            bytes.extend_from_slice(&v.to_le_bytes());
            bytes
        }
        Value::Float(v) => {
            let mut bytes = vec![2u8];
            bytes.extend_from_slice(&v.to_bits().to_le_bytes());
            bytes
        }
        Value::Bool(v) => vec![3u8, u8::from(*v)],
        Value::Char(v) => {
            let mut bytes = vec![4u8];
            bytes.extend_from_slice(v);
            bytes
        }
    }
}

type JoinRecord = Vec<Value>;

struct KeyStore {
    key: Value,
    store: SliceStore<Vec<JoinRecord>>,
}

/// One side of the join: per-key slice stores plus side-level watermark tracking.
pub struct JoinSide {
    window: WindowDescriptor,
    stores: RwLock<BTreeMap<Vec<u8>, Arc<Mutex<KeyStore>>>>,
    origin_watermarks: Mutex<BTreeMap<OriginId, u64>>,
}

impl JoinSide {
    fn new(window: WindowDescriptor) -> Self {
        Self {
            window,
            stores: RwLock::new(BTreeMap::new()),
            origin_watermarks: Mutex::new(BTreeMap::new()),
        }
    }

    fn key_store(&self, key: &Value) -> Arc<Mutex<KeyStore>> {
        let encoded = encode_key(key);
        if let Some(store) = self.stores.read().expect("store map lock").get(&encoded) {
            return Arc::clone(store);
        }
        let mut stores = self.stores.write().expect("store map lock");
        Arc::clone(stores.entry(encoded).or_insert_with(|| {
            Arc::new(Mutex::new(KeyStore {
                key: key.clone(),
                store: SliceStore::new(self.window.clone()),
            }))
        }))
    }

    /// Appends a record under its key; late records are dropped and counted.
    pub fn insert(&self, key: &Value, ts: u64, record: JoinRecord, origin: OriginId) {
        let store = self.key_store(key);
        let mut guard = store.lock().expect("key store lock");
        if let Some(slice) = guard.store.slice_for_insert(ts, origin, Vec::new) {
            slice.state_mut().push(record);
        }
    }

    pub fn update_watermark(&self, origin: OriginId, watermark: u64) {
        let mut watermarks = self.origin_watermarks.lock().expect("watermark lock");
        let entry = watermarks.entry(origin).or_insert(0);
        *entry = (*entry).max(watermark);
    }

    /// Minimum watermark across this side's origins; zero before any update.
    pub fn min_watermark(&self) -> u64 {
        self.origin_watermarks
            .lock()
            .expect("watermark lock")
            .values()
            .copied()
            .min()
            .unwrap_or(0)
    }

    pub fn late_records(&self) -> u64 {
        self.stores
            .read()
            .expect("store map lock")
            .values()
            .map(|s| s.lock().expect("key store lock").store.late_records())
            .sum()
    }

    /// Maximum event timestamp observed across this side's keys.
    pub fn all_max_ts(&self) -> u64 {
        self.stores
            .read()
            .expect("store map lock")
            .values()
            .map(|s| s.lock().expect("key store lock").store.all_max_ts())
            .max()
            .unwrap_or(0)
    }

    fn first_observed(&self) -> Option<u64> {
        self.stores
            .read()
            .expect("store map lock")
            .values()
            .filter_map(|s| s.lock().expect("key store lock").store.first_observed())
            .min()
    }

    fn snapshot(&self) -> Vec<(Vec<u8>, Arc<Mutex<KeyStore>>)> {
        self.stores
            .read()
            .expect("store map lock")
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    fn gc_and_advance(&self, to: u64) {
        for (_, store) in self.snapshot() {
            let mut guard = store.lock().expect("key store lock");
            guard.store.advance_last_watermark(to);
            guard.store.gc(to);
        }
    }
}

/// One emitted join result.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinResult {
    pub window_start: u64,
    pub window_end: u64,
    pub row: Vec<Value>,
}

/// The trigger action joining two slice stores on watermark advance.
pub struct JoinTriggerAction {
    definition: JoinDefinition,
    left: JoinSide,
    right: JoinSide,
    left_key_index: usize,
    right_key_index: usize,
    left_excluded: Vec<usize>,
    right_excluded: Vec<usize>,
    last_watermark: u64,
    initialized: bool,
}

impl JoinTriggerAction {
    /// Builds the action, resolving key and timestamp positions in both input schemas.
    pub fn new(
        definition: JoinDefinition,
        left_schema: &Schema,
        right_schema: &Schema,
    ) -> crate::Result<Self> {
        let resolve = |schema: &Schema, key: &str| -> crate::Result<(usize, Vec<usize>)> {
            let key_index = schema.index_of(key).ok_or_else(|| {
                ErrorKind::SchemaMismatch.with_message(format!("unknown join key: {key}"))
            })?;
            let mut excluded = vec![key_index];
            if let TimeCharacteristic::EventTime { field } = &definition.window.time {
                if let Some(ts_index) = schema.index_of(field) {
                    if ts_index != key_index {
                        excluded.push(ts_index);
                    }
                }
            }
            excluded.sort_unstable();
            Ok((key_index, excluded))
        };
        let (left_key_index, left_excluded) = resolve(left_schema, &definition.left_key)?;
        let (right_key_index, right_excluded) = resolve(right_schema, &definition.right_key)?;
        let window = definition.window.clone();
        Ok(Self {
            definition,
            left: JoinSide::new(window.clone()),
            right: JoinSide::new(window),
            left_key_index,
            right_key_index,
            left_excluded,
            right_excluded,
            last_watermark: 0,
            initialized: false,
        })
    }

    pub fn left(&self) -> &JoinSide {
        &self.left
    }

    pub fn right(&self) -> &JoinSide {
        &self.right
    }

    pub fn last_watermark(&self) -> u64 {
        self.last_watermark
    }

    /// Total late records dropped across both sides.
    pub fn dropped_records(&self) -> u64 {
        self.left.late_records() + self.right.late_records()
    }

    /// Inserts a full row into the given side, extracting the key.
    pub fn insert_left(&self, row: Vec<Value>, ts: u64, origin: OriginId) {
        let key = row[self.left_key_index].clone();
        self.left.insert(&key, ts, row, origin);
    }

    pub fn insert_right(&self, row: Vec<Value>, ts: u64, origin: OriginId) {
        let key = row[self.right_key_index].clone();
        self.right.insert(&key, ts, row, origin);
    }

    /// Runs the trigger: joins every window closed by the combined watermark.
    ///
    /// Results are ordered by window start, then key byte order. The caller owns turning
    /// them into output buffers.
    pub fn trigger(&mut self) -> Vec<JoinResult> {
        let current = self.left.min_watermark().min(self.right.min_watermark());
        self.trigger_to(current)
    }

    /// Drains every remaining window regardless of watermarks, for query stop.
    pub fn flush(&mut self) -> Vec<JoinResult> {
        let size = self.definition.window.window_type.size_ms();
        let horizon = self.left.all_max_ts().max(self.right.all_max_ts()) + size;
        self.trigger_to(horizon)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    fn trigger_to(&mut self, current: u64) -> Vec<JoinResult> {
        if !self.initialized {
            // A store that never fired starts one window back from its first record.
            let first = match (self.left.first_observed(), self.right.first_observed()) {
                (Some(l), Some(r)) => l.min(r),
                (Some(first), None) | (None, Some(first)) => first,
                (None, None) => 0,
            };
            let size = self.definition.window.window_type.size_ms();
            self.last_watermark = first.saturating_sub(size);
            self.initialized = true;
        }
        if current <= self.last_watermark {
            return Vec::new();
        }

        let windows = self
            .definition
            .window
            .windows_closing_in(self.last_watermark, current);
        tracing::debug!(
            from = self.last_watermark,
            to = current,
            windows = windows.len(),
            "join trigger"
        );

        let left_keys = self.left.snapshot();
        let right_keys = self.right.snapshot();
        let mut results = Vec::new();
        for (start, end) in windows {
            match self.definition.variant {
                JoinVariant::InnerEqui => {
                    for (encoded, left_store) in &left_keys {
                        let Some((_, right_store)) =
                            right_keys.iter().find(|(k, _)| k == encoded)
                        else {
                            continue;
                        };
                        let left_guard = left_store.lock().expect("key store lock");
                        let right_guard = right_store.lock().expect("key store lock");
                        self.join_key(
                            start,
                            end,
                            Some(&left_guard.key),
                            &left_guard,
                            &right_guard,
                            &mut results,
                        );
                    }
                }
                JoinVariant::CartesianProduct => {
                    for (_, left_store) in &left_keys {
                        for (_, right_store) in &right_keys {
                            let left_guard = left_store.lock().expect("key store lock");
                            let right_guard = right_store.lock().expect("key store lock");
                            self.join_key(
                                start,
                                end,
                                None,
                                &left_guard,
                                &right_guard,
                                &mut results,
                            );
                        }
                    }
                }
            }
        }

        self.last_watermark = current;
        self.left.gc_and_advance(current);
        self.right.gc_and_advance(current);
        results
    }

    /// Nested-loop join of one key's records within one window.
    fn join_key(
        &self,
        start: u64,
        end: u64,
        key: Option<&Value>,
        left: &KeyStore,
        right: &KeyStore,
        results: &mut Vec<JoinResult>,
    ) {
        for left_slice in left.store.slices_in_window(start, end) {
            for right_slice in right.store.slices_in_window(start, end) {
                for left_record in left_slice.state() {
                    for right_record in right_slice.state() {
                        let mut row = vec![Value::UInt(start), Value::UInt(end)];
                        if let Some(key) = key {
                            row.push(key.clone());
                        }
                        for (index, value) in left_record.iter().enumerate() {
                            if !self.left_excluded.contains(&index) {
                                row.push(value.clone());
                            }
                        }
                        for (index, value) in right_record.iter().enumerate() {
                            if !self.right_excluded.contains(&index) {
                                row.push(value.clone());
                            }
                        }
                        results.push(JoinResult {
                            window_start: start,
                            window_end: end,
                            row,
                        });
                    }
                }
            }
        }
    }
}
