// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Randomized invariants over signatures, containment, windows, and aggregation.

use nebula_stream_engine::catalog::OriginId;
use nebula_stream_engine::optimizer::signature::SignatureComputation;
use nebula_stream_engine::optimizer::{Containment, ContainmentChecker};
use nebula_stream_engine::plan::expr::{col, lit, Expression};
use nebula_stream_engine::plan::operator::{
    AggregationKind, JoinVariant, SinkDescriptor, TimeCharacteristic, WindowDescriptor,
};
use nebula_stream_engine::plan::schema::{PhysicalType, Schema};
use nebula_stream_engine::plan::value::Value;
use nebula_stream_engine::plan::{LogicalPlan, Query};
use nebula_stream_engine::runtime::aggregate::AggregateFunction;
use nebula_stream_engine::runtime::join::JoinTriggerAction;
use nebula_stream_engine::runtime::slice_store::SliceStore;
use proptest::prelude::*;

fn car_schema() -> Schema {
    Schema::new()
        .with_field("id", PhysicalType::UInt64)
        .with_field("value", PhysicalType::UInt64)
}

/// A random linear query over the car schema.
fn arbitrary_plan() -> impl Strategy<Value = LogicalPlan> {
    let step = prop_oneof![
        (0u64..100).prop_map(|limit| ("filter_lt", limit)),
        (0u64..100).prop_map(|limit| ("filter_gt", limit)),
        (0u64..100).prop_map(|constant| ("map", constant)),
    ];
    proptest::collection::vec(step, 0..5).prop_map(|steps| {
        let mut query = Query::from_source("car", car_schema());
        for (kind, operand) in steps {
            query = match kind {
                "filter_lt" => query.filter(col("id").lt(lit(operand))),
                "filter_gt" => query.filter(col("id").gt(lit(operand))),
                _ => query.map("value", lit(operand)),
            };
        }
        query.sink(SinkDescriptor::Collect).expect("valid plan")
    })
}

fn sink_signature(plan: &LogicalPlan) -> nebula_stream_engine::optimizer::QuerySignature {
    SignatureComputation::run(plan)
        .expect("signatures")
        .sink_signature(plan)
        .expect("sink signature")
        .clone()
}

proptest! {
    /// Signature computation is deterministic per plan.
    #[test]
    fn signature_stability(plan in arbitrary_plan()) {
        prop_assert_eq!(sink_signature(&plan), sink_signature(&plan));
    }

    /// Every signature equals itself.
    #[test]
    fn containment_reflexivity(plan in arbitrary_plan()) {
        let signature = sink_signature(&plan);
        let checker = ContainmentChecker::default();
        prop_assert_eq!(checker.check(&signature, &signature), Containment::Equal);
    }

    /// The relation is antisymmetric: mutual containment only at equality.
    #[test]
    fn containment_antisymmetry(left in arbitrary_plan(), right in arbitrary_plan()) {
        let checker = ContainmentChecker::default();
        let a = sink_signature(&left);
        let b = sink_signature(&right);
        let forward = checker.check(&a, &b);
        let backward = checker.check(&b, &a);
        match forward {
            Containment::Equal => prop_assert_eq!(backward, Containment::Equal),
            Containment::LeftContainsRight => {
                prop_assert_ne!(backward, Containment::LeftContainsRight);
            }
            Containment::RightContainsLeft => {
                prop_assert_ne!(backward, Containment::RightContainsLeft);
            }
            Containment::NoContainment => prop_assert_eq!(backward, Containment::NoContainment),
        }
    }

    /// Threshold filters order exactly as their constants do.
    #[test]
    fn filter_thresholds_order_containment(a in 0u64..1000, b in 0u64..1000) {
        let filtered = |limit: u64| {
            let plan = Query::from_source("car", car_schema())
                .filter(col("id").lt(lit(limit)))
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        let checker = ContainmentChecker::default();
        let expected = match a.cmp(&b) {
            std::cmp::Ordering::Equal => Containment::Equal,
            // The narrower filter is contained in the broader one.
            std::cmp::Ordering::Less => Containment::RightContainsLeft,
            std::cmp::Ordering::Greater => Containment::LeftContainsRight,
        };
        prop_assert_eq!(checker.check(&filtered(a), &filtered(b)), expected);
    }

    /// Exactly one tumbling slice covers any timestamp; sliding windows cover it
    /// `size / slide` times.
    #[test]
    fn slice_coverage(ts in 0u64..1_000_000, slide in 1u64..1000, factor in 1u64..8) {
        let size = slide * factor;
        let time = TimeCharacteristic::EventTime { field: "ts".into() };

        let tumbling = WindowDescriptor::tumbling(size, time.clone());
        let (start, end) = tumbling.slice_bounds(ts);
        prop_assert!(start <= ts && ts < end);
        prop_assert_eq!(end - start, size);

        let sliding = WindowDescriptor::sliding(size, slide, time);
        let covering = sliding
            .windows_closing_in(0, ts + size + slide)
            .into_iter()
            .filter(|(s, e)| *s <= ts && ts < *e)
            .count() as u64;
        prop_assert_eq!(covering, factor);
    }

    /// The last triggered position never regresses, whatever the update order.
    #[test]
    fn watermark_monotonicity(updates in proptest::collection::vec((0u64..4u64, 0u64..10_000), 1..40)) {
        let mut store: SliceStore<u64> = SliceStore::new(WindowDescriptor::tumbling(
            1000,
            TimeCharacteristic::EventTime { field: "ts".into() },
        ));
        let mut previous = store.last_watermark();
        for (origin, watermark) in updates {
            if store.update_watermark(OriginId(origin), watermark) {
                store.advance_last_watermark(store.min_watermark());
            }
            prop_assert!(store.last_watermark() >= previous);
            previous = store.last_watermark();
        }
    }

    /// Incremental sum over slices equals the batch reference.
    #[test]
    fn aggregation_matches_batch_reference(values in proptest::collection::vec(0u64..1000, 0..50)) {
        let sum = AggregateFunction::new(AggregationKind::Sum, PhysicalType::UInt64).expect("sum");
        // Lift into several partial states, combine pairwise, lower once.
        let mut states: Vec<Vec<u8>> = Vec::new();
        for chunk in values.chunks(7) {
            let mut state = vec![0u8; sum.state_size()];
            for v in chunk {
                sum.lift(&mut state, &Value::UInt(*v)).expect("lift");
            }
            states.push(state);
        }
        let mut total = vec![0u8; sum.state_size()];
        for state in &states {
            sum.combine(&mut total, state).expect("combine");
        }
        let reference: u64 = values.iter().sum();
        prop_assert_eq!(sum.lower(&total), Some(Value::UInt(reference)));
    }

    /// A cartesian-product join is symmetric under swapping its inputs.
    #[test]
    fn join_symmetry(
        left in proptest::collection::vec((0u64..4, 0u64..100, 0u64..1000), 0..8),
        right in proptest::collection::vec((0u64..4, 0u64..100, 0u64..1000), 0..8),
    ) {
        let run = |build: &[(u64, u64, u64)], probe: &[(u64, u64, u64)]| {
            let schema = |name: &str| {
                Schema::new()
                    .with_field("k", PhysicalType::UInt64)
                    .with_field("v", PhysicalType::UInt64)
                    .with_field("ts", PhysicalType::UInt64)
                    .qualified(name)
            };
            let mut action = JoinTriggerAction::new(
                nebula_stream_engine::plan::operator::JoinDefinition {
                    variant: JoinVariant::CartesianProduct,
                    left_key: "build$k".into(),
                    right_key: "probe$k".into(),
                    window: WindowDescriptor::tumbling(
                        1000,
                        TimeCharacteristic::EventTime { field: "ts".into() },
                    ),
                },
                &schema("build"),
                &schema("probe"),
            )
            .expect("action");
            for (k, v, ts) in build {
                action.insert_left(
                    vec![Value::UInt(*k), Value::UInt(*v), Value::UInt(*ts)],
                    *ts,
                    OriginId(1),
                );
            }
            for (k, v, ts) in probe {
                action.insert_right(
                    vec![Value::UInt(*k), Value::UInt(*v), Value::UInt(*ts)],
                    *ts,
                    OriginId(2),
                );
            }
            action.left().update_watermark(OriginId(1), 10_000);
            action.right().update_watermark(OriginId(2), 10_000);
            action.trigger()
        };

        // Compare multisets of (window, build-payload, probe-payload), with the payload
        // pair flipped for the swapped run.
        let mut forward: Vec<(u64, u64, String, String)> = run(&left, &right)
            .into_iter()
            .map(|r| {
                (r.window_start, r.window_end, format!("{:?}", r.row[2]), format!("{:?}", r.row[3]))
            })
            .collect();
        let mut backward: Vec<(u64, u64, String, String)> = run(&right, &left)
            .into_iter()
            .map(|r| {
                (r.window_start, r.window_end, format!("{:?}", r.row[3]), format!("{:?}", r.row[2]))
            })
            .collect();
        forward.sort();
        backward.sort();
        prop_assert_eq!(forward, backward);
    }
}

/// Placement conservation is deterministic; no randomness needed beyond the plan shape.
#[test]
fn placement_conservation_over_growing_chains() {
    use nebula_stream_engine::config::EngineConfig;
    use nebula_stream_engine::engine::Engine;
    use nebula_stream_engine::topology::TopologyNodeId;

    for filters in 0..4u64 {
        let engine = Engine::new(EngineConfig::default()).expect("engine");
        let root = TopologyNodeId::new(1);
        let worker = TopologyNodeId::new(2);
        engine.add_topology_root(root, "coordinator:4000", 0).expect("root");
        engine.add_topology_node(worker, "worker:4000", 8).expect("worker");
        engine.add_topology_link(worker, root, 100, 5).expect("link");
        engine.register_logical_source("car", car_schema()).expect("source");
        engine
            .register_physical_source("car", OriginId(1), worker)
            .expect("physical");

        let mut query = Query::from_source("car", car_schema());
        for limit in 0..filters {
            query = query.filter(col("id").lt(lit(1000 - limit)));
        }
        engine
            .submit_query(query.sink(SinkDescriptor::Collect).expect("plan"))
            .expect("submitted");

        // Used slots equal the number of placed intermediate operators.
        let used = 8 - engine.remaining_cpu(worker).expect("cpu");
        assert_eq!(u64::from(used), filters);
    }
}

/// Signatures do not depend on `Expression` construction order details.
#[test]
fn signature_ignores_filter_duplication() {
    let once = Query::from_source("car", car_schema())
        .filter(col("id").lt(lit(45u64)))
        .sink(SinkDescriptor::Collect)
        .expect("plan");
    let thrice = Query::from_source("car", car_schema())
        .filter(col("id").lt(lit(45u64)))
        .filter(col("id").lt(lit(45u64)))
        .filter(col("id").lt(lit(45u64)))
        .sink(SinkDescriptor::Collect)
        .expect("plan");
    let checker = ContainmentChecker::default();
    assert_eq!(
        checker.check(&sink_signature(&once), &sink_signature(&thrice)),
        Containment::Equal
    );
}

/// Expressions used by the strategies above stay well-typed.
#[test]
fn arbitrary_plans_type_check() {
    let predicate: Expression = col("id").lt(lit(5u64)).and(col("value").gt_eq(lit(0u64)));
    assert_eq!(
        predicate.data_type(&car_schema().qualified("car")).expect("type"),
        PhysicalType::Bool
    );
}
