// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The query optimizer: signatures, containment, shared-plan merging, placement, and
//! pipelining.

pub mod containment;
pub mod global_plan;
pub mod pipelining;
pub mod placement;
pub mod signature;

pub use containment::{Containment, ContainmentChecker, IntervalSolver, SolverBackend, Verdict};
pub use global_plan::{GlobalQueryPlan, GlobalQueryPlanUpdatePhase, SharedQueryPlan};
pub use pipelining::{PipelinePlan, PipelineStageId};
pub use placement::{GlobalExecutionPlan, PlacementStrategy, QueryPlacementPhase};
pub use signature::{Formula, QuerySignature, SignatureComputation, Term};
