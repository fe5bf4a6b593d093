// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Containment detection between query signatures.
//!
//! The checker decides whether one signature's output stream is derivable from the other's
//! via projection and filtering. Implication questions go through the [`SolverBackend`]
//! trait so the decision procedure can be swapped; the built-in [`IntervalSolver`] covers
//! the linear fragment the signature phase emits: conjunctions and disjunctions of
//! comparisons against literals, plus uninterpreted atoms compared structurally.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::optimizer::signature::{Formula, QuerySignature, Term};
use crate::plan::expr::CompareOp;
use crate::plan::value::Value;

/// Relationship between two signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Containment {
    Equal,
    /// The left signature's stream subsumes the right one's.
    LeftContainsRight,
    /// The right signature's stream subsumes the left one's.
    RightContainsLeft,
    NoContainment,
}

/// Answer of one implication query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Implies,
    NotImplies,
    /// The solver exceeded its budget; treated as no containment.
    Timeout,
}

/// A decision procedure for implication between signature formulas.
pub trait SolverBackend: Send + Sync {
    /// Is `antecedent ⇒ consequent` valid? Must answer within `timeout`.
    fn check_implies(
        &self,
        antecedent: &Formula,
        consequent: &Formula,
        timeout: Duration,
    ) -> Verdict;
}

/// Per-term bounds accumulated from the antecedent's conjuncts.
#[derive(Debug, Default)]
struct Bounds {
    /// Largest established lower bound and whether it is inclusive.
    lower: Option<(Value, bool)>,
    /// Smallest established upper bound and whether it is inclusive.
    upper: Option<(Value, bool)>,
    equals: Option<Value>,
    not_equals: Vec<Value>,
}

impl Bounds {
    fn narrow(&mut self, op: CompareOp, literal: &Value) {
        match op {
            CompareOp::Lt => self.narrow_upper(literal, false),
            CompareOp::LtEq => self.narrow_upper(literal, true),
            CompareOp::Gt => self.narrow_lower(literal, false),
            CompareOp::GtEq => self.narrow_lower(literal, true),
            CompareOp::Eq => {
                self.equals = Some(literal.clone());
                self.narrow_upper(literal, true);
                self.narrow_lower(literal, true);
            }
            CompareOp::NotEq => self.not_equals.push(literal.clone()),
        }
    }

    fn narrow_upper(&mut self, literal: &Value, inclusive: bool) {
        let tighter = match &self.upper {
            None => true,
            Some((existing, existing_inclusive)) => match literal.compare(existing) {
                Ok(Ordering::Less) => true,
                Ok(Ordering::Equal) => *existing_inclusive && !inclusive,
                _ => false,
            },
        };
        if tighter {
            self.upper = Some((literal.clone(), inclusive));
        }
    }

    fn narrow_lower(&mut self, literal: &Value, inclusive: bool) {
        let tighter = match &self.lower {
            None => true,
            Some((existing, existing_inclusive)) => match literal.compare(existing) {
                Ok(Ordering::Greater) => true,
                Ok(Ordering::Equal) => *existing_inclusive && !inclusive,
                _ => false,
            },
        };
        if tighter {
            self.lower = Some((literal.clone(), inclusive));
        }
    }

    /// Does every value inside these bounds satisfy `op literal`?
    fn entails(&self, op: CompareOp, literal: &Value) -> bool {
        if let Some(equals) = &self.equals {
            return match equals.compare(literal) {
                Ok(ordering) => op.matches(ordering),
                Err(_) => false,
            };
        }
        match op {
            CompareOp::Lt | CompareOp::LtEq => match &self.upper {
                Some((upper, inclusive)) => match upper.compare(literal) {
                    Ok(Ordering::Less) => true,
                    Ok(Ordering::Equal) => op == CompareOp::LtEq || !*inclusive,
                    _ => false,
                },
                None => false,
            },
            CompareOp::Gt | CompareOp::GtEq => match &self.lower {
                Some((lower, inclusive)) => match lower.compare(literal) {
                    Ok(Ordering::Greater) => true,
                    Ok(Ordering::Equal) => op == CompareOp::GtEq || !*inclusive,
                    _ => false,
                },
                None => false,
            },
            CompareOp::Eq => false,
            CompareOp::NotEq => {
                let excluded = self
                    .not_equals
                    .iter()
                    .any(|v| matches!(v.compare(literal), Ok(Ordering::Equal)));
                let above = matches!(
                    &self.lower,
                    Some((lower, inclusive)) if matches!(lower.compare(literal), Ok(Ordering::Greater))
                        || (matches!(lower.compare(literal), Ok(Ordering::Equal)) && !inclusive)
                );
                let below = matches!(
                    &self.upper,
                    Some((upper, inclusive)) if matches!(upper.compare(literal), Ok(Ordering::Less))
                        || (matches!(upper.compare(literal), Ok(Ordering::Equal)) && !inclusive)
                );
                excluded || above || below
            }
        }
    }
}

/// The facts established by one conjunction: interval bounds per term, plus every conjunct
/// in structural form for the uninterpreted fallback.
#[derive(Debug, Default)]
struct FactBase {
    bounds: BTreeMap<String, Bounds>,
    conjuncts: Vec<Formula>,
}

impl FactBase {
    fn from_conjunction(formula: &Formula) -> Self {
        let mut facts = Self::default();
        for conjunct in formula.conjuncts() {
            facts.conjuncts.push(conjunct.clone());
            if let Formula::Compare { op, left, right } = conjunct {
                match (left, right) {
                    (term, Term::Literal(literal)) if !matches!(term, Term::Literal(_)) => {
                        facts
                            .bounds
                            .entry(term.to_string())
                            .or_default()
                            .narrow(*op, literal);
                    }
                    (Term::Literal(literal), term) if !matches!(term, Term::Literal(_)) => {
                        facts
                            .bounds
                            .entry(term.to_string())
                            .or_default()
                            .narrow(op.flipped(), literal);
                    }
                    _ => {}
                }
            }
        }
        facts
    }

    /// Does this fact base establish the given conjunct?
    fn entails(&self, conjunct: &Formula) -> bool {
        match conjunct {
            Formula::True => true,
            Formula::Compare { op, left, right } => match (left, right) {
                (Term::Literal(l), Term::Literal(r)) => {
                    matches!(l.compare(r), Ok(ordering) if op.matches(ordering))
                }
                (term, Term::Literal(literal)) => self
                    .bounds
                    .get(&term.to_string())
                    .map(|b| b.entails(*op, literal))
                    .unwrap_or(false)
                    || self.conjuncts.contains(conjunct),
                (Term::Literal(literal), term) => self
                    .bounds
                    .get(&term.to_string())
                    .map(|b| b.entails(op.flipped(), literal))
                    .unwrap_or(false)
                    || self.conjuncts.contains(conjunct),
                // Uninterpreted comparison between two free terms.
                _ => self.conjuncts.contains(conjunct),
            },
            // Atoms, negations, and nested disjunctions are uninterpreted: they must occur
            // verbatim in the antecedent.
            _ => self.conjuncts.contains(conjunct),
        }
    }
}

/// The built-in bounded decision procedure over the linear-interval fragment.
#[derive(Debug, Default)]
pub struct IntervalSolver;

impl IntervalSolver {
    fn implies(antecedent: &Formula, consequent: &Formula, deadline: Instant) -> Verdict {
        if Instant::now() >= deadline {
            return Verdict::Timeout;
        }
        if antecedent == consequent {
            return Verdict::Implies;
        }
        // A disjunctive antecedent implies the consequent only if every disjunct does.
        if let Formula::Or(disjuncts) = antecedent {
            for disjunct in disjuncts {
                match Self::implies(disjunct, consequent, deadline) {
                    Verdict::Implies => {}
                    other => return other,
                }
            }
            return Verdict::Implies;
        }
        let facts = FactBase::from_conjunction(antecedent);
        for conjunct in consequent.conjuncts() {
            if Instant::now() >= deadline {
                return Verdict::Timeout;
            }
            let established = match conjunct {
                // A disjunctive consequent holds if any branch is established.
                Formula::Or(branches) => branches.iter().any(|b| {
                    b.conjuncts().iter().all(|c| facts.entails(c))
                }),
                other => facts.entails(other),
            };
            if !established {
                return Verdict::NotImplies;
            }
        }
        Verdict::Implies
    }
}

impl SolverBackend for IntervalSolver {
    fn check_implies(
        &self,
        antecedent: &Formula,
        consequent: &Formula,
        timeout: Duration,
    ) -> Verdict {
        Self::implies(antecedent, consequent, Instant::now() + timeout)
    }
}

/// Decides the containment relationship between two signatures.
pub struct ContainmentChecker {
    solver: Box<dyn SolverBackend>,
    timeout: Duration,
}

impl Default for ContainmentChecker {
    fn default() -> Self {
        Self::new(Box::new(IntervalSolver), Duration::from_secs(1))
    }
}

impl ContainmentChecker {
    pub fn new(solver: Box<dyn SolverBackend>, timeout: Duration) -> Self {
        Self { solver, timeout }
    }

    /// Checks the relationship between `left` and `right`.
    ///
    /// Column spaces are aligned first: a signature can only contain another whose columns
    /// it also produces, with term-identical definitions. Renaming projections disable
    /// containment, a deliberate over-approximation.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn check(&self, left: &QuerySignature, right: &QuerySignature) -> Containment {
        if left == right {
            return Containment::Equal;
        }
        let left_covers = covers_columns(left, right);
        let right_covers = covers_columns(right, left);
        if !left_covers && !right_covers {
            tracing::debug!("column spaces cannot be aligned");
            return Containment::NoContainment;
        }

        let left_implies_right = self.implies(&left.predicate, &right.predicate);
        let right_implies_left = self.implies(&right.predicate, &left.predicate);
        tracing::debug!(
            ?left_implies_right,
            ?right_implies_left,
            "solver verdicts"
        );

        match (left_implies_right, right_implies_left) {
            (Verdict::Implies, Verdict::Implies) if left_covers && right_covers => {
                Containment::Equal
            }
            // left ⇒ right: every left tuple satisfies right's condition, so the right
            // stream subsumes the left one.
            (Verdict::Implies, _) if right_covers => Containment::RightContainsLeft,
            (_, Verdict::Implies) if left_covers => Containment::LeftContainsRight,
            _ => Containment::NoContainment,
        }
    }

    fn implies(&self, antecedent: &Formula, consequent: &Formula) -> Verdict {
        self.solver.check_implies(antecedent, consequent, self.timeout)
    }
}

/// Can `container` reproduce every output column of `contained`, under the same name and
/// with the same defining term?
fn covers_columns(container: &QuerySignature, contained: &QuerySignature) -> bool {
    contained
        .columns
        .iter()
        .all(|(name, term)| container.columns.get(name) == Some(term))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::signature::SignatureComputation;
    use crate::plan::expr::{col, lit};
    use crate::plan::operator::{ProjectionField, SinkDescriptor};
    use crate::plan::schema::{PhysicalType, Schema};
    use crate::plan::Query;
    use pretty_assertions::assert_eq;

    fn car_schema() -> Schema {
        Schema::new()
            .with_field("id", PhysicalType::UInt64)
            .with_field("value", PhysicalType::UInt64)
    }

    fn sink_signature(plan: &crate::plan::LogicalPlan) -> QuerySignature {
        SignatureComputation::run(plan)
            .expect("signatures")
            .sink_signature(plan)
            .expect("sink signature")
            .clone()
    }

    fn filtered(limit: u64, op: fn(crate::plan::expr::Expression, crate::plan::expr::Expression) -> crate::plan::expr::Expression) -> QuerySignature {
        let plan = Query::from_source("car", car_schema())
            .map("value", lit(40u64))
            .filter(op(col("id"), lit(limit)))
            .sink(SinkDescriptor::Collect)
            .expect("plan");
        sink_signature(&plan)
    }

    #[test]
    fn reflexivity() {
        let narrow = filtered(45, |l, r| l.lt(r));
        let checker = ContainmentChecker::default();
        assert_eq!(checker.check(&narrow, &narrow), Containment::Equal);
    }

    #[test]
    fn narrower_filter_is_contained() {
        let checker = ContainmentChecker::default();
        let narrow = filtered(45, |l, r| l.lt(r));
        let broad = filtered(60, |l, r| l.lt(r));
        // narrow ⇒ broad, so the broad side contains the narrow one.
        assert_eq!(checker.check(&narrow, &broad), Containment::RightContainsLeft);
        assert_eq!(checker.check(&broad, &narrow), Containment::LeftContainsRight);
    }

    #[test]
    fn disjoint_filters_do_not_contain() {
        let checker = ContainmentChecker::default();
        let below = filtered(45, |l, r| l.lt(r));
        let above = filtered(60, |l, r| l.gt(r));
        assert_eq!(checker.check(&below, &above), Containment::NoContainment);
    }

    #[test]
    fn duplicate_filters_are_equal() {
        let checker = ContainmentChecker::default();
        let once = {
            let plan = Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .filter(col("id").lt(lit(45u64)))
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        let repeated = {
            let plan = Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .filter(col("id").lt(lit(45u64)))
                .filter(col("id").lt(lit(45u64)))
                .filter(col("id").lt(lit(45u64)))
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        assert_eq!(checker.check(&once, &repeated), Containment::Equal);
    }

    #[test]
    fn projection_restricts_the_contained_side() {
        let checker = ContainmentChecker::default();
        let full = {
            let plan = Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        let projected = {
            let plan = Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .project(vec![ProjectionField::named("value")])
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        assert_eq!(
            checker.check(&projected, &full),
            Containment::RightContainsLeft
        );
    }

    #[test]
    fn renaming_projection_disables_containment() {
        let checker = ContainmentChecker::default();
        let full = {
            let plan = Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        let renamed = {
            let plan = Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .project(vec![ProjectionField::renamed("value", "newValue")])
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        assert_eq!(checker.check(&renamed, &full), Containment::NoContainment);
    }

    #[test]
    fn map_rewriting_a_column_disables_containment() {
        let checker = ContainmentChecker::default();
        let rewritten = {
            let plan = Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .map("value", col("value").add(lit(10u64)))
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        let plain = {
            let plan = Query::from_source("car", car_schema())
                .map("value", lit(40u64))
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        assert_eq!(checker.check(&rewritten, &plain), Containment::NoContainment);
    }

    #[test]
    fn different_window_sizes_never_contain() {
        use crate::plan::operator::{
            AggregationKind, TimeCharacteristic, WindowAggregation, WindowDescriptor,
        };
        let keyed = Schema::new()
            .with_field("k", PhysicalType::UInt64)
            .with_field("v", PhysicalType::UInt64)
            .with_field("ts", PhysicalType::UInt64);
        let windowed = |size: u64| {
            let plan = Query::from_source("car", keyed.clone())
                .window(
                    WindowDescriptor::tumbling(
                        size,
                        TimeCharacteristic::EventTime { field: "ts".into() },
                    ),
                    vec!["k".into()],
                    vec![WindowAggregation::new(AggregationKind::Sum, "v", "sum_v")],
                )
                .sink(SinkDescriptor::Collect)
                .expect("plan");
            sink_signature(&plan)
        };
        let checker = ContainmentChecker::default();
        assert_eq!(
            checker.check(&windowed(1000), &windowed(2000)),
            Containment::NoContainment
        );
        assert_eq!(checker.check(&windowed(1000), &windowed(1000)), Containment::Equal);
    }

    #[test]
    fn zero_budget_times_out_to_no_containment() {
        let narrow = filtered(45, |l, r| l.lt(r));
        let broad = filtered(60, |l, r| l.lt(r));
        let checker = ContainmentChecker::new(Box::new(IntervalSolver), Duration::ZERO);
        assert_eq!(checker.check(&narrow, &broad), Containment::NoContainment);
    }
}
