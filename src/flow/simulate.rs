//! Abstract interpretation of a flow against a synthetic record batch.
//!
//! The simulator walks success edges from the root, charging each visited
//! element's fixed operation cost against per-run resource quotas. Inside
//! iteration scopes the cost of data operations is multiplied by the
//! record count, which is what surfaces un-bulkified flows before they
//! fail at scale. Nothing is executed; the result is a pure projection.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::flow::{ElementKind, FlowDocument};

/// One tracked per-run resource counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaCategory {
    QueryOps,
    MutationOps,
    MutatedRows,
    ElapsedUnits,
}

impl fmt::Display for QuotaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuotaCategory::QueryOps => "queryOps",
            QuotaCategory::MutationOps => "mutationOps",
            QuotaCategory::MutatedRows => "mutatedRows",
            QuotaCategory::ElapsedUnits => "elapsedUnits",
        };
        f.write_str(name)
    }
}

/// Configured per-run ceilings.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaConfig {
    pub query_ops: u64,
    pub mutation_ops: u64,
    pub mutated_rows: u64,
    pub elapsed_units: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            query_ops: 100,
            mutation_ops: 150,
            mutated_rows: 10_000,
            elapsed_units: 10_000,
        }
    }
}

impl QuotaConfig {
    fn ceiling(&self, category: QuotaCategory) -> u64 {
        match category {
            QuotaCategory::QueryOps => self.query_ops,
            QuotaCategory::MutationOps => self.mutation_ops,
            QuotaCategory::MutatedRows => self.mutated_rows,
            QuotaCategory::ElapsedUnits => self.elapsed_units,
        }
    }
}

/// How nested iterations compound the per-record multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SimPolicy {
    /// `records ^ nesting_depth`: the conservative, worst-case default.
    #[default]
    Multiplicative,
    /// `records x nesting_depth`: assumes inner collections stay small.
    Linear,
}

/// Accumulated counter values, one per quota category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuotaCounts {
    pub query_ops: u64,
    pub mutation_ops: u64,
    pub mutated_rows: u64,
    pub elapsed_units: u64,
}

impl QuotaCounts {
    /// Read one counter.
    #[must_use]
    pub fn get(&self, category: QuotaCategory) -> u64 {
        match category {
            QuotaCategory::QueryOps => self.query_ops,
            QuotaCategory::MutationOps => self.mutation_ops,
            QuotaCategory::MutatedRows => self.mutated_rows,
            QuotaCategory::ElapsedUnits => self.elapsed_units,
        }
    }

    fn add(&mut self, category: QuotaCategory, amount: u64) -> (u64, u64) {
        let slot = match category {
            QuotaCategory::QueryOps => &mut self.query_ops,
            QuotaCategory::MutationOps => &mut self.mutation_ops,
            QuotaCategory::MutatedRows => &mut self.mutated_rows,
            QuotaCategory::ElapsedUnits => &mut self.elapsed_units,
        };
        let before = *slot;
        *slot = before.saturating_add(amount);
        (before, *slot)
    }
}

/// A counter pushed past its ceiling by one element's contribution.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub element_id: String,
    pub category: QuotaCategory,
    pub reason: String,
}

/// A success-edge cycle not mediated by an iteration construct.
#[derive(Debug, Clone, Serialize)]
pub struct CycleError {
    /// The element whose success edge closed the cycle.
    pub element_id: String,
}

/// The projected resource usage of one run over `records_simulated` records.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub records_simulated: u64,
    pub counts: QuotaCounts,
    pub violations: Vec<Violation>,
    /// Present when the walk found an unmediated success-edge cycle.
    /// Counts and violations above are the partial results gathered
    /// before and around the cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<CycleError>,
}

impl SimulationResult {
    /// Returns `true` if the projection stayed under every ceiling and
    /// the graph had no unmediated cycle.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && self.cycle.is_none()
    }
}

/// Simulate with default quotas and the default (multiplicative) policy.
#[must_use]
pub fn simulate(doc: &FlowDocument, records: u64) -> SimulationResult {
    simulate_with(doc, records, SimPolicy::default(), &QuotaConfig::default())
}

/// Simulate with explicit policy and quota configuration.
#[must_use]
pub fn simulate_with(
    doc: &FlowDocument,
    records: u64,
    policy: SimPolicy,
    quotas: &QuotaConfig,
) -> SimulationResult {
    let mut walker = Walker {
        doc,
        records,
        policy,
        quotas,
        counts: QuotaCounts::default(),
        violations: Vec::new(),
        cycle: None,
        visited: BTreeSet::new(),
    };
    let mut scope = Vec::new();
    let mut path = BTreeSet::new();
    walker.visit(&doc.root.clone(), &mut scope, &mut path);
    SimulationResult {
        records_simulated: records,
        counts: walker.counts,
        violations: walker.violations,
        cycle: walker.cycle,
    }
}

/// Per-element base costs in elapsed units.
fn elapsed_cost(kind: ElementKind) -> u64 {
    match kind {
        ElementKind::DataRead => 2,
        ElementKind::DataWrite => 3,
        ElementKind::SubInvocation => 5,
        ElementKind::Branch
        | ElementKind::Iteration
        | ElementKind::ScreenStep
        | ElementKind::Assignment
        | ElementKind::Wait => 1,
    }
}

struct Walker<'a> {
    doc: &'a FlowDocument,
    records: u64,
    policy: SimPolicy,
    quotas: &'a QuotaConfig,
    counts: QuotaCounts,
    violations: Vec<Violation>,
    cycle: Option<CycleError>,
    /// Elements already visited, keyed by (element, iteration scope):
    /// each element is charged once per scope it appears in.
    visited: BTreeSet<(String, Vec<String>)>,
}

impl Walker<'_> {
    /// Per-record multiplier at the given nesting depth.
    fn multiplier(&self, depth: usize) -> u64 {
        match self.policy {
            SimPolicy::Multiplicative => {
                let exp = u32::try_from(depth).unwrap_or(u32::MAX);
                self.records.checked_pow(exp).unwrap_or(u64::MAX)
            }
            SimPolicy::Linear => {
                if depth == 0 {
                    1
                } else {
                    self.records.saturating_mul(depth as u64)
                }
            }
        }
    }

    fn charge(&mut self, id: &str, category: QuotaCategory, amount: u64) {
        let (before, after) = self.counts.add(category, amount);
        let ceiling = self.quotas.ceiling(category);
        if before <= ceiling && after > ceiling {
            self.violations.push(Violation {
                element_id: id.to_string(),
                category,
                reason: format!(
                    "'{id}' contributes {amount} {category}, pushing the run to {after} \
                     against a ceiling of {ceiling}"
                ),
            });
        }
    }

    fn visit(
        &mut self,
        id: &str,
        scope: &mut Vec<String>,
        path: &mut BTreeSet<(String, Vec<String>)>,
    ) {
        let doc = self.doc;
        let Some(node) = doc.elements.get(id) else {
            return;
        };
        let key = (id.to_string(), scope.clone());
        if path.contains(&key) {
            // Success-edge cycle with no iteration in between. Keep the
            // first occurrence; the walk continues elsewhere.
            if self.cycle.is_none() {
                self.cycle = Some(CycleError {
                    element_id: id.to_string(),
                });
            }
            return;
        }
        if !self.visited.insert(key.clone()) {
            return;
        }
        path.insert(key.clone());

        let depth = scope.len();
        let m = self.multiplier(depth);
        match node.kind {
            ElementKind::DataRead => {
                self.charge(id, QuotaCategory::QueryOps, m);
            }
            ElementKind::DataWrite => {
                self.charge(id, QuotaCategory::MutationOps, m);
                // A collection-level write outside any iteration mutates
                // the whole batch in one operation; per-record writes
                // mutate one row per visit.
                let rows = if depth == 0 { self.records } else { m };
                self.charge(id, QuotaCategory::MutatedRows, rows);
            }
            _ => {}
        }
        self.charge(
            id,
            QuotaCategory::ElapsedUnits,
            elapsed_cost(node.kind).saturating_mul(m),
        );

        if let Some(body_id) = &node.body_target {
            scope.push(id.to_string());
            self.visit(body_id, scope, path);
            scope.pop();
        }
        for next in &node.success_targets {
            // A success edge back to an iteration currently in scope is
            // the recognized loop-continue connector, not a cycle.
            if scope.iter().any(|s| s == next) {
                continue;
            }
            self.visit(next, scope, path);
        }

        path.remove(&key);
    }
}
