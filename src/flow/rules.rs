//! Structural rule catalogue and category-weighted scoring.
//!
//! Rules are independent, pure predicates over a [`FlowDocument`]. The
//! engine always evaluates the full catalogue so every call returns a
//! complete multi-category report; the caller decides what to do with it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

use crate::flow::{ElementKind, FlowDocument, RunMode};

/// Rule categories. Each category has a fixed score ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Category {
    /// Naming and declaration hygiene.
    DesignNaming,
    /// Control-flow shape and document organization.
    LogicStructure,
    /// Graph-level soundness.
    Architecture,
    /// Bulk-safety against per-run resource quotas.
    PerformanceBulkSafety,
    /// Fault-path coverage.
    ErrorHandling,
    /// Record-access posture.
    Security,
}

impl Category {
    /// All categories, in report order.
    pub const ALL: [Category; 6] = [
        Category::DesignNaming,
        Category::LogicStructure,
        Category::Architecture,
        Category::PerformanceBulkSafety,
        Category::ErrorHandling,
        Category::Security,
    ];

    /// Fixed score ceiling for this category.
    #[must_use]
    pub fn ceiling(&self) -> u32 {
        match self {
            Category::DesignNaming => 15,
            Category::LogicStructure => 15,
            Category::Architecture => 15,
            Category::PerformanceBulkSafety => 30,
            Category::ErrorHandling => 15,
            Category::Security => 10,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::DesignNaming => "Design/Naming",
            Category::LogicStructure => "Logic/Structure",
            Category::Architecture => "Architecture",
            Category::PerformanceBulkSafety => "Performance/BulkSafety",
            Category::ErrorHandling => "ErrorHandling",
            Category::Security => "Security",
        };
        f.write_str(name)
    }
}

/// Whether a finding fails the overall result or merely advises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Blocking,
    Advisory,
}

/// One triggered rule violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Stable rule code.
    pub code: &'static str,
    pub category: Category,
    pub severity: FindingSeverity,
    pub message: String,
    /// Points subtracted from the category score.
    pub points_deducted: u32,
}

impl Finding {
    /// Returns `true` if this finding is blocking.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.severity == FindingSeverity::Blocking
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            FindingSeverity::Blocking => "blocking",
            FindingSeverity::Advisory => "advisory",
        };
        write!(
            f,
            "[{}] {sev}: {} (-{} {})",
            self.code, self.message, self.points_deducted, self.category
        )
    }
}

/// Per-category score line.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryScore {
    pub category: Category,
    pub score: u32,
    pub max: u32,
}

/// Complete scoring result for one document.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub total: u32,
    pub max: u32,
    pub categories: Vec<CategoryScore>,
    pub findings: Vec<Finding>,
}

// ── Rule codes ──────────────────────────────────────────────────────────

/// Data mutation nested inside an iteration.
pub const B001: &str = "B001";
/// Data query nested inside an iteration.
pub const B002: &str = "B002";
/// Structural cycle through success edges (reported by the simulator).
pub const B003: &str = "B003";
/// Mutation element without a fault connector.
pub const A001: &str = "A001";
/// Declared variable never referenced.
pub const A002: &str = "A002";
/// Identifier does not follow the naming convention.
pub const A003: &str = "A003";
/// Elements not declared in canonical grouped order.
pub const A004: &str = "A004";
/// Branch with fewer than two outcomes.
pub const A005: &str = "A005";
/// Element unreachable from the root.
pub const A006: &str = "A006";
/// Elevated run mode combined with data mutations.
pub const A007: &str = "A007";

/// One catalogue entry: a pure predicate plus its classification.
struct Rule {
    code: &'static str,
    category: Category,
    severity: FindingSeverity,
    points: u32,
    check: fn(&FlowDocument) -> Vec<String>,
}

/// The fixed rule catalogue. New rules are rows here, not new branches.
const CATALOGUE: &[Rule] = &[
    Rule {
        code: B001,
        category: Category::PerformanceBulkSafety,
        severity: FindingSeverity::Blocking,
        points: 30,
        check: check_mutation_in_iteration,
    },
    Rule {
        code: B002,
        category: Category::PerformanceBulkSafety,
        severity: FindingSeverity::Blocking,
        points: 15,
        check: check_query_in_iteration,
    },
    Rule {
        code: A001,
        category: Category::ErrorHandling,
        severity: FindingSeverity::Advisory,
        points: 5,
        check: check_mutation_fault_edge,
    },
    Rule {
        code: A002,
        category: Category::DesignNaming,
        severity: FindingSeverity::Advisory,
        points: 3,
        check: check_unused_variables,
    },
    Rule {
        code: A003,
        category: Category::DesignNaming,
        severity: FindingSeverity::Advisory,
        points: 2,
        check: check_naming_convention,
    },
    Rule {
        code: A004,
        category: Category::LogicStructure,
        severity: FindingSeverity::Advisory,
        points: 4,
        check: check_canonical_ordering,
    },
    Rule {
        code: A005,
        category: Category::LogicStructure,
        severity: FindingSeverity::Advisory,
        points: 4,
        check: check_branch_outcomes,
    },
    Rule {
        code: A006,
        category: Category::Architecture,
        severity: FindingSeverity::Advisory,
        points: 5,
        check: check_unreachable_elements,
    },
    Rule {
        code: A007,
        category: Category::Security,
        severity: FindingSeverity::Advisory,
        points: 10,
        check: check_elevated_mutations,
    },
];

/// Evaluate the full rule catalogue and produce a weighted score.
///
/// Pure function of the document: identical input yields identical
/// output, including finding order.
#[must_use]
pub fn score(doc: &FlowDocument) -> ScoreReport {
    let mut findings = Vec::new();
    for rule in CATALOGUE {
        for message in (rule.check)(doc) {
            findings.push(Finding {
                code: rule.code,
                category: rule.category,
                severity: rule.severity,
                message,
                points_deducted: rule.points,
            });
        }
    }
    build_report(findings)
}

/// Assemble a report from findings: category ceilings minus deductions,
/// floored at zero per category.
fn build_report(findings: Vec<Finding>) -> ScoreReport {
    let mut deductions: BTreeMap<Category, u32> = BTreeMap::new();
    for f in &findings {
        *deductions.entry(f.category).or_default() += f.points_deducted;
    }
    let categories: Vec<CategoryScore> = Category::ALL
        .iter()
        .map(|c| CategoryScore {
            category: *c,
            score: c.ceiling().saturating_sub(*deductions.get(c).unwrap_or(&0)),
            max: c.ceiling(),
        })
        .collect();
    let total = categories.iter().map(|c| c.score).sum();
    let max = categories.iter().map(|c| c.max).sum();
    ScoreReport {
        total,
        max,
        categories,
        findings,
    }
}

/// Fold a structural-cycle result from the simulator into a score report
/// as a blocking Architecture finding.
pub fn apply_cycle_finding(report: &mut ScoreReport, element_id: &str) {
    report.findings.push(Finding {
        code: B003,
        category: Category::Architecture,
        severity: FindingSeverity::Blocking,
        message: format!("structural cycle through success edges at '{element_id}'"),
        points_deducted: 15,
    });
    let rebuilt = build_report(std::mem::take(&mut report.findings));
    *report = rebuilt;
}

// ── Rule predicates ─────────────────────────────────────────────────────

fn check_mutation_in_iteration(doc: &FlowDocument) -> Vec<String> {
    doc.elements
        .values()
        .filter(|e| e.kind.is_mutation() && !e.containing_iterations.is_empty())
        .map(|e| {
            format!(
                "mutation nested inside iteration: '{}' runs within '{}'",
                e.id,
                e.containing_iterations.join("' > '")
            )
        })
        .collect()
}

fn check_query_in_iteration(doc: &FlowDocument) -> Vec<String> {
    doc.elements
        .values()
        .filter(|e| e.kind.is_query() && !e.containing_iterations.is_empty())
        .map(|e| {
            format!(
                "query nested inside iteration: '{}' runs within '{}'",
                e.id,
                e.containing_iterations.join("' > '")
            )
        })
        .collect()
}

fn check_mutation_fault_edge(doc: &FlowDocument) -> Vec<String> {
    doc.elements
        .values()
        .filter(|e| e.kind.is_mutation() && !e.has_fault_edge)
        .map(|e| format!("mutation '{}' has no fault connector", e.id))
        .collect()
}

fn check_unused_variables(doc: &FlowDocument) -> Vec<String> {
    doc.variables
        .iter()
        .filter(|(_, v)| !v.referenced)
        .map(|(name, _)| format!("variable '{name}' is declared but never referenced"))
        .collect()
}

/// Identifier convention: lower snake case, after NFKC normalization.
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("identifier regex must compile"));

fn check_naming_convention(doc: &FlowDocument) -> Vec<String> {
    let mut out = Vec::new();
    for id in doc.elements.keys() {
        let normalized: String = id.nfkc().collect();
        if !IDENT_RE.is_match(&normalized) {
            out.push(format!("element id '{id}' is not lower_snake_case"));
        }
    }
    for name in doc.variables.keys() {
        let normalized: String = name.nfkc().collect();
        if !IDENT_RE.is_match(&normalized) {
            out.push(format!("variable '{name}' is not lower_snake_case"));
        }
    }
    out
}

fn check_canonical_ordering(doc: &FlowDocument) -> Vec<String> {
    let canonical = doc.canonical_order();
    let declared: Vec<&str> = doc.declared_order.iter().map(String::as_str).collect();
    if declared == canonical {
        return Vec::new();
    }
    let first_off = declared
        .iter()
        .zip(canonical.iter())
        .find(|(d, c)| d != c)
        .map(|(d, _)| *d)
        .unwrap_or("");
    vec![format!(
        "elements are not declared in canonical grouped order (first out of place: '{first_off}')"
    )]
}

fn check_branch_outcomes(doc: &FlowDocument) -> Vec<String> {
    doc.elements
        .values()
        .filter(|e| e.kind == ElementKind::Branch && e.success_targets.len() < 2)
        .map(|e| format!("branch '{}' has fewer than two outcomes", e.id))
        .collect()
}

fn check_unreachable_elements(doc: &FlowDocument) -> Vec<String> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(doc.root.as_str());
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(node) = doc.elements.get(id) {
            for next in node
                .success_targets
                .iter()
                .chain(node.body_target.iter())
                .chain(node.fault_target.iter())
            {
                queue.push_back(next);
            }
        }
    }
    doc.elements
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .map(|id| format!("element '{id}' is unreachable from the root"))
        .collect()
}

fn check_elevated_mutations(doc: &FlowDocument) -> Vec<String> {
    if doc.run_mode != RunMode::Elevated {
        return Vec::new();
    }
    let mutations: Vec<&str> = doc
        .elements
        .values()
        .filter(|e| e.kind.is_mutation())
        .map(|e| e.id.as_str())
        .collect();
    if mutations.is_empty() {
        Vec::new()
    } else {
        vec![format!(
            "flow runs in elevated mode and mutates records ('{}')",
            mutations.join("', '")
        )]
    }
}

/// Format a `ScoreReport` as human-readable text.
#[must_use]
pub fn format_text(report: &ScoreReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Score: {}/{}\n", report.total, report.max));
    for c in &report.categories {
        out.push_str(&format!("  {}: {}/{}\n", c.category, c.score, c.max));
    }
    if report.findings.is_empty() {
        out.push_str("\nNo findings.\n");
    } else {
        out.push_str("\nFindings:\n");
        for f in &report.findings {
            out.push_str(&format!("  {f}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::parser::parse;

    fn doc(text: &str) -> FlowDocument {
        parse(text).unwrap()
    }

    const LOOPED_WRITE: &str = "\
apiVersion: 1
start: load
variables:
  contacts: {type: recordList, input: true}
elements:
  load:
    kind: dataRead
    target: Contact
    uses: [contacts]
    next: each
  each:
    kind: iteration
    collection: contacts
    body: write
    next: done
  write:
    kind: dataWrite
    target: Contact
    next: each
    fault: done
  done:
    kind: assignment
    uses: [contacts]
";

    const BULK_WRITE: &str = "\
apiVersion: 1
start: load
variables:
  contacts: {type: recordList, input: true}
elements:
  load:
    kind: dataRead
    target: Contact
    uses: [contacts]
    next: each
  each:
    kind: iteration
    collection: contacts
    body: tally
    next: write
  tally:
    kind: assignment
    uses: [contacts]
    next: each
  write:
    kind: dataWrite
    target: Contact
    fault: done
    next: done
  done:
    kind: assignment
    uses: [contacts]
";

    #[test]
    fn mutation_in_iteration_is_blocking() {
        let report = score(&doc(LOOPED_WRITE));
        let hit: Vec<_> = report.findings.iter().filter(|f| f.code == B001).collect();
        assert_eq!(hit.len(), 1);
        assert!(hit[0].is_blocking());
        assert!(hit[0].message.contains("mutation nested inside iteration"));
        assert!(hit[0].message.contains("'write'"));
    }

    #[test]
    fn mutation_outside_iteration_is_clean() {
        let report = score(&doc(BULK_WRITE));
        assert!(report.findings.iter().all(|f| f.code != B001));
    }

    #[test]
    fn query_in_iteration_is_blocking() {
        let text = "\
apiVersion: 1
start: each
variables:
  rows: {type: recordList, input: true}
elements:
  each:
    kind: iteration
    collection: rows
    body: lookup
    next: done
  lookup:
    kind: dataRead
    target: Account
    next: each
  done:
    kind: assignment
    uses: [rows]
";
        let report = score(&doc(text));
        assert!(report
            .findings
            .iter()
            .any(|f| f.code == B002 && f.is_blocking()));
    }

    #[test]
    fn missing_fault_edge_is_advisory() {
        let text = "\
apiVersion: 1
start: write
elements:
  write:
    kind: dataWrite
    target: Contact
";
        let report = score(&doc(text));
        let hit = report.findings.iter().find(|f| f.code == A001).unwrap();
        assert_eq!(hit.severity, FindingSeverity::Advisory);
        assert!(hit.message.contains("'write'"));
    }

    #[test]
    fn unused_variable_is_flagged() {
        let text = "\
apiVersion: 1
start: a
variables:
  orphan: {type: text}
elements:
  a:
    kind: assignment
";
        let report = score(&doc(text));
        assert!(report
            .findings
            .iter()
            .any(|f| f.code == A002 && f.message.contains("'orphan'")));
    }

    #[test]
    fn naming_convention_flags_camel_case() {
        let text = "\
apiVersion: 1
start: doThing
elements:
  doThing:
    kind: assignment
";
        let report = score(&doc(text));
        assert!(report
            .findings
            .iter()
            .any(|f| f.code == A003 && f.message.contains("'doThing'")));
    }

    #[test]
    fn canonical_ordering_violation_names_first_offender() {
        // declared: write (dataWrite) before load (dataRead); canonical
        // wants reads first.
        let text = "\
apiVersion: 1
start: write
elements:
  write:
    kind: dataWrite
    target: Contact
    fault: load
    next: load
  load:
    kind: dataRead
    target: Contact
";
        let report = score(&doc(text));
        let hit = report.findings.iter().find(|f| f.code == A004).unwrap();
        assert!(hit.message.contains("'write'"));
    }

    #[test]
    fn canonical_order_round_trips_for_conforming_documents() {
        // A document declared in canonical order reproduces itself.
        let text = "\
apiVersion: 1
start: load
elements:
  load:
    kind: dataRead
    target: Contact
    next: finish
  finish:
    kind: assignment
";
        let d = doc(text);
        let canonical: Vec<String> =
            d.canonical_order().iter().map(|s| s.to_string()).collect();
        assert_eq!(canonical, d.declared_order);
        assert!(score(&d).findings.iter().all(|f| f.code != A004));
    }

    #[test]
    fn single_outcome_branch_is_flagged() {
        let text = "\
apiVersion: 1
start: pick
elements:
  pick:
    kind: branch
    outcomes:
      only: done
  done:
    kind: assignment
";
        let report = score(&doc(text));
        assert!(report
            .findings
            .iter()
            .any(|f| f.code == A005 && f.message.contains("'pick'")));
    }

    #[test]
    fn unreachable_element_is_flagged() {
        let text = "\
apiVersion: 1
start: a
elements:
  a:
    kind: assignment
  stranded:
    kind: assignment
";
        let report = score(&doc(text));
        assert!(report
            .findings
            .iter()
            .any(|f| f.code == A006 && f.message.contains("'stranded'")));
    }

    #[test]
    fn elevated_mode_with_mutation_is_flagged() {
        let text = "\
apiVersion: 1
runMode: elevated
start: write
elements:
  write:
    kind: dataWrite
    target: Contact
    fault: write_done
    next: write_done
  write_done:
    kind: assignment
";
        let report = score(&doc(text));
        assert!(report.findings.iter().any(|f| f.code == A007));
    }

    #[test]
    fn elevated_mode_without_mutation_is_clean() {
        let text = "\
apiVersion: 1
runMode: elevated
start: a
elements:
  a:
    kind: assignment
";
        let report = score(&doc(text));
        assert!(report.findings.iter().all(|f| f.code != A007));
    }

    #[test]
    fn category_scores_floor_at_zero() {
        // Three unreferenced variables at 3 points each plus bad naming
        // push DesignNaming below zero; it must floor at 0.
        let text = "\
apiVersion: 1
start: A1
variables:
  U1: {type: text}
  U2: {type: text}
  U3: {type: text}
  U4: {type: text}
  U5: {type: text}
elements:
  A1:
    kind: assignment
";
        let report = score(&doc(text));
        let dn = report
            .categories
            .iter()
            .find(|c| c.category == Category::DesignNaming)
            .unwrap();
        assert_eq!(dn.score, 0);
    }

    #[test]
    fn total_is_sum_of_categories_and_max_is_100() {
        let report = score(&doc(BULK_WRITE));
        assert_eq!(report.max, 100);
        let sum: u32 = report.categories.iter().map(|c| c.score).sum();
        assert_eq!(report.total, sum);
    }

    #[test]
    fn clean_document_scores_full_marks() {
        let text = "\
apiVersion: 1
start: load
variables:
  contacts: {type: recordList, input: true}
elements:
  load:
    kind: dataRead
    target: Contact
    uses: [contacts]
    next: write
  write_done:
    kind: assignment
  write:
    kind: dataWrite
    target: Contact
    fault: write_done
    next: write_done
";
        let report = score(&doc(text));
        assert_eq!(
            report.total, report.max,
            "unexpected findings: {:?}",
            report.findings
        );
    }

    #[test]
    fn scoring_is_deterministic() {
        let d = doc(LOOPED_WRITE);
        let a = serde_json::to_string(&score(&d)).unwrap();
        let b = serde_json::to_string(&score(&d)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cycle_finding_deducts_from_architecture() {
        let mut report = score(&doc(BULK_WRITE));
        let arch_before = report
            .categories
            .iter()
            .find(|c| c.category == Category::Architecture)
            .unwrap()
            .score;
        apply_cycle_finding(&mut report, "each");
        let arch_after = report
            .categories
            .iter()
            .find(|c| c.category == Category::Architecture)
            .unwrap()
            .score;
        assert!(arch_after < arch_before);
        assert!(report
            .findings
            .iter()
            .any(|f| f.code == B003 && f.is_blocking()));
    }

    #[test]
    fn format_text_lists_categories_and_findings() {
        let report = score(&doc(LOOPED_WRITE));
        let text = format_text(&report);
        assert!(text.contains("Score:"));
        assert!(text.contains("Performance/BulkSafety"));
        assert!(text.contains("mutation nested inside iteration"));
    }
}
