//! The validation entry point: one call per file, merging backend
//! diagnostics with the flow analyzer's score and simulation.

use serde::Serialize;

use crate::backend::normalize;
use crate::backend::supervisor::Supervisor;
use crate::backend::{resolve, FileType};
use crate::diagnostics::{Diagnostic, Note, Severity};
use crate::flow::parser;
use crate::flow::rules::{self, ScoreReport};
use crate::flow::simulate::{simulate_with, QuotaConfig, SimPolicy, SimulationResult};

/// Options controlling one validation call.
#[derive(Debug, Clone)]
pub struct ValidateOptions {
    /// Synthetic batch size for the bulk simulation.
    pub records: u64,
    /// Nesting cost policy for the simulation.
    pub policy: SimPolicy,
    /// Per-run resource ceilings.
    pub quotas: QuotaConfig,
    /// When false, the language-backend bridge is skipped entirely and
    /// only the flow analyzer runs.
    pub use_backends: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            records: 250,
            policy: SimPolicy::default(),
            quotas: QuotaConfig::default(),
            use_backends: true,
        }
    }
}

/// The merged result of one validation call.
#[derive(Debug, Serialize)]
pub struct Report {
    pub path: String,
    /// Resolved file type; absent when the path is not a recognized type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
    pub diagnostics: Vec<Diagnostic>,
    /// Present only for flow documents that parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreReport>,
    /// Present only for flow documents that parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<SimulationResult>,
    /// Degraded capabilities and other soft conditions.
    pub notes: Vec<Note>,
}

impl Report {
    /// Returns `true` when nothing blocking was found: no error-severity
    /// diagnostic and no blocking finding.
    #[must_use]
    pub fn passed(&self) -> bool {
        let diag_errors = self.diagnostics.iter().any(Diagnostic::is_error);
        let blocking = self
            .score
            .as_ref()
            .is_some_and(|s| s.findings.iter().any(|f| f.is_blocking()));
        !diag_errors && !blocking
    }
}

/// Validate one file: resolve its backend, run the diagnostics exchange,
/// and, for flow documents, score and simulate the parsed graph.
///
/// Failures degrade, they never escape: a missing backend or a dead
/// session becomes a note, a malformed flow document becomes an error
/// diagnostic with the graph passes skipped.
pub fn validate(
    supervisor: &Supervisor,
    path: &str,
    contents: &str,
    options: &ValidateOptions,
) -> Report {
    let mut report = Report {
        path: path.to_string(),
        file_type: FileType::from_path(path),
        diagnostics: Vec::new(),
        score: None,
        simulation: None,
        notes: Vec::new(),
    };

    let Some(file_type) = report.file_type else {
        report
            .notes
            .push(Note::new("flowlint", format!("unrecognized file type: {path}")));
        return report;
    };

    if options.use_backends {
        match resolve(file_type) {
            Some(descriptor) => {
                let uri = file_uri(path);
                match supervisor.collect_diagnostics(descriptor, &uri, contents) {
                    Ok(raw) => {
                        report
                            .diagnostics
                            .extend(normalize::normalize(descriptor, path, &raw));
                    }
                    Err(failure) => report.notes.push(failure.to_note()),
                }
            }
            None => {
                report.notes.push(Note::new(
                    "flowlint",
                    format!("no backend registered for {file_type:?} files"),
                ));
            }
        }
    }

    if file_type.is_flow() {
        match parser::parse(contents) {
            Ok(doc) => {
                let mut score = rules::score(&doc);
                let simulation =
                    simulate_with(&doc, options.records, options.policy, &options.quotas);
                if let Some(cycle) = &simulation.cycle {
                    rules::apply_cycle_finding(&mut score, &cycle.element_id);
                }
                report.score = Some(score);
                report.simulation = Some(simulation);
            }
            Err(e) => {
                report.diagnostics.push(Diagnostic {
                    source_path: path.to_string(),
                    line: 1,
                    column: 1,
                    end_line: 1,
                    end_column: 1,
                    severity: Severity::Error,
                    code: None,
                    message: e.to_string(),
                    origin: "flow".to_string(),
                });
            }
        }
    }

    report
}

fn file_uri(path: &str) -> String {
    if path.starts_with('/') {
        format!("file://{path}")
    } else {
        format!("file:///{path}")
    }
}

/// Render a report as human-readable text.
#[must_use]
pub fn format_text(report: &Report) -> String {
    let mut out = String::new();

    for note in &report.notes {
        out.push_str(&format!("{note}\n"));
    }
    for diag in &report.diagnostics {
        out.push_str(&format!("{diag}\n"));
    }

    if let Some(score) = &report.score {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&rules::format_text(score));
    }

    if let Some(simulation) = &report.simulation {
        out.push_str(&format!(
            "\nSimulation ({} records):\n",
            simulation.records_simulated
        ));
        out.push_str(&format!(
            "  queryOps: {}\n  mutationOps: {}\n  mutatedRows: {}\n  elapsedUnits: {}\n",
            simulation.counts.query_ops,
            simulation.counts.mutation_ops,
            simulation.counts.mutated_rows,
            simulation.counts.elapsed_units,
        ));
        for violation in &simulation.violations {
            out.push_str(&format!("  quota violation: {}\n", violation.reason));
        }
        if let Some(cycle) = &simulation.cycle {
            out.push_str(&format!(
                "  structural cycle detected at '{}'; counts are partial\n",
                cycle.element_id
            ));
        }
    }

    let verdict = if report.passed() { "PASS" } else { "FAIL" };
    out.push_str(&format!("\nResult: {verdict}\n"));
    out
}
