//! Normalization of raw backend diagnostics into the canonical form.
//!
//! Backends differ in severity enumerations and in 0- vs 1-based
//! positions; the descriptor's position base drives a table lookup here
//! rather than per-backend branching. No filtering or deduplication
//! happens at this layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{BackendDescriptor, PositionBase};
use crate::diagnostics::{Diagnostic, Severity};

/// A position as one backend reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosition {
    pub line: u32,
    pub character: u32,
}

/// A range as one backend reported it. Backends that only report a point
/// omit the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRange {
    pub start: RawPosition,
    #[serde(default)]
    pub end: Option<RawPosition>,
}

/// One diagnostic record exactly as a backend sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDiagnostic {
    pub range: RawRange,
    /// Numeric severity in the backend's own enumeration
    /// (1 = error, 2 = warning, 3 = info, 4 = hint).
    #[serde(default)]
    pub severity: Option<i64>,
    /// Backend-assigned code; a string or a number.
    #[serde(default)]
    pub code: Option<Value>,
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Map one backend's raw records into canonical diagnostics.
///
/// Pure: the same input always produces the same output.
#[must_use]
pub fn normalize(
    descriptor: &BackendDescriptor,
    source_path: &str,
    raw: &[RawDiagnostic],
) -> Vec<Diagnostic> {
    raw.iter()
        .map(|r| {
            let (line, column) = adjust(descriptor.position_base, r.range.start);
            let end = r.range.end.unwrap_or(r.range.start);
            let (end_line, end_column) = adjust(descriptor.position_base, end);
            Diagnostic {
                source_path: source_path.to_string(),
                line,
                column,
                end_line,
                end_column,
                severity: map_severity(r.severity),
                code: r.code.as_ref().map(code_to_string),
                message: r.message.clone(),
                origin: descriptor.key.to_string(),
            }
        })
        .collect()
}

/// Shift a raw position into the canonical 1-based convention.
fn adjust(base: PositionBase, position: RawPosition) -> (u32, u32) {
    match base {
        PositionBase::ZeroBased => (
            position.line.saturating_add(1),
            position.character.saturating_add(1),
        ),
        PositionBase::OneBased => (position.line.max(1), position.character.max(1)),
    }
}

/// Map a backend severity number into the canonical three-level scale.
///
/// Hints fold into info; a record without a severity is treated as an
/// error, matching how editors render it.
fn map_severity(severity: Option<i64>) -> Severity {
    match severity {
        Some(2) => Severity::Warning,
        Some(3) | Some(4) => Severity::Info,
        _ => Severity::Error,
    }
}

fn code_to_string(code: &Value) -> String {
    match code {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
