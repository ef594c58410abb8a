//! Canonical diagnostics shared by every backend and by the flow analyzer.
//!
//! Each backend reports positions and severities in its own convention;
//! the normalizer maps them all into this one structure so the report
//! layer never has to know which backend produced an entry.

use std::fmt;

use serde::Serialize;

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A defect that makes the file unusable.
    Error,
    /// A potential issue that does not block.
    Warning,
    /// An informational note.
    Info,
}

/// One normalized issue reported against a file.
///
/// Positions are 1-based. Ranges are half-open `[start, end)`; a
/// diagnostic with no end position repeats the start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Path of the file the diagnostic refers to.
    pub source_path: String,
    /// 1-based start line.
    pub line: u32,
    /// 1-based start column.
    pub column: u32,
    /// 1-based end line (exclusive range end).
    pub end_line: u32,
    /// 1-based end column (exclusive range end).
    pub end_column: u32,
    /// Severity level.
    pub severity: Severity,
    /// Backend-assigned code, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Which backend produced this diagnostic.
    pub origin: String,
}

impl Diagnostic {
    /// Returns `true` if this diagnostic is an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(
            f,
            "{}:{}:{}: {sev}: {}",
            self.source_path, self.line, self.column, self.message
        )?;
        if let Some(code) = &self.code {
            write!(f, " [{}:{code}]", self.origin)?;
        } else {
            write!(f, " [{}]", self.origin)?;
        }
        Ok(())
    }
}

/// An informational note attached to a report.
///
/// Notes carry conditions that degrade a validation call without failing
/// it: a backend that could not be discovered, a runtime that is too old,
/// a session that timed out. Each note names the remediation step.
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    /// The affected component (backend key or runtime name).
    pub component: String,
    /// What happened.
    pub message: String,
    /// The exact step that would resolve the condition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Note {
    /// Create a new note for a component.
    #[must_use]
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            message: message.into(),
            remediation: None,
        }
    }

    /// Attach a remediation step.
    #[must_use]
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "note: {}: {}", self.component, self.message)?;
        if let Some(r) = &self.remediation {
            write!(f, " ({r})")?;
        }
        Ok(())
    }
}
