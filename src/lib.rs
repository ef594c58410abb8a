pub mod backend;
pub mod diagnostics;
pub mod errors;
pub mod flow;
pub mod freshness;
pub mod report;
pub mod version;

// Re-export key types at crate root for convenience.
pub use diagnostics::{Diagnostic, Note, Severity};
pub use errors::{FlowlintError, Result};
pub use report::{validate, Report, ValidateOptions};

pub use backend::supervisor::Supervisor;
pub use backend::FileType;
pub use flow::parser::{parse, ParseError};
pub use flow::rules::{score, Finding, ScoreReport};
pub use flow::simulate::{simulate, simulate_with, QuotaConfig, SimPolicy, SimulationResult};
