use thiserror::Error;

use crate::flow::parser::ParseError;

/// Errors that can occur during flow validation and backend bridging.
#[derive(Error, Debug)]
pub enum FlowlintError {
    /// Flow document parsing failed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// No backend is registered for the requested file type.
    #[error("no backend registered for file type '{file_type}'")]
    UnknownFileType { file_type: String },

    /// Filesystem I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Freshness feed lookup failed.
    #[error("release feed error: {message}")]
    Feed { message: String },
}

/// Convenience alias for `Result<T, FlowlintError>`.
pub type Result<T> = std::result::Result<T, FlowlintError>;
