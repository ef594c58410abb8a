//! Language-server backends: registry, capability profiles, and the
//! interface the supervisor drives.
//!
//! Each supported file type maps to one backend descriptor: how to find
//! the server, which runtime it needs, and which diagnostics mode it
//! speaks. The supervisor and protocol session depend only on the
//! [`DiagnosticBackend`] trait, never on a concrete server.

pub mod discovery;
pub mod normalize;
pub mod protocol;
pub mod supervisor;

use std::time::Instant;

use serde::Serialize;

use crate::backend::normalize::RawDiagnostic;
use crate::backend::protocol::SessionError;
use crate::version::Version;

/// File types the validator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Automation-flow document (`*.flow.yml`, `*.flow.yaml`, `*.flow.json`).
    Flow,
    /// Plain YAML configuration.
    Yaml,
    /// XML metadata.
    Xml,
}

impl FileType {
    /// Classify a path by extension. Flow documents are matched before
    /// the generic YAML extension.
    #[must_use]
    pub fn from_path(path: &str) -> Option<FileType> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".flow.yml")
            || lower.ends_with(".flow.yaml")
            || lower.ends_with(".flow.json")
        {
            Some(FileType::Flow)
        } else if lower.ends_with(".yml") || lower.ends_with(".yaml") {
            Some(FileType::Yaml)
        } else if lower.ends_with(".xml") {
            Some(FileType::Xml)
        } else {
            None
        }
    }

    /// Registry key of the backend serving this file type.
    ///
    /// Flow documents are YAML on disk, so they share the YAML backend.
    #[must_use]
    pub fn backend_key(&self) -> &'static str {
        match self {
            FileType::Flow | FileType::Yaml => "yaml",
            FileType::Xml => "xml",
        }
    }

    /// Returns `true` for the flow document type, which additionally
    /// receives structural scoring and bulk simulation.
    #[must_use]
    pub fn is_flow(&self) -> bool {
        matches!(self, FileType::Flow)
    }
}

/// Line/column convention a backend reports positions in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionBase {
    ZeroBased,
    OneBased,
}

/// Which document-sync and diagnostics features a backend supports.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CapabilityProfile {
    /// Accepts incremental document sync (full sync is used either way;
    /// the flag is negotiated in the handshake).
    pub incremental_sync: bool,
    /// Supports explicit pull-style diagnostics requests. Backends
    /// without it push diagnostics unsolicited after open.
    pub pull_diagnostics: bool,
}

/// Runtime a server script or jar needs to launch.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeRequirement {
    /// Runtime binary name looked up on PATH.
    pub binary: &'static str,
    /// Environment variable overriding the runtime binary location.
    pub env_override: &'static str,
    /// Arguments that make the runtime print its version.
    pub version_args: &'static [&'static str],
    /// Minimum version the backend requires.
    pub min_version: Version,
}

/// One discovery strategy, tried in declaration order.
#[derive(Debug, Clone, Copy)]
pub enum Probe {
    /// Environment variable naming the server entry point directly.
    EnvOverride(&'static str),
    /// Executable on PATH, launched directly.
    PathBinary(&'static str),
    /// Editor extension bundle directory, versioned; newest version
    /// first. `prefix` matches directories under the extensions root,
    /// `server_relative` is the entry point inside the bundle.
    ExtensionBundle {
        prefix: &'static str,
        server_relative: &'static str,
    },
}

/// Static description of one backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendDescriptor {
    /// Registry key, also used as diagnostic origin.
    pub key: &'static str,
    pub display_name: &'static str,
    /// Language id declared when opening documents.
    pub language_id: &'static str,
    pub probes: &'static [Probe],
    /// Runtime needed when the discovered server is a script or jar.
    /// PATH binaries run without it.
    pub runtime: Option<RuntimeRequirement>,
    /// Arguments appended to every launch command.
    pub launch_args: &'static [&'static str],
    pub capabilities: CapabilityProfile,
    pub position_base: PositionBase,
}

/// The fixed backend registry, loaded once per process lifetime.
pub const REGISTRY: &[BackendDescriptor] = &[
    BackendDescriptor {
        key: "yaml",
        display_name: "YAML language server",
        language_id: "yaml",
        probes: &[
            Probe::EnvOverride("FLOWLINT_YAML_SERVER"),
            Probe::PathBinary("yaml-language-server"),
            Probe::ExtensionBundle {
                prefix: "redhat.vscode-yaml-",
                server_relative: "dist/languageserver.js",
            },
        ],
        runtime: Some(RuntimeRequirement {
            binary: "node",
            env_override: "FLOWLINT_NODE_BIN",
            version_args: &["--version"],
            min_version: Version::new(18, 0, 0),
        }),
        launch_args: &["--stdio"],
        capabilities: CapabilityProfile {
            incremental_sync: true,
            pull_diagnostics: false,
        },
        position_base: PositionBase::ZeroBased,
    },
    BackendDescriptor {
        key: "xml",
        display_name: "XML language server",
        language_id: "xml",
        probes: &[
            Probe::EnvOverride("FLOWLINT_XML_SERVER"),
            Probe::PathBinary("lemminx"),
            Probe::ExtensionBundle {
                prefix: "redhat.vscode-xml-",
                server_relative: "server/org.eclipse.lemminx-uber.jar",
            },
        ],
        runtime: Some(RuntimeRequirement {
            binary: "java",
            env_override: "FLOWLINT_JAVA_BIN",
            version_args: &["-version"],
            min_version: Version::new(11, 0, 0),
        }),
        launch_args: &[],
        capabilities: CapabilityProfile {
            incremental_sync: false,
            pull_diagnostics: true,
        },
        position_base: PositionBase::ZeroBased,
    },
];

/// Look up the backend serving a file type.
#[must_use]
pub fn resolve(file_type: FileType) -> Option<&'static BackendDescriptor> {
    let key = file_type.backend_key();
    REGISTRY.iter().find(|d| d.key == key)
}

/// The interface one live backend session exposes.
///
/// Implemented by the stdio protocol session; tests substitute mocks so
/// the supervisor's pooling and serialization can be exercised without a
/// real server process.
pub trait DiagnosticBackend: Send {
    /// Announce a document's full text to the backend.
    fn open(&mut self, uri: &str, language_id: &str, text: &str) -> Result<(), SessionError>;

    /// Collect diagnostics for a previously opened document, waiting for
    /// a push notification or issuing a pull request depending on the
    /// backend's capability profile. Must return by `deadline`.
    fn request_diagnostics(
        &mut self,
        uri: &str,
        deadline: Instant,
    ) -> Result<Vec<RawDiagnostic>, SessionError>;

    /// Tell the backend the document is no longer open.
    fn close_document(&mut self, uri: &str);

    /// Terminate the session. Called once, on teardown.
    fn shutdown(&mut self);
}
