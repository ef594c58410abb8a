//! Backend discovery: ordered probes with fail-over, plus the runtime
//! version gate.
//!
//! A missing backend is a degrade-not-fail condition: discovery returns a
//! [`DiscoveryFailure`] naming the remediation step and the caller
//! proceeds with zero diagnostics from that backend.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::backend::{BackendDescriptor, Probe};
use crate::diagnostics::Note;
use crate::version::Version;

/// A backend located by one of the descriptor's probes, ready to launch.
#[derive(Debug, Clone)]
pub struct DiscoveredBackend {
    pub key: &'static str,
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Which probe located the server (for the `backends` report).
    pub via: String,
    /// Runtime version found by the gate, when a runtime is involved.
    pub runtime_version: Option<Version>,
}

/// Backend or runtime not found, or runtime below the required minimum.
#[derive(Debug, Clone)]
pub struct DiscoveryFailure {
    pub backend: &'static str,
    pub message: String,
    pub remediation: String,
}

impl DiscoveryFailure {
    /// Render as a report note.
    #[must_use]
    pub fn to_note(&self) -> Note {
        Note::new(self.backend, self.message.clone()).with_remediation(self.remediation.clone())
    }
}

/// Environment accessor, injectable so tests control discovery inputs.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Discover a backend using the real process environment.
pub fn discover(descriptor: &BackendDescriptor) -> Result<DiscoveredBackend, DiscoveryFailure> {
    let env = |name: &str| std::env::var(name).ok();
    let home = dirs::home_dir();
    discover_with_env(descriptor, &env, home.as_deref())
}

/// Discover a backend with explicit environment and home directory.
///
/// Probes are tried in declaration order; the first hit wins. A probe
/// that points at a missing file fails over to the next.
pub fn discover_with_env(
    descriptor: &BackendDescriptor,
    env: EnvLookup<'_>,
    home: Option<&Path>,
) -> Result<DiscoveredBackend, DiscoveryFailure> {
    for probe in descriptor.probes {
        match *probe {
            Probe::EnvOverride(var) => {
                let Some(value) = env(var) else { continue };
                let path = PathBuf::from(&value);
                if !path.is_file() {
                    log::warn!("{var} points at missing file {value}, trying next probe");
                    continue;
                }
                return launch_plan(descriptor, path, format!("env:{var}"), env);
            }
            Probe::PathBinary(name) => {
                if let Some(path) = find_in_path(name, env("PATH")) {
                    // A PATH binary embeds its own runtime.
                    let args: Vec<String> =
                        descriptor.launch_args.iter().map(|s| s.to_string()).collect();
                    return Ok(DiscoveredBackend {
                        key: descriptor.key,
                        program: path,
                        args,
                        via: format!("path:{name}"),
                        runtime_version: None,
                    });
                }
            }
            Probe::ExtensionBundle {
                prefix,
                server_relative,
            } => {
                let Some(home) = home else { continue };
                for root in extension_roots(home) {
                    if let Some((version, path)) =
                        newest_bundle(&root, prefix, server_relative)
                    {
                        return launch_plan(
                            descriptor,
                            path,
                            format!("bundle:{prefix}{version}"),
                            env,
                        );
                    }
                }
            }
        }
    }

    Err(DiscoveryFailure {
        backend: descriptor.key,
        message: format!("{} not found", descriptor.display_name),
        remediation: remediation_for(descriptor),
    })
}

/// Build the launch command for a server entry point that needs a
/// runtime, gating on the runtime's minimum version.
fn launch_plan(
    descriptor: &BackendDescriptor,
    server_path: PathBuf,
    via: String,
    env: EnvLookup<'_>,
) -> Result<DiscoveredBackend, DiscoveryFailure> {
    let Some(runtime) = &descriptor.runtime else {
        let args: Vec<String> = descriptor.launch_args.iter().map(|s| s.to_string()).collect();
        return Ok(DiscoveredBackend {
            key: descriptor.key,
            program: server_path,
            args,
            via,
            runtime_version: None,
        });
    };

    let runtime_path = env(runtime.env_override)
        .map(PathBuf::from)
        .filter(|p| p.is_file())
        .or_else(|| find_in_path(runtime.binary, env("PATH")))
        .ok_or_else(|| DiscoveryFailure {
            backend: descriptor.key,
            message: format!(
                "runtime '{}' for {} not found",
                runtime.binary, descriptor.display_name
            ),
            remediation: format!(
                "install {} >= {} or set {}",
                runtime.binary, runtime.min_version, runtime.env_override
            ),
        })?;

    let runtime_version = probe_runtime_version(&runtime_path, runtime.version_args);
    if let Some(found) = runtime_version {
        if !found.satisfies(&runtime.min_version) {
            return Err(DiscoveryFailure {
                backend: descriptor.key,
                message: format!(
                    "runtime '{}' is {found}, below the required {}",
                    runtime.binary, runtime.min_version
                ),
                remediation: format!("upgrade {} to >= {}", runtime.binary, runtime.min_version),
            });
        }
    } else {
        log::warn!(
            "could not determine {} version, launching anyway",
            runtime.binary
        );
    }

    let server = server_path.to_string_lossy().into_owned();
    let mut args = if server.ends_with(".jar") {
        vec!["-jar".to_string(), server]
    } else {
        vec![server]
    };
    args.extend(descriptor.launch_args.iter().map(|s| s.to_string()));

    Ok(DiscoveredBackend {
        key: descriptor.key,
        program: runtime_path,
        args,
        via,
        runtime_version,
    })
}

/// Look a binary up on a PATH-style variable.
fn find_in_path(name: &str, path_var: Option<String>) -> Option<PathBuf> {
    let path_var = path_var?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Editor extension roots probed for bundled servers.
fn extension_roots(home: &Path) -> Vec<PathBuf> {
    vec![
        home.join(".vscode").join("extensions"),
        home.join(".vscode-server").join("extensions"),
    ]
}

/// Find the newest versioned bundle under `root` whose directory name
/// starts with `prefix` and which contains `server_relative`.
fn newest_bundle(root: &Path, prefix: &str, server_relative: &str) -> Option<(Version, PathBuf)> {
    let entries = std::fs::read_dir(root).ok()?;
    let mut candidates: Vec<(Version, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(version_str) = name.strip_prefix(prefix) else {
            continue;
        };
        let Some(version) = Version::parse(version_str) else {
            continue;
        };
        let server = entry.path().join(server_relative);
        if server.is_file() {
            candidates.push((version, server));
        }
    }
    // Newest version first, by semantic-version order.
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().next()
}

/// Run the runtime with its version arguments and parse the banner.
///
/// Java prints its banner to stderr, Node to stdout; both streams are
/// searched.
fn probe_runtime_version(program: &Path, args: &[&str]) -> Option<Version> {
    let output = Command::new(program).args(args).output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Version::parse(&stdout).or_else(|| Version::parse(&stderr))
}

fn remediation_for(descriptor: &BackendDescriptor) -> String {
    let mut options: Vec<String> = Vec::new();
    for probe in descriptor.probes {
        match probe {
            Probe::EnvOverride(var) => options.push(format!("set {var}")),
            Probe::PathBinary(name) => options.push(format!("install '{name}' on PATH")),
            Probe::ExtensionBundle { prefix, .. } => {
                options.push(format!("install the {prefix}* editor extension"))
            }
        }
    }
    options.join(", or ")
}
