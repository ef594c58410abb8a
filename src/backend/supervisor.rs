//! Backend session pool and lifecycle supervision.
//!
//! One live session is kept per backend key; concurrent validation calls
//! for the same key serialize on that session's mutex, which is held for
//! exactly one open/collect exchange. Any session failure discards the
//! session; the next call launches fresh. Sessions idle longer than the
//! timeout are reaped opportunistically on the next pool access.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::backend::discovery::{discover, DiscoveryFailure};
use crate::backend::normalize::RawDiagnostic;
use crate::backend::protocol::{ProtocolSession, SessionError, CALL_DEADLINE};
use crate::backend::{BackendDescriptor, DiagnosticBackend};
use crate::diagnostics::Note;

/// Sessions unused for this long are torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// When set, backend stderr is appended to this file instead of being
/// discarded.
const STDERR_LOG_ENV: &str = "FLOWLINT_BACKEND_LOG";

/// Why a validation call got zero diagnostics from a backend.
#[derive(Debug)]
pub enum BridgeFailure {
    /// Backend or runtime not found, or runtime too old.
    Discovery(DiscoveryFailure),
    /// A live session failed; it has been discarded.
    Session {
        backend: &'static str,
        error: SessionError,
    },
}

impl BridgeFailure {
    /// Render as a report note.
    #[must_use]
    pub fn to_note(&self) -> Note {
        match self {
            BridgeFailure::Discovery(failure) => failure.to_note(),
            BridgeFailure::Session { backend, error } => Note::new(
                *backend,
                format!("backend session failed: {error}; diagnostics skipped this run"),
            )
            .with_remediation("the session is relaunched on the next validation"),
        }
    }
}

/// Factory producing a live session for a descriptor. Injectable so the
/// pool can be driven without real processes.
pub type Launcher = Box<
    dyn Fn(&'static BackendDescriptor) -> Result<Box<dyn DiagnosticBackend>, BridgeFailure>
        + Send
        + Sync,
>;

struct Slot {
    session: Option<Box<dyn DiagnosticBackend>>,
    last_used: Instant,
}

/// Owns every live backend session for this process.
pub struct Supervisor {
    pool: Mutex<HashMap<&'static str, Arc<Mutex<Slot>>>>,
    launcher: Launcher,
    idle_timeout: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Supervisor launching real backend processes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_launcher(Box::new(launch_process), IDLE_TIMEOUT)
    }

    /// Supervisor with an injected launcher, for tests and embedding.
    #[must_use]
    pub fn with_launcher(launcher: Launcher, idle_timeout: Duration) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            launcher,
            idle_timeout,
        }
    }

    /// Run one diagnostics exchange against the backend for `descriptor`.
    ///
    /// Acquires (launching if needed) the single session for the
    /// descriptor's key, opens the document, collects diagnostics, and
    /// releases the session for reuse. Every failure discards the session
    /// and degrades to a [`BridgeFailure`].
    pub fn collect_diagnostics(
        &self,
        descriptor: &'static BackendDescriptor,
        uri: &str,
        text: &str,
    ) -> Result<Vec<RawDiagnostic>, BridgeFailure> {
        self.reap_idle();

        let slot = self.slot_for(descriptor.key);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if slot.session.is_none() {
            slot.session = Some((self.launcher)(descriptor)?);
        }
        let session = slot.session.as_mut().expect("session just ensured");

        let deadline = Instant::now() + CALL_DEADLINE;
        let result = session
            .open(uri, descriptor.language_id, text)
            .and_then(|()| session.request_diagnostics(uri, deadline));

        match result {
            Ok(diags) => {
                session.close_document(uri);
                slot.last_used = Instant::now();
                Ok(diags)
            }
            Err(error) => {
                log::warn!("{}: session failed ({error}), discarding", descriptor.key);
                if let Some(mut dead) = slot.session.take() {
                    dead.shutdown();
                }
                Err(BridgeFailure::Session {
                    backend: descriptor.key,
                    error,
                })
            }
        }
    }

    /// Tear down every live session.
    pub fn shutdown_all(&self) {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in pool.values() {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(mut session) = slot.session.take() {
                session.shutdown();
            }
        }
    }

    fn slot_for(&self, key: &'static str) -> Arc<Mutex<Slot>> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    session: None,
                    last_used: Instant::now(),
                }))
            })
            .clone()
    }

    /// Tear down sessions idle past the timeout. Busy slots are skipped;
    /// they will be reaped on a later access.
    fn reap_idle(&self) {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, slot) in pool.iter() {
            if let Ok(mut slot) = slot.try_lock() {
                let idle = slot.last_used.elapsed() >= self.idle_timeout;
                if idle {
                    if let Some(mut session) = slot.session.take() {
                        log::debug!("{key}: reaping idle session");
                        session.shutdown();
                    }
                }
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Discover, spawn, and handshake a real backend process.
fn launch_process(
    descriptor: &'static BackendDescriptor,
) -> Result<Box<dyn DiagnosticBackend>, BridgeFailure> {
    let discovered = discover(descriptor).map_err(BridgeFailure::Discovery)?;

    let stderr = match std::env::var(STDERR_LOG_ENV) {
        Ok(path) => OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map(Stdio::from)
            .unwrap_or_else(|e| {
                log::warn!("cannot open backend log {path}: {e}");
                Stdio::null()
            }),
        Err(_) => Stdio::null(),
    };

    let child = Command::new(&discovered.program)
        .args(&discovered.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(stderr)
        .spawn()
        .map_err(|e| BridgeFailure::Session {
            backend: descriptor.key,
            error: SessionError::Crashed(format!(
                "failed to spawn {}: {e}",
                discovered.program.display()
            )),
        })?;

    log::debug!(
        "{}: launched {} (via {})",
        descriptor.key,
        discovered.program.display(),
        discovered.via
    );

    let session = ProtocolSession::initialize(
        child,
        descriptor.key,
        descriptor.capabilities.pull_diagnostics,
    )
    .map_err(|error| BridgeFailure::Session {
        backend: descriptor.key,
        error,
    })?;

    Ok(Box::new(session))
}
