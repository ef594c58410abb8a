//! Client side of the stdio language-server protocol.
//!
//! Frames are length-prefixed (`Content-Length` header, blank line, JSON
//! body). Requests carry monotonically increasing correlation ids;
//! responses are matched by id and anything unmatched is dropped with a
//! log line. A reader thread owns the child's stdout and forwards parsed
//! frames over a channel so every wait can carry a deadline.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdout};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;

use crate::backend::normalize::RawDiagnostic;
use crate::backend::DiagnosticBackend;

/// Deadline for the initial handshake; a backend that does not answer in
/// time is killed and the call degrades like a missing backend.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall deadline for one validation exchange.
pub const CALL_DEADLINE: Duration = Duration::from_secs(8);

/// Upper bound on a declared frame body.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Failure of one live session. Every variant discards the session; the
/// next validation call launches fresh.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The backend did not respond before the deadline.
    #[error("backend did not respond before the deadline")]
    DeadlineExpired,

    /// The backend sent a frame that violates the wire contract. Not
    /// retryable within this session.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The backend process died or closed its output stream.
    #[error("backend crashed: {0}")]
    Crashed(String),

    /// Writing to the backend failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The backend answered a request with an error object.
    #[error("backend returned error {code}: {message}")]
    ResponseError { code: i64, message: String },
}

/// Write one length-prefixed frame.
pub fn write_frame(writer: &mut impl Write, body: &Value) -> io::Result<()> {
    let payload = serde_json::to_vec(body).map_err(io::Error::other)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on clean EOF between frames. A missing or invalid
/// `Content-Length`, a body shorter than declared, or a body that is not
/// JSON are all hard protocol violations surfaced as errors.
pub fn read_frame(reader: &mut impl BufRead) -> io::Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    let mut read_any = false;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            if read_any {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF inside frame headers",
                ));
            }
            return Ok(None);
        }
        read_any = true;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            let len: usize = value.trim().parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid Content-Length: {value:?}"),
                )
            })?;
            content_length = Some(len);
        }
        // Other headers (Content-Type) are ignored.
    }

    let len = content_length.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "frame without Content-Length")
    })?;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("declared frame length {len} exceeds maximum"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let value = serde_json::from_slice(&body).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body is not valid JSON: {e}"),
        )
    })?;
    Ok(Some(value))
}

/// Events forwarded from the reader thread.
enum FrameEvent {
    Frame(Value),
    Eof,
    Malformed(String),
}

fn reader_loop(stdout: ChildStdout, tx: mpsc::Sender<FrameEvent>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame)) => {
                if tx.send(FrameEvent::Frame(frame)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(FrameEvent::Eof);
                return;
            }
            Err(e)
                if e.kind() == io::ErrorKind::InvalidData
                    || e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                let _ = tx.send(FrameEvent::Malformed(e.to_string()));
                return;
            }
            Err(e) => {
                let _ = tx.send(FrameEvent::Eof);
                log::debug!("backend stdout closed: {e}");
                return;
            }
        }
    }
}

/// One live protocol session over a backend's standard streams.
pub struct ProtocolSession {
    child: Option<Child>,
    writer: Box<dyn Write + Send>,
    events: Receiver<FrameEvent>,
    next_id: u64,
    /// In-flight request id → method name. Responses for ids absent here
    /// are dropped.
    pending: HashMap<u64, &'static str>,
    /// Push diagnostics buffered per document uri.
    pushed: HashMap<String, Vec<RawDiagnostic>>,
    /// Capabilities the server declared in the handshake.
    server_capabilities: Value,
    pull_diagnostics: bool,
    key: &'static str,
    doc_version: i64,
}

impl ProtocolSession {
    /// Wire a spawned child process and perform the versioned handshake.
    ///
    /// The child must have piped stdin and stdout. On handshake timeout
    /// the caller owns killing the process (dropping the session does).
    pub fn initialize(
        mut child: Child,
        key: &'static str,
        pull_diagnostics: bool,
    ) -> Result<Self, SessionError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Crashed("child stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Crashed("child stdout not piped".to_string()))?;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || reader_loop(stdout, tx));

        let mut session = Self {
            child: Some(child),
            writer: Box::new(stdin),
            events: rx,
            next_id: 0,
            pending: HashMap::new(),
            pushed: HashMap::new(),
            server_capabilities: Value::Null,
            pull_diagnostics,
            key,
            doc_version: 0,
        };
        session.handshake()?;
        Ok(session)
    }

    fn handshake(&mut self) -> Result<(), SessionError> {
        let params = json!({
            "processId": std::process::id(),
            "rootUri": null,
            "clientInfo": {
                "name": "flowlint",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "textDocument": {
                    "synchronization": { "didSave": false },
                    "publishDiagnostics": { "relatedInformation": false },
                    "diagnostic": { "dynamicRegistration": false },
                },
            },
        });
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let result = self.request("initialize", params, deadline)?;
        self.server_capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        self.notify("initialized", json!({}))?;
        Ok(())
    }

    /// Capabilities negotiated during the handshake.
    #[must_use]
    pub fn server_capabilities(&self) -> &Value {
        &self.server_capabilities
    }

    fn notify(&mut self, method: &str, params: Value) -> Result<(), SessionError> {
        write_frame(
            &mut self.writer,
            &json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        )?;
        Ok(())
    }

    /// Send a request and block until its correlated response or the
    /// deadline, whichever comes first.
    fn request(
        &mut self,
        method: &'static str,
        params: Value,
        deadline: Instant,
    ) -> Result<Value, SessionError> {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, method);
        write_frame(
            &mut self.writer,
            &json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }),
        )?;

        loop {
            let event = self.next_event(deadline)?;
            if let Some(result) = self.handle_frame(event, Some(id))? {
                return Ok(result);
            }
        }
    }

    /// Block for the next frame, honoring the deadline.
    fn next_event(&mut self, deadline: Instant) -> Result<Value, SessionError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SessionError::DeadlineExpired);
        }
        match self.events.recv_timeout(remaining) {
            Ok(FrameEvent::Frame(frame)) => Ok(frame),
            Ok(FrameEvent::Eof) => {
                Err(SessionError::Crashed("backend closed its output stream".to_string()))
            }
            Ok(FrameEvent::Malformed(message)) => Err(SessionError::ProtocolViolation(message)),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::DeadlineExpired),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SessionError::Crashed("backend reader stopped".to_string()))
            }
        }
    }

    /// Dispatch one inbound frame.
    ///
    /// Returns `Ok(Some(result))` when the frame is the response to
    /// `waiting_for`; everything else is absorbed (notifications
    /// buffered, server-to-client requests answered, stale responses
    /// dropped).
    fn handle_frame(
        &mut self,
        frame: Value,
        waiting_for: Option<u64>,
    ) -> Result<Option<Value>, SessionError> {
        let id = frame.get("id").and_then(Value::as_u64);
        let method = frame.get("method").and_then(Value::as_str);

        match (id, method) {
            // Response.
            (Some(id), None) => {
                if self.pending.remove(&id).is_none() {
                    log::warn!("{}: dropping response for unknown request id {id}", self.key);
                    return Ok(None);
                }
                if waiting_for != Some(id) {
                    log::warn!("{}: dropping stale response for request id {id}", self.key);
                    return Ok(None);
                }
                if let Some(error) = frame.get("error") {
                    return Err(SessionError::ResponseError {
                        code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                        message: error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    });
                }
                Ok(Some(frame.get("result").cloned().unwrap_or(Value::Null)))
            }
            // Server-to-client request: answer with a null result so the
            // backend does not stall waiting on us.
            (Some(id), Some(method)) => {
                log::debug!("{}: answering server request '{method}' with null", self.key);
                write_frame(
                    &mut self.writer,
                    &json!({ "jsonrpc": "2.0", "id": id, "result": null }),
                )?;
                Ok(None)
            }
            // Notification.
            (None, Some(method)) => {
                if method == "textDocument/publishDiagnostics" {
                    self.buffer_push_diagnostics(frame.get("params"));
                }
                Ok(None)
            }
            (None, None) => {
                Err(SessionError::ProtocolViolation(
                    "frame is neither request, response, nor notification".to_string(),
                ))
            }
        }
    }

    fn buffer_push_diagnostics(&mut self, params: Option<&Value>) {
        let Some(params) = params else { return };
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return;
        };
        let raw = params
            .get("diagnostics")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        match serde_json::from_value::<Vec<RawDiagnostic>>(raw) {
            Ok(diags) => {
                self.pushed.insert(uri.to_string(), diags);
            }
            Err(e) => {
                log::warn!("{}: unreadable diagnostics for {uri}: {e}", self.key);
                self.pushed.insert(uri.to_string(), Vec::new());
            }
        }
    }
}

impl DiagnosticBackend for ProtocolSession {
    fn open(&mut self, uri: &str, language_id: &str, text: &str) -> Result<(), SessionError> {
        self.pushed.remove(uri);
        self.doc_version += 1;
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": self.doc_version,
                    "text": text,
                },
            }),
        )
    }

    fn request_diagnostics(
        &mut self,
        uri: &str,
        deadline: Instant,
    ) -> Result<Vec<RawDiagnostic>, SessionError> {
        if self.pull_diagnostics {
            let result = self.request(
                "textDocument/diagnostic",
                json!({ "textDocument": { "uri": uri } }),
                deadline,
            )?;
            let items = result
                .get("items")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            return serde_json::from_value(items).map_err(|e| {
                SessionError::ProtocolViolation(format!("unreadable pull diagnostics: {e}"))
            });
        }

        // Push mode: wait for the unsolicited notification matching this
        // document's identity.
        loop {
            if let Some(diags) = self.pushed.remove(uri) {
                return Ok(diags);
            }
            let frame = self.next_event(deadline)?;
            self.handle_frame(frame, None)?;
        }
    }

    fn close_document(&mut self, uri: &str) {
        let result = self.notify(
            "textDocument/didClose",
            json!({ "textDocument": { "uri": uri } }),
        );
        if let Err(e) = result {
            log::debug!("{}: didClose failed: {e}", self.key);
        }
        self.pushed.remove(uri);
    }

    fn shutdown(&mut self) {
        // Polite shutdown with a short deadline; the kill below is the
        // backstop either way.
        let deadline = Instant::now() + Duration::from_secs(1);
        if self.request("shutdown", Value::Null, deadline).is_ok() {
            let _ = self.notify("exit", Value::Null);
        }
        if let Some(child) = &mut self.child {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.child = None;
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc::Sender;
    use std::sync::{Arc, Mutex};

    // ── Framing ─────────────────────────────────────────────────────

    #[test]
    fn frame_round_trip() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let mut buf = Vec::new();
        write_frame(&mut buf, &body).unwrap();
        let mut reader = Cursor::new(buf);
        let read = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(read, body);
        // Clean EOF after the frame.
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn frame_header_is_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &json!({"a": 1})).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("Content-Length: 7\r\n\r\n"));
        assert!(text.ends_with("{\"a\":1}"));
    }

    #[test]
    fn declared_length_longer_than_body_is_an_error() {
        let data = b"Content-Length: 100\r\n\r\n{\"a\":1}";
        let mut reader = Cursor::new(&data[..]);
        let err = read_frame(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn missing_content_length_is_invalid_data() {
        let data = b"Content-Type: application/json\r\n\r\n{}";
        let mut reader = Cursor::new(&data[..]);
        let err = read_frame(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn non_json_body_is_invalid_data() {
        let data = b"Content-Length: 5\r\n\r\nhello";
        let mut reader = Cursor::new(&data[..]);
        let err = read_frame(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let data = b"Content-Length: 99999999999\r\n\r\n";
        let mut reader = Cursor::new(&data[..]);
        let err = read_frame(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_inside_headers_is_an_error() {
        let data = b"Content-Length: 5\r\n";
        let mut reader = Cursor::new(&data[..]);
        assert!(read_frame(&mut reader).is_err());
    }

    // ── Correlation ─────────────────────────────────────────────────

    /// Shared sink capturing everything the session writes.
    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Build a session wired to a channel and a capture buffer, skipping
    /// the process handshake.
    fn test_session() -> (ProtocolSession, Sender<FrameEvent>, SharedBuf) {
        let (tx, rx) = mpsc::channel();
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let session = ProtocolSession {
            child: None,
            writer: Box::new(buf.clone()),
            events: rx,
            next_id: 0,
            pending: HashMap::new(),
            pushed: HashMap::new(),
            server_capabilities: Value::Null,
            pull_diagnostics: false,
            key: "test",
            doc_version: 0,
        };
        (session, tx, buf)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(500)
    }

    #[test]
    fn response_is_matched_by_id() {
        let (mut session, tx, _buf) = test_session();
        tx.send(FrameEvent::Frame(
            json!({"jsonrpc": "2.0", "id": 0, "result": {"ok": true}}),
        ))
        .unwrap();
        let result = session.request("test/echo", json!({}), soon()).unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[test]
    fn stale_response_is_dropped_not_delivered() {
        let (mut session, tx, _buf) = test_session();
        // A response for an id that was never issued arrives first; the
        // real response follows. The request must see only its own.
        tx.send(FrameEvent::Frame(
            json!({"jsonrpc": "2.0", "id": 99, "result": {"stolen": true}}),
        ))
        .unwrap();
        tx.send(FrameEvent::Frame(
            json!({"jsonrpc": "2.0", "id": 0, "result": {"mine": true}}),
        ))
        .unwrap();
        let result = session.request("test/echo", json!({}), soon()).unwrap();
        assert_eq!(result, json!({"mine": true}));
    }

    #[test]
    fn request_ids_increase_monotonically() {
        let (mut session, tx, _buf) = test_session();
        tx.send(FrameEvent::Frame(json!({"id": 0, "result": 1})))
            .unwrap();
        tx.send(FrameEvent::Frame(json!({"id": 1, "result": 2})))
            .unwrap();
        assert_eq!(session.request("a", json!({}), soon()).unwrap(), json!(1));
        assert_eq!(session.request("b", json!({}), soon()).unwrap(), json!(2));
    }

    #[test]
    fn error_response_surfaces_code_and_message() {
        let (mut session, tx, _buf) = test_session();
        tx.send(FrameEvent::Frame(json!({
            "jsonrpc": "2.0",
            "id": 0,
            "error": {"code": -32601, "message": "method not found"},
        })))
        .unwrap();
        match session.request("nope", json!({}), soon()) {
            Err(SessionError::ResponseError { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("expected ResponseError, got {other:?}"),
        }
    }

    #[test]
    fn deadline_expiry_is_reported() {
        let (mut session, _tx, _buf) = test_session();
        let deadline = Instant::now() + Duration::from_millis(30);
        match session.request("slow", json!({}), deadline) {
            Err(SessionError::DeadlineExpired) => {}
            other => panic!("expected DeadlineExpired, got {other:?}"),
        }
    }

    #[test]
    fn eof_is_reported_as_crash() {
        let (mut session, tx, _buf) = test_session();
        tx.send(FrameEvent::Eof).unwrap();
        match session.request("x", json!({}), soon()) {
            Err(SessionError::Crashed(_)) => {}
            other => panic!("expected Crashed, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_is_a_protocol_violation() {
        let (mut session, tx, _buf) = test_session();
        tx.send(FrameEvent::Malformed("declared length mismatch".to_string()))
            .unwrap();
        match session.request("x", json!({}), soon()) {
            Err(SessionError::ProtocolViolation(m)) => {
                assert!(m.contains("length"));
            }
            other => panic!("expected ProtocolViolation, got {other:?}"),
        }
    }

    #[test]
    fn server_request_gets_null_reply() {
        let (mut session, tx, buf) = test_session();
        tx.send(FrameEvent::Frame(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "workspace/configuration",
            "params": {},
        })))
        .unwrap();
        tx.send(FrameEvent::Frame(json!({"id": 0, "result": null})))
            .unwrap();
        session.request("x", json!({}), soon()).unwrap();
        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(written.contains("\"id\":7"));
        assert!(written.contains("\"result\":null"));
    }

    // ── Push diagnostics ────────────────────────────────────────────

    #[test]
    fn push_diagnostics_are_matched_by_uri() {
        let (mut session, tx, _buf) = test_session();
        tx.send(FrameEvent::Frame(json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": "file:///other.yml",
                "diagnostics": [{"range": {"start": {"line": 0, "character": 0},
                                            "end": {"line": 0, "character": 1}},
                                  "message": "not ours"}],
            },
        })))
        .unwrap();
        tx.send(FrameEvent::Frame(json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": "file:///mine.yml",
                "diagnostics": [{"range": {"start": {"line": 2, "character": 4},
                                            "end": {"line": 2, "character": 9}},
                                  "severity": 2,
                                  "message": "duplicate key"}],
            },
        })))
        .unwrap();
        let diags = session
            .request_diagnostics("file:///mine.yml", soon())
            .unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "duplicate key");
    }

    #[test]
    fn push_wait_times_out_without_notification() {
        let (mut session, _tx, _buf) = test_session();
        let deadline = Instant::now() + Duration::from_millis(30);
        match session.request_diagnostics("file:///mine.yml", deadline) {
            Err(SessionError::DeadlineExpired) => {}
            other => panic!("expected DeadlineExpired, got {other:?}"),
        }
    }

    #[test]
    fn pull_mode_issues_a_request() {
        let (mut session, tx, buf) = test_session();
        session.pull_diagnostics = true;
        tx.send(FrameEvent::Frame(json!({
            "jsonrpc": "2.0",
            "id": 0,
            "result": {"kind": "full", "items": [
                {"range": {"start": {"line": 1, "character": 0},
                           "end": {"line": 1, "character": 5}},
                 "severity": 1,
                 "message": "element missing closing tag"},
            ]},
        })))
        .unwrap();
        let diags = session
            .request_diagnostics("file:///meta.xml", soon())
            .unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "element missing closing tag");
        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(written.contains("textDocument/diagnostic"));
    }

    #[test]
    fn open_sends_full_text_with_increasing_version() {
        let (mut session, _tx, buf) = test_session();
        session
            .open("file:///a.yml", "yaml", "key: value\n")
            .unwrap();
        session
            .open("file:///a.yml", "yaml", "key: value2\n")
            .unwrap();
        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(written.contains("textDocument/didOpen"));
        assert!(written.contains("\"version\":1"));
        assert!(written.contains("\"version\":2"));
    }
}
