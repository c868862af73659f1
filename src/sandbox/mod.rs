//! Sandbox host.
//!
//! One isolated QuickJS runtime and context per invocation, owned for that
//! invocation's lifetime by a worker thread. The host bootstraps the guest
//! standard library bridge, loads the entry file, invokes the exported
//! handler with the request mirror and response accumulator, then drives an
//! event loop (microtasks, timers, socket readiness) until the handler
//! settles or the wall-clock deadline interrupts it. Teardown is
//! unconditional: timers, sockets, and pending promises die with the guest.

pub mod bridge;
pub mod invoke;
pub mod require;
pub mod state;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::{Context, Ctx, Runtime, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::guest::REGISTRY;
use crate::store::ConsoleEntry;

use state::{BodyPayload, DeadlineState, GuestCell, GuestState, PendingCall, Settled, SocketStream};

/// Engine limits and deadlines for one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Guest heap cap in bytes
    pub memory_limit: usize,
    /// Guest stack cap in bytes
    pub max_stack: usize,
    /// Wall-clock budget for the whole invocation
    pub deadline: Duration,
    /// Budget for synchronous module loads during bootstrap
    pub load_deadline: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: crate::config::DEFAULT_MEMORY_LIMIT,
            max_stack: 1024 * 1024,
            deadline: crate::config::DEFAULT_DEADLINE,
            load_deadline: crate::config::DEFAULT_LOAD_DEADLINE,
        }
    }
}

impl SandboxConfig {
    /// Derive sandbox limits from engine configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            memory_limit: config.memory_limit_bytes,
            max_stack: 1024 * 1024,
            deadline: config.deadline,
            load_deadline: config.load_deadline,
        }
    }

    /// Override the invocation deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// The request as the guest sees it. Sensitive headers are stripped before
/// construction; the mirror crosses the bridge as a structured clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMirror {
    pub method: String,
    pub url: String,
    #[serde(rename = "originalUrl")]
    pub original_url: String,
    pub path: String,
    pub protocol: String,
    pub hostname: String,
    pub secure: bool,
    pub ip: String,
    pub ips: Vec<String>,
    pub body: serde_json::Value,
    pub query: serde_json::Map<String, serde_json::Value>,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub headers: BTreeMap<String, String>,
}

impl RequestMirror {
    /// The synthetic mirror scheduled executions run with.
    pub fn scheduled() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("x-scheduled-execution".to_string(), "true".to_string());
        Self {
            method: "POST".into(),
            url: "/scheduled".into(),
            original_url: "/scheduled".into(),
            path: "/scheduled".into(),
            protocol: "http".into(),
            hostname: "localhost".into(),
            secure: false,
            ip: "127.0.0.1".into(),
            ips: vec![],
            body: serde_json::Value::Null,
            query: serde_json::Map::new(),
            params: serde_json::Map::new(),
            headers,
        }
    }
}

/// Response body on its way back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl ResponseBody {
    /// Byte length of the serialized body.
    pub fn byte_len(&self) -> u64 {
        match self {
            ResponseBody::Empty => 0,
            ResponseBody::Json(value) => serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0) as u64,
            ResponseBody::Text(text) => text.len() as u64,
            ResponseBody::Bytes(bytes) => bytes.len() as u64,
        }
    }
}

/// What the guest produced, normalized.
#[derive(Debug, Clone)]
pub struct GuestResponse {
    pub status: u16,
    /// Lower-cased header map in insertion order
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

/// Terminal state of one sandbox run.
#[derive(Debug, Clone)]
pub enum SandboxOutcome {
    /// Handler produced a response (accumulator or return value)
    Response(GuestResponse),
    /// Handler finished without output
    NoOutput,
    /// Entry file exported nothing callable
    BadExport,
    /// Wall-clock deadline interrupted the guest
    Timeout,
    /// Guest breached its memory cap
    OutOfMemory,
    /// Uncaught guest exception; a partially written response may ride along
    GuestError {
        message: String,
        stack: Option<String>,
        partial: Option<GuestResponse>,
    },
    /// The engine itself failed
    EngineFailure(String),
}

/// Result of one invocation's sandbox run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: SandboxOutcome,
    pub console: Vec<ConsoleEntry>,
    pub elapsed: Duration,
}

/// Failure channel internal to the engine.
enum EngineError {
    Timeout,
    OutOfMemory,
    Js { message: String, stack: Option<String> },
    Internal(String),
}

const RUNTIME_JS: &str = include_str!("../guest/js/runtime.js");
const STDLIB_JS: &str = include_str!("../guest/js/stdlib.js");
const UTIL_JS: &str = include_str!("../guest/js/util.js");
const NET_JS: &str = include_str!("../guest/js/net.js");

/// How long the loop naps while watching sockets with nothing else due.
const IO_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sandbox host: executes invocations inside isolated guests.
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one invocation on a blocking worker thread.
    pub async fn execute(
        &self,
        function_id: String,
        package_root: PathBuf,
        entry_file: String,
        request: RequestMirror,
        env: Vec<(String, String)>,
    ) -> Result<ExecutionResult> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            execute_blocking(&config, &function_id, &package_root, &entry_file, request, env)
        })
        .await
        .map_err(|e| Error::Sandbox(format!("sandbox worker panicked: {}", e)))
    }
}

/// Synchronous guts of one sandbox run. Everything the guest touched is torn
/// down before this returns.
pub fn execute_blocking(
    config: &SandboxConfig,
    function_id: &str,
    package_root: &Path,
    entry_file: &str,
    request: RequestMirror,
    env: Vec<(String, String)>,
) -> ExecutionResult {
    let start = Instant::now();

    let canonical_root = match package_root.canonicalize() {
        Ok(root) => root,
        Err(e) => {
            return ExecutionResult {
                outcome: SandboxOutcome::EngineFailure(format!(
                    "package root {}: {}",
                    package_root.display(),
                    e
                )),
                console: vec![],
                elapsed: start.elapsed(),
            }
        }
    };

    let deadline = DeadlineState::new(start + config.deadline);
    let guest = GuestState::new(
        function_id.to_string(),
        canonical_root,
        env,
        deadline.clone(),
        config.load_deadline,
    );

    let engine_result = run_guest(config, &guest, &deadline, &request, entry_file);

    let elapsed = start.elapsed();
    let (console, response, settled) = {
        let st = guest.borrow();
        (st.console.clone(), st.response.clone(), st.settled.clone())
    };

    let written_response = response
        .written
        .then(|| finish_response(function_id, &response));

    let outcome = match engine_result {
        Err(EngineError::Timeout) => SandboxOutcome::Timeout,
        Err(EngineError::OutOfMemory) => SandboxOutcome::OutOfMemory,
        Err(EngineError::Js { message, stack }) => SandboxOutcome::GuestError {
            message,
            stack,
            partial: written_response,
        },
        Err(EngineError::Internal(message)) => SandboxOutcome::EngineFailure(message),
        Ok(()) => match settled {
            Some(Settled::BadExport) => SandboxOutcome::BadExport,
            Some(Settled::Threw { message, stack }) => SandboxOutcome::GuestError {
                message,
                stack,
                partial: written_response,
            },
            Some(Settled::Return(value)) => match (written_response, value) {
                (Some(response), _) => SandboxOutcome::Response(response),
                (None, Some(value)) => SandboxOutcome::Response(GuestResponse {
                    status: 200,
                    headers: vec![("content-type".into(), "application/json".into())],
                    body: ResponseBody::Json(value),
                }),
                (None, None) => SandboxOutcome::NoOutput,
            },
            // The loop drained without a settle signal (handler's promise
            // can never resolve). Whatever was written stands.
            None => match written_response {
                Some(response) => SandboxOutcome::Response(response),
                None => SandboxOutcome::NoOutput,
            },
        },
    };

    debug!(
        function_id,
        elapsed_ms = elapsed.as_millis() as u64,
        outcome = outcome_label(&outcome),
        "sandbox run finished"
    );

    ExecutionResult {
        outcome,
        console,
        elapsed,
    }
}

fn outcome_label(outcome: &SandboxOutcome) -> &'static str {
    match outcome {
        SandboxOutcome::Response(_) => "response",
        SandboxOutcome::NoOutput => "no_output",
        SandboxOutcome::BadExport => "bad_export",
        SandboxOutcome::Timeout => "timeout",
        SandboxOutcome::OutOfMemory => "out_of_memory",
        SandboxOutcome::GuestError { .. } => "guest_error",
        SandboxOutcome::EngineFailure(_) => "engine_failure",
    }
}

/// Resolve the accumulator into an outward response, reading file bodies.
fn finish_response(function_id: &str, response: &state::ResponseState) -> GuestResponse {
    let body = match &response.body {
        BodyPayload::None => ResponseBody::Empty,
        BodyPayload::Json(value) => ResponseBody::Json(value.clone()),
        BodyPayload::Text(text) => ResponseBody::Text(text.clone()),
        BodyPayload::Bytes(bytes) => ResponseBody::Bytes(bytes.clone()),
        BodyPayload::File(path) => match std::fs::read(path) {
            Ok(bytes) => ResponseBody::Bytes(bytes),
            Err(e) => {
                warn!(function_id, path = %path.display(), error = %e, "sendFile body vanished");
                ResponseBody::Empty
            }
        },
    };
    GuestResponse {
        status: response.status.unwrap_or(200),
        headers: response
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        body,
    }
}

fn run_guest(
    config: &SandboxConfig,
    guest: &GuestCell,
    deadline: &Arc<DeadlineState>,
    request: &RequestMirror,
    entry_file: &str,
) -> std::result::Result<(), EngineError> {
    let runtime =
        Runtime::new().map_err(|e| EngineError::Internal(format!("engine init: {}", e)))?;
    runtime.set_memory_limit(config.memory_limit);
    runtime.set_max_stack_size(config.max_stack);
    {
        let dl = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            if Instant::now() >= dl.effective() {
                dl.expired.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        })));
    }

    let context =
        Context::full(&runtime).map_err(|e| EngineError::Internal(format!("context: {}", e)))?;

    // Bootstrap: bridge ops, shims, entry load, handler call.
    let boot = context.with(|ctx| -> std::result::Result<(), EngineError> {
        (|| -> rquickjs::Result<()> {
            let hostops = REGISTRY.install_ops(&ctx, guest)?;
            hostops.set("invoke", invoke::build_invoke_ops(&ctx, guest, request)?)?;
            ctx.globals().set("__hostops", hostops)?;
            ctx.eval::<(), _>(RUNTIME_JS)?;
            ctx.eval::<(), _>(STDLIB_JS)?;
            ctx.eval::<(), _>(UTIL_JS)?;
            ctx.eval::<(), _>(NET_JS)?;
            ctx.eval::<(), _>("__rt.finalize();")?;

            let entry = serde_json::to_string(&format!("/{}", entry_file))
                .expect("entry path is serializable");
            ctx.eval::<(), _>(format!("__rt.runEntry({});", entry))?;
            Ok(())
        })()
        .map_err(|e| classify_js_error(&ctx, e, deadline))
    });

    let result = match boot {
        Ok(()) => run_event_loop(&runtime, &context, guest, deadline),
        Err(e) => Err(e),
    };

    // Drop every saved guest reference while the runtime is still alive;
    // persistent callbacks must not outlive the engine that owns them.
    context.with(|_ctx| {
        let mut st = guest.borrow_mut();
        st.timers.armed.clear();
        st.timers.cleared.clear();
        st.immediates.clear();
        st.sockets.clear();
        st.websockets.clear();
        st.fds.files.clear();
    });
    runtime.set_interrupt_handler(None);

    result
}

fn run_event_loop(
    runtime: &Runtime,
    context: &Context,
    guest: &GuestCell,
    deadline: &Arc<DeadlineState>,
) -> std::result::Result<(), EngineError> {
    loop {
        // Drain the microtask queue.
        loop {
            if deadline_hit(deadline) {
                return Err(EngineError::Timeout);
            }
            match runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_job_failed) => {
                    if deadline.expired.load(Ordering::SeqCst) {
                        return Err(EngineError::Timeout);
                    }
                    // An unhandled rejection or a throwing then-callback. If
                    // the handler has not settled, this is its failure.
                    record_uncaught(context, guest, "unhandled promise rejection");
                }
            }
        }

        if guest.borrow().settled.is_some() {
            return Ok(());
        }
        if deadline_hit(deadline) {
            return Err(EngineError::Timeout);
        }

        // Immediates queued by bridged callbacks.
        let next_immediate = guest.borrow_mut().immediates.pop_front();
        if let Some(call) = next_immediate {
            invoke_pending(context, guest, deadline, call)?;
            continue;
        }

        // Due timers, rearming intervals.
        let now = Instant::now();
        let due = guest.borrow_mut().timers.pop_due(now);
        if let Some(timer) = due {
            if guest.borrow().timers.cleared.contains(&timer.id) {
                continue;
            }
            if let Some(period) = timer.repeat {
                let mut st = guest.borrow_mut();
                st.timers.armed.push(state::TimerEntry {
                    id: timer.id,
                    due: now + period,
                    repeat: Some(period),
                    callback: timer.callback.clone(),
                    args: timer.args.clone(),
                });
            }
            invoke_pending(
                context,
                guest,
                deadline,
                PendingCall {
                    callback: timer.callback,
                    args: timer.args,
                },
            )?;
            continue;
        }

        // Socket and websocket readiness.
        if pump_io(guest) {
            continue;
        }

        // Idle: figure out whether anything can still wake the guest.
        let (next_due, has_io) = {
            let st = guest.borrow();
            let has_io = st.sockets.values().any(|s| s.open)
                || st.websockets.values().any(|s| s.open);
            (st.timers.next_due(), has_io)
        };
        if next_due.is_none() && !has_io {
            // Nothing can ever settle this invocation; collection decides
            // what the silence means.
            return Ok(());
        }

        let wall = deadline.effective();
        let mut wake = next_due.unwrap_or(wall).min(wall);
        if has_io {
            wake = wake.min(Instant::now() + IO_POLL_INTERVAL);
        }
        let nap = wake.saturating_duration_since(Instant::now());
        if !nap.is_zero() {
            std::thread::sleep(nap.min(Duration::from_millis(50)));
        }
    }
}

fn deadline_hit(deadline: &Arc<DeadlineState>) -> bool {
    deadline.expired.load(Ordering::SeqCst) || Instant::now() >= deadline.effective()
}

fn invoke_pending(
    context: &Context,
    guest: &GuestCell,
    deadline: &Arc<DeadlineState>,
    call: PendingCall,
) -> std::result::Result<(), EngineError> {
    let result = context.with(|ctx| {
        bridge::invoke_callback(&ctx, call.callback, &call.args)
            .map_err(|e| classify_js_error(&ctx, e, deadline))
    });
    match result {
        Ok(()) => Ok(()),
        Err(EngineError::Js { message, stack }) => {
            // An uncaught exception in a timer or I/O callback fails the
            // invocation unless it already settled.
            let mut st = guest.borrow_mut();
            if st.settled.is_none() {
                st.settled = Some(Settled::Threw { message, stack });
            }
            Ok(())
        }
        Err(other) => Err(other),
    }
}

fn record_uncaught(context: &Context, guest: &GuestCell, fallback: &str) {
    let (message, stack) = context.with(|ctx| exception_text(&ctx, ctx.catch()));
    let mut st = guest.borrow_mut();
    if st.settled.is_none() {
        let message = if message.is_empty() {
            fallback.to_string()
        } else {
            message
        };
        st.settled = Some(Settled::Threw { message, stack });
    }
}

fn classify_js_error(ctx: &Ctx<'_>, e: rquickjs::Error, deadline: &Arc<DeadlineState>) -> EngineError {
    if deadline.expired.load(Ordering::SeqCst) {
        return EngineError::Timeout;
    }
    match e {
        rquickjs::Error::Exception => {
            let (message, stack) = exception_text(ctx, ctx.catch());
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("out of memory") {
                EngineError::OutOfMemory
            } else if lowered.contains("interrupted") {
                EngineError::Timeout
            } else {
                EngineError::Js { message, stack }
            }
        }
        other => {
            let text = other.to_string();
            if text.to_ascii_lowercase().contains("memory") {
                EngineError::OutOfMemory
            } else {
                EngineError::Internal(text)
            }
        }
    }
}

fn exception_text<'js>(ctx: &Ctx<'js>, caught: Value<'js>) -> (String, Option<String>) {
    if let Some(object) = caught.as_object() {
        let name: String = object
            .get::<_, Option<String>>("name")
            .ok()
            .flatten()
            .unwrap_or_else(|| "Error".into());
        let message: String = object
            .get::<_, Option<String>>("message")
            .ok()
            .flatten()
            .unwrap_or_default();
        let stack: Option<String> = object.get::<_, Option<String>>("stack").ok().flatten();
        let text = if message.is_empty() {
            name
        } else {
            format!("{}: {}", name, message)
        };
        return (text, stack);
    }
    if let Some(s) = caught.as_string() {
        return (s.to_string().unwrap_or_default(), None);
    }
    let _ = ctx;
    (String::new(), None)
}

/// Poll bridged sockets for readiness, queueing callback deliveries.
/// Returns true when any event was queued.
fn pump_io(guest: &GuestCell) -> bool {
    use std::io::Read;

    let mut progressed = false;

    let socket_ids: Vec<u64> = guest.borrow().sockets.keys().copied().collect();
    for id in socket_ids {
        enum Happened {
            Data(Vec<u8>),
            Eof,
            Failed(String),
        }
        let happened = {
            let mut st = guest.borrow_mut();
            let Some(socket) = st.sockets.get_mut(&id) else { continue };
            if !socket.open || (socket.on_data.is_none() && socket.on_end.is_none()) {
                continue;
            }
            let mut buffer = [0u8; 16 * 1024];
            let read = match &mut socket.stream {
                SocketStream::Tcp(tcp) => tcp.read(&mut buffer),
                SocketStream::Tls(tls) => tls.read(&mut buffer),
            };
            match read {
                Ok(0) => {
                    socket.open = false;
                    Some(Happened::Eof)
                }
                Ok(n) => Some(Happened::Data(buffer[..n].to_vec())),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                Err(e) => {
                    socket.open = false;
                    Some(Happened::Failed(e.to_string()))
                }
            }
        };

        let Some(happened) = happened else { continue };
        let mut st = guest.borrow_mut();
        let Some(socket) = st.sockets.get(&id) else { continue };
        let call = match &happened {
            Happened::Data(bytes) => socket.on_data.clone().map(|cb| PendingCall {
                callback: cb,
                args: vec![state::BridgeArg::Bytes(bytes.clone())],
            }),
            Happened::Eof => socket.on_end.clone().map(|cb| PendingCall {
                callback: cb,
                args: vec![],
            }),
            Happened::Failed(message) => socket.on_error.clone().map(|cb| PendingCall {
                callback: cb,
                args: vec![state::BridgeArg::str(message.clone())],
            }),
        };
        if let Some(call) = call {
            st.immediates.push_back(call);
            progressed = true;
        }
    }

    let ws_ids: Vec<u64> = guest.borrow().websockets.keys().copied().collect();
    for id in ws_ids {
        enum WsHappened {
            Message(Vec<u8>, bool),
            Closed(u16, String),
            Failed(String),
        }
        let happened = {
            let mut st = guest.borrow_mut();
            let Some(ws) = st.websockets.get_mut(&id) else { continue };
            if !ws.open {
                continue;
            }
            match ws.socket.read() {
                Ok(tungstenite::Message::Text(text)) => {
                    Some(WsHappened::Message(text.into_bytes(), false))
                }
                Ok(tungstenite::Message::Binary(bytes)) => Some(WsHappened::Message(bytes, true)),
                Ok(tungstenite::Message::Ping(_)) | Ok(tungstenite::Message::Pong(_)) => {
                    // tungstenite queues the pong; push it out.
                    ws.socket.flush().ok();
                    None
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    ws.open = false;
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    Some(WsHappened::Closed(code, reason))
                }
                Ok(tungstenite::Message::Frame(_)) => None,
                Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    None
                }
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {
                    ws.open = false;
                    Some(WsHappened::Closed(1006, String::new()))
                }
                Err(e) => {
                    ws.open = false;
                    Some(WsHappened::Failed(e.to_string()))
                }
            }
        };

        let Some(happened) = happened else { continue };
        let mut st = guest.borrow_mut();
        let Some(ws) = st.websockets.get(&id) else { continue };
        let call = match &happened {
            WsHappened::Message(bytes, binary) => ws.on_message.clone().map(|cb| PendingCall {
                callback: cb,
                args: vec![
                    state::BridgeArg::Bytes(bytes.clone()),
                    state::BridgeArg::Json(serde_json::Value::Bool(*binary)),
                ],
            }),
            WsHappened::Closed(code, reason) => ws.on_close.clone().map(|cb| PendingCall {
                callback: cb,
                args: vec![
                    state::BridgeArg::Json(serde_json::json!(code)),
                    state::BridgeArg::str(reason.clone()),
                ],
            }),
            WsHappened::Failed(message) => ws.on_error.clone().map(|cb| PendingCall {
                callback: cb,
                args: vec![state::BridgeArg::str(message.clone())],
            }),
        };
        if let Some(call) = call {
            st.immediates.push_back(call);
            progressed = true;
        }
    }

    progressed
}
