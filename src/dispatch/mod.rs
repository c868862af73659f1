//! Invocation dispatcher.
//!
//! The pipeline every invocation walks: resolve the function, authenticate,
//! ensure the package is cached, build the request mirror, run the sandbox,
//! shape the outer HTTP response, and append the execution log. Scheduled
//! runs share the pipeline with a synthesized mirror and a `SCHEDULED` log
//! method.

pub mod auth;
pub mod schedule;
pub mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::PackageCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::sandbox::{
    ExecutionResult, GuestResponse, RequestMirror, ResponseBody, Sandbox, SandboxConfig,
    SandboxOutcome,
};
use crate::store::{
    fetch_active_with_retry, ConsoleEntry, ExecutionLogRecord, FunctionDescriptor, MetadataStore,
};

pub use scheduler::Scheduler;

/// Headers never forwarded into the guest.
const SENSITIVE_REQUEST_HEADERS: &[&str] = &["authorization", "x-api-key", "cookie"];

/// Hop-by-hop headers never copied onto the outer response.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Bounded retries for transient metadata reads.
const STORE_READ_RETRIES: u32 = 3;

/// One inbound invocation, transport-neutral.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub function_id: String,
    pub method: String,
    /// Path after the function id segment; `/` when absent
    pub subpath: String,
    /// Raw query string without the leading `?`
    pub query_string: String,
    /// Header pairs as received (any case); sanitized before the guest
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub client_ip: String,
    pub user_agent: Option<String>,
}

/// The outer HTTP reply, transport-neutral.
#[derive(Debug, Clone)]
pub struct OuterResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl OuterResponse {
    fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: serde_json::to_vec(&value).unwrap_or_default(),
        }
    }
}

/// The dispatcher. One per engine; shared behind an `Arc`.
pub struct Dispatcher {
    store: Arc<dyn MetadataStore>,
    cache: Arc<PackageCache>,
    sandbox: Sandbox,
    metrics: Arc<Metrics>,
    concurrency: Arc<Semaphore>,
    log_body_cap: usize,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        cache: Arc<PackageCache>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            sandbox: Sandbox::new(SandboxConfig::from_config(config)),
            metrics,
            concurrency: Arc::new(Semaphore::new(config.max_concurrent)),
            log_body_cap: config.log_body_cap,
        })
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<PackageCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run one HTTP invocation end to end. Always produces an HTTP-shaped
    /// answer; errors are encoded, not propagated.
    pub async fn invoke(self: &Arc<Self>, request: InvokeRequest) -> OuterResponse {
        let started_at = Utc::now();
        let function_id = request.function_id.clone();
        self.metrics.record_invocation(&function_id);

        // 1. Resolve.
        let descriptor = match fetch_active_with_retry(&self.store, &function_id, STORE_READ_RETRIES).await
        {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(function_id, error = %e, "invocation failed before dispatch");
                let response = error_response(&e, None, 0);
                self.append_log(&request, started_at, 0, &response, &[], Some(e.to_string()))
                    .await;
                return response;
            }
        };

        // 2. Authenticate.
        if let Err(e) = auth::authenticate(&descriptor, &request.headers, &request.query_string) {
            let response = error_response(&e, None, 0);
            self.append_log(&request, started_at, 0, &response, &[], Some(e.to_string()))
                .await;
            return response;
        }

        // 3-7. The rest shares the scheduled path.
        let mirror = build_mirror(&request);
        let (response, console, elapsed_ms, error) =
            self.run_resolved(&descriptor, mirror).await;
        self.append_log(&request, started_at, elapsed_ms, &response, &console, error)
            .await;
        response
    }

    /// Run one scheduled invocation; the log records method `SCHEDULED`.
    pub async fn invoke_scheduled(self: &Arc<Self>, descriptor: &FunctionDescriptor) -> OuterResponse {
        let started_at = Utc::now();
        self.metrics.record_invocation(&descriptor.function_id);
        let mirror = RequestMirror::scheduled();
        let (response, console, elapsed_ms, error) = self.run_resolved(descriptor, mirror).await;

        let synthetic = InvokeRequest {
            function_id: descriptor.function_id.clone(),
            method: "SCHEDULED".into(),
            subpath: "/scheduled".into(),
            query_string: String::new(),
            headers: vec![("x-scheduled-execution".into(), "true".into())],
            body: vec![],
            client_ip: "127.0.0.1".into(),
            user_agent: None,
        };
        self.append_log(&synthetic, started_at, elapsed_ms, &response, &console, error)
            .await;
        response
    }

    /// Ensure the package, execute the sandbox, shape the response.
    async fn run_resolved(
        self: &Arc<Self>,
        descriptor: &FunctionDescriptor,
        mirror: RequestMirror,
    ) -> (OuterResponse, Vec<ConsoleEntry>, u64, Option<String>) {
        // 3. Ensure the package, with one forced-eviction retry on CacheFull.
        let ensured = match self.cache.ensure(descriptor).await {
            Err(Error::CacheFull(_)) => {
                warn!(
                    function_id = %descriptor.function_id,
                    "cache full; forcing an eviction pass and retrying once"
                );
                self.cache.evict_to_watermark().await;
                self.cache.ensure(descriptor).await
            }
            other => other,
        };
        let (handle, hit) = match ensured {
            Ok(pair) => pair,
            Err(e) => {
                let response = error_response(&e, None, 0);
                return (response, vec![], 0, Some(e.to_string()));
            }
        };
        self.metrics
            .record_cache_lookup(&descriptor.function_id, hit);

        // 5. Invoke under the concurrency gate.
        let _permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("invocation semaphore never closes");
        let _guest = self.metrics.guest_started();

        let execution = self
            .sandbox
            .execute(
                descriptor.function_id.clone(),
                handle.root_path().to_path_buf(),
                crate::cache::ENTRY_FILE.to_string(),
                mirror,
                descriptor.env.clone(),
            )
            .await;
        drop(handle);

        let execution = match execution {
            Ok(execution) => execution,
            Err(e) => {
                let response = error_response(&e, None, 0);
                return (response, vec![], 0, Some(e.to_string()));
            }
        };

        // 6. Shape.
        let elapsed_ms = execution.elapsed.as_millis() as u64;
        let (response, error) = shape_response(&execution);
        self.metrics.record_result(
            &descriptor.function_id,
            elapsed_ms,
            error.is_some(),
            matches!(execution.outcome, SandboxOutcome::Timeout),
        );
        (response, execution.console, elapsed_ms, error)
    }

    /// 7. Append the execution log. Never fails the invocation.
    async fn append_log(
        &self,
        request: &InvokeRequest,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        response: &OuterResponse,
        console: &[ConsoleEntry],
        error: Option<String>,
    ) {
        let request_size = request.body.len() as u64;
        let response_size = response.body.len() as u64;
        let record = ExecutionLogRecord {
            function_id: request.function_id.clone(),
            status_code: response.status,
            duration_ms,
            request_method: request.method.clone(),
            request_url: full_url(request),
            request_body: capped_text(&request.body, self.log_body_cap),
            request_size,
            response_body: capped_text(&response.body, self.log_body_cap),
            response_size,
            request_headers: sanitized_headers(&request.headers),
            response_headers: response.headers.clone(),
            console: console.to_vec(),
            client_ip: request.client_ip.clone(),
            user_agent: request.user_agent.clone(),
            executed_at: started_at,
            error,
        };
        self.store.append_execution_log(record).await;
    }
}

/// Request url including the query string.
fn full_url(request: &InvokeRequest) -> String {
    if request.query_string.is_empty() {
        request.subpath.clone()
    } else {
        format!("{}?{}", request.subpath, request.query_string)
    }
}

/// Lower-cased headers with sensitive entries removed.
fn sanitized_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lowered = name.to_ascii_lowercase();
            !SENSITIVE_REQUEST_HEADERS.contains(&lowered.as_str())
        })
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}

/// UTF-8 view of a body, truncated at `cap` bytes with a marker.
fn capped_text(body: &[u8], cap: usize) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let mut text = String::from_utf8_lossy(body).into_owned();
    if text.len() > cap {
        let mut cut = cap;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("…[truncated]");
    }
    Some(text)
}

/// Build the guest's request mirror from the outer request.
pub fn build_mirror(request: &InvokeRequest) -> RequestMirror {
    let mut headers = BTreeMap::new();
    let mut hostname = "localhost".to_string();
    let mut forwarded: Vec<String> = vec![];
    for (name, value) in &request.headers {
        let lowered = name.to_ascii_lowercase();
        if SENSITIVE_REQUEST_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        if lowered == "host" {
            hostname = value.split(':').next().unwrap_or(value).to_string();
        }
        if lowered == "x-forwarded-for" {
            forwarded = value.split(',').map(|s| s.trim().to_string()).collect();
        }
        headers.insert(lowered, value.clone());
    }

    let mut query = serde_json::Map::new();
    if !request.query_string.is_empty() {
        for pair in request.query_string.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = urlencoding::decode(name)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| name.to_string());
            let value = urlencoding::decode(&value.replace('+', " "))
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            query.insert(name, serde_json::Value::String(value));
        }
    }

    let content_type = headers
        .get("content-type")
        .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();
    let body = if request.body.is_empty() {
        serde_json::Value::Null
    } else if content_type == "application/json" {
        serde_json::from_slice(&request.body)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&request.body).into_owned()))
    } else {
        serde_json::Value::String(String::from_utf8_lossy(&request.body).into_owned())
    };

    let url = full_url(request);
    RequestMirror {
        method: request.method.to_ascii_uppercase(),
        url: url.clone(),
        original_url: url,
        path: request.subpath.clone(),
        protocol: "http".into(),
        hostname,
        secure: false,
        ip: request.client_ip.clone(),
        ips: forwarded,
        body,
        query,
        params: serde_json::Map::new(),
        headers,
    }
}

/// Shape the sandbox's result into the outer response. Returns the response
/// and the error string destined for the log row, if any.
fn shape_response(execution: &ExecutionResult) -> (OuterResponse, Option<String>) {
    let elapsed_ms = execution.elapsed.as_millis() as u64;
    match &execution.outcome {
        SandboxOutcome::Response(response) => (success_response(response), None),
        SandboxOutcome::Timeout => {
            let error = Error::Timeout { elapsed_ms };
            (
                error_response(&error, Some(&execution.console), elapsed_ms),
                Some(error.to_string()),
            )
        }
        SandboxOutcome::OutOfMemory => {
            let error = Error::OutOfMemory;
            (
                error_response(&error, Some(&execution.console), elapsed_ms),
                Some(error.to_string()),
            )
        }
        SandboxOutcome::BadExport => {
            let error = Error::BadExport;
            (
                error_response(&error, Some(&execution.console), elapsed_ms),
                Some(error.to_string()),
            )
        }
        SandboxOutcome::NoOutput => {
            let error = Error::NoOutput;
            (
                error_response(&error, Some(&execution.console), elapsed_ms),
                Some(error.to_string()),
            )
        }
        SandboxOutcome::GuestError {
            message,
            stack,
            partial,
        } => {
            // The status rides on whatever the accumulator managed to write;
            // the body is always the structured error payload.
            let status = partial.as_ref().map(|r| r.status).unwrap_or(500);
            let mut payload = error_payload(message, elapsed_ms, Some(&execution.console));
            if let Some(stack) = stack {
                payload["stack"] = serde_json::Value::String(stack.clone());
            }
            (
                OuterResponse::json(status, payload),
                Some(format!("Function threw: {}", message)),
            )
        }
        SandboxOutcome::EngineFailure(message) => {
            let error = Error::Sandbox(message.clone());
            (
                error_response(&error, Some(&execution.console), elapsed_ms),
                Some(error.to_string()),
            )
        }
    }
}

fn success_response(response: &GuestResponse) -> OuterResponse {
    let headers: Vec<(String, String)> = response
        .headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.as_str()))
        .cloned()
        .collect();
    let body = match &response.body {
        ResponseBody::Empty => vec![],
        ResponseBody::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
        ResponseBody::Text(text) => text.clone().into_bytes(),
        ResponseBody::Bytes(bytes) => bytes.clone(),
    };
    OuterResponse {
        status: response.status,
        headers,
        body,
    }
}

fn error_payload(
    message: &str,
    elapsed_ms: u64,
    console: Option<&[ConsoleEntry]>,
) -> serde_json::Value {
    serde_json::json!({
        "success": false,
        "data": serde_json::Value::Null,
        "message": message,
        "executionTime": elapsed_ms,
        "console": console
            .map(|entries| serde_json::to_value(entries).unwrap_or_default())
            .unwrap_or(serde_json::Value::Array(vec![])),
    })
}

/// Encode an [`Error`] as the outer HTTP reply.
pub fn error_response(
    error: &Error,
    console: Option<&[ConsoleEntry]>,
    elapsed_ms: u64,
) -> OuterResponse {
    let status = error.status_code();
    let message = match error {
        Error::FunctionNotFound(_) => "Function not found".to_string(),
        other => other.to_string(),
    };
    OuterResponse::json(status, error_payload(&message, elapsed_ms, console))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_request(function_id: &str) -> InvokeRequest {
        InvokeRequest {
            function_id: function_id.into(),
            method: "GET".into(),
            subpath: "/".into(),
            query_string: String::new(),
            headers: vec![],
            body: vec![],
            client_ip: "10.0.0.9".into(),
            user_agent: Some("test-agent".into()),
        }
    }

    #[test]
    fn test_mirror_strips_sensitive_headers() {
        let mut request = plain_request("fn-a");
        request.headers = vec![
            ("Authorization".into(), "Bearer secret".into()),
            ("X-Api-Key".into(), "secret".into()),
            ("Cookie".into(), "sid=1".into()),
            ("X-Custom".into(), "kept".into()),
            ("Host".into(), "api.example.com:8443".into()),
        ];
        let mirror = build_mirror(&request);
        assert!(!mirror.headers.contains_key("authorization"));
        assert!(!mirror.headers.contains_key("x-api-key"));
        assert!(!mirror.headers.contains_key("cookie"));
        assert_eq!(mirror.headers.get("x-custom").map(String::as_str), Some("kept"));
        assert_eq!(mirror.hostname, "api.example.com");
    }

    #[test]
    fn test_mirror_parses_query_and_json_body() {
        let mut request = plain_request("fn-a");
        request.method = "post".into();
        request.subpath = "/things".into();
        request.query_string = "x=hi&y=a%20b".into();
        request.headers = vec![("Content-Type".into(), "application/json".into())];
        request.body = br#"{"n": 7}"#.to_vec();

        let mirror = build_mirror(&request);
        assert_eq!(mirror.method, "POST");
        assert_eq!(mirror.url, "/things?x=hi&y=a%20b");
        assert_eq!(mirror.query.get("x"), Some(&serde_json::json!("hi")));
        assert_eq!(mirror.query.get("y"), Some(&serde_json::json!("a b")));
        assert_eq!(mirror.body, serde_json::json!({"n": 7}));
    }

    #[test]
    fn test_success_response_strips_hop_by_hop() {
        let guest = GuestResponse {
            status: 200,
            headers: vec![
                ("content-type".into(), "text/plain; charset=utf-8".into()),
                ("connection".into(), "keep-alive".into()),
                ("transfer-encoding".into(), "chunked".into()),
                ("x-kept".into(), "yes".into()),
            ],
            body: ResponseBody::Text("ok".into()),
        };
        let outer = success_response(&guest);
        let names: Vec<&str> = outer.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"content-type"));
        assert!(names.contains(&"x-kept"));
        assert!(!names.contains(&"connection"));
        assert!(!names.contains(&"transfer-encoding"));
        assert_eq!(outer.body, b"ok");
    }

    #[test]
    fn test_error_response_shapes() {
        let not_found = error_response(&Error::FunctionNotFound("x".into()), None, 0);
        assert_eq!(not_found.status, 404);
        let payload: serde_json::Value = serde_json::from_slice(&not_found.body).unwrap();
        assert_eq!(payload["message"], "Function not found");
        assert_eq!(payload["success"], false);

        let timeout = error_response(&Error::Timeout { elapsed_ms: 30_500 }, None, 30_500);
        assert_eq!(timeout.status, 504);
        let payload: serde_json::Value = serde_json::from_slice(&timeout.body).unwrap();
        assert_eq!(payload["executionTime"], 30_500);
    }

    #[test]
    fn test_capped_text_truncates_on_char_boundary() {
        let body = "héllo wörld".repeat(100).into_bytes();
        let capped = capped_text(&body, 13).unwrap();
        assert!(capped.ends_with("…[truncated]"));
        assert!(capped.len() < body.len());
        assert!(capped_text(&[], 10).is_none());
    }
}
