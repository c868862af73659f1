//! End-to-end engine tests.
//!
//! Each scenario drives the full invocation pipeline: a manifest-backed
//! metadata store, a local blob tree, the package cache, the sandbox, and
//! the dispatcher's response shaping and execution logging.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;

use runlet::blob::{sha256_hex, DirBlobFetcher};
use runlet::cache::{CacheConfig, PackageCache};
use runlet::config::Config;
use runlet::dispatch::{scheduler, Dispatcher, InvokeRequest, OuterResponse};
use runlet::metrics::Metrics;
use runlet::store::{FunctionDescriptor, MemoryStore, MetadataStore};

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    dispatcher: Arc<Dispatcher>,
    store: Arc<MemoryStore>,
    _blobs: tempfile::TempDir,
    _cache_root: tempfile::TempDir,
    blob_dir: std::path::PathBuf,
}

impl Harness {
    fn new(config_tweak: impl FnOnce(Config) -> Config) -> Self {
        let blobs = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let config = config_tweak(
            Config::default()
                .with_cache_root(cache_root.path())
                .with_max_concurrent(8),
        );

        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(DirBlobFetcher::new(
            blobs.path(),
            cache_root.path().join(".spool"),
        ));
        let cache = PackageCache::new(
            CacheConfig {
                root: cache_root.path().to_path_buf(),
                max_bytes: config.cache_max_bytes,
            },
            fetcher,
        )
        .unwrap();
        let dispatcher = Dispatcher::new(
            &config,
            store.clone() as Arc<dyn MetadataStore>,
            cache,
            Metrics::new(),
        );
        let blob_dir = blobs.path().to_path_buf();
        Self {
            dispatcher,
            store,
            _blobs: blobs,
            _cache_root: cache_root,
            blob_dir,
        }
    }

    /// Package `files` into a tar.gz under the blob tree and register the
    /// function in the store.
    fn install_function(&self, function_id: &str, files: &[(&str, &str)]) -> FunctionDescriptor {
        let archive_name = format!("{}.tar.gz", function_id);
        let (hash, size) = write_package(&self.blob_dir.join(&archive_name), files);
        let descriptor = FunctionDescriptor {
            function_id: function_id.to_string(),
            name: function_id.to_string(),
            is_active: true,
            requires_api_key: false,
            api_key: None,
            version: 1,
            package_path: archive_name,
            package_hash: hash,
            file_size: size,
            env: vec![],
            cron_expression: None,
            next_execution: None,
        };
        self.store.upsert(descriptor.clone());
        descriptor
    }

    async fn get(&self, function_id: &str, query: &str) -> OuterResponse {
        self.dispatcher
            .invoke(InvokeRequest {
                function_id: function_id.to_string(),
                method: "GET".into(),
                subpath: "/".into(),
                query_string: query.to_string(),
                headers: vec![],
                body: vec![],
                client_ip: "203.0.113.5".into(),
                user_agent: Some("engine-tests".into()),
            })
            .await
    }

    async fn invoke_with(
        &self,
        function_id: &str,
        headers: Vec<(String, String)>,
        query: &str,
    ) -> OuterResponse {
        self.dispatcher
            .invoke(InvokeRequest {
                function_id: function_id.to_string(),
                method: "GET".into(),
                subpath: "/".into(),
                query_string: query.to_string(),
                headers,
                body: vec![],
                client_ip: "203.0.113.5".into(),
                user_agent: None,
            })
            .await
    }
}

fn write_package(archive_path: &Path, files: &[(&str, &str)]) -> (String, u64) {
    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let file = std::fs::File::create(archive_path).unwrap();
    let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (name, contents) in files {
        let data = contents.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, *name, data).unwrap();
    }
    builder
        .into_inner()
        .unwrap()
        .finish()
        .unwrap()
        .flush()
        .unwrap();
    let bytes = std::fs::read(archive_path).unwrap();
    (sha256_hex(&bytes), bytes.len() as u64)
}

fn json_body(response: &OuterResponse) -> serde_json::Value {
    serde_json::from_slice(&response.body).unwrap_or(serde_json::Value::Null)
}

fn header<'a>(response: &'a OuterResponse, name: &str) -> Option<&'a str> {
    response
        .headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

// ============================================================================
// Scenario 1: happy path
// ============================================================================

#[tokio::test]
async fn test_happy_path_echo() {
    let harness = Harness::new(|c| c);
    harness.install_function(
        "echo",
        &[(
            "index.js",
            "module.exports = (req, res) => res.status(201).json({ echo: req.query.x });",
        )],
    );

    let response = harness.get("echo", "x=hi").await;
    assert_eq!(response.status, 201);
    assert_eq!(json_body(&response), serde_json::json!({"echo": "hi"}));
    assert_eq!(header(&response, "content-type"), Some("application/json"));
}

#[tokio::test]
async fn test_unknown_function_is_404() {
    let harness = Harness::new(|c| c);
    let response = harness.get("ghost", "").await;
    assert_eq!(response.status, 404);
    assert_eq!(json_body(&response)["message"], "Function not found");
}

// ============================================================================
// Scenario 2: deadline authority
// ============================================================================

#[tokio::test]
async fn test_deadline_miss_times_out_with_504() {
    let harness = Harness::new(|c| c.with_deadline(Duration::from_millis(400)));
    harness.install_function(
        "sleeper",
        &[(
            "index.js",
            r#"
            module.exports = async () => {
                await new Promise((resolve) => setTimeout(resolve, 60000));
            };
            "#,
        )],
    );

    let started = std::time::Instant::now();
    let response = harness.get("sleeper", "").await;
    assert_eq!(response.status, 504);
    // Torn down promptly after the deadline, well before the 60s timer.
    assert!(started.elapsed() < Duration::from_secs(5));

    let logs = harness.store.recent_logs("sleeper", 1).await.unwrap();
    assert_eq!(logs[0].status_code, 504);
    assert!(logs[0].duration_ms >= 400);
}

// ============================================================================
// Scenario 3: cache miss then hit
// ============================================================================

#[tokio::test]
async fn test_cache_miss_then_hit_counters() {
    let harness = Harness::new(|c| c);
    harness.install_function(
        "cached",
        &[("index.js", "module.exports = (req, res) => res.json({ ok: 1 });")],
    );

    assert_eq!(harness.get("cached", "").await.status, 200);
    assert_eq!(harness.get("cached", "").await.status, 200);

    let stats = harness.dispatcher.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);

    let snapshot = harness.dispatcher.metrics().snapshot();
    let counters = snapshot
        .functions
        .iter()
        .find(|f| f.function_id == "cached")
        .unwrap();
    assert_eq!(counters.cache_misses, 1);
    assert_eq!(counters.cache_hits, 1);
    assert_eq!(counters.invocations, 2);
}

// ============================================================================
// Scenario 4: bad hash
// ============================================================================

#[tokio::test]
async fn test_bad_hash_is_bad_package_and_stays_failed() {
    let harness = Harness::new(|c| c);
    let mut descriptor = harness.install_function(
        "tampered",
        &[("index.js", "module.exports = (req, res) => res.json({ ok: 1 });")],
    );
    descriptor.package_hash = "00".repeat(32);
    descriptor.file_size = 0;
    harness.store.upsert(descriptor);

    let first = harness.get("tampered", "").await;
    assert_eq!(first.status, 500);
    assert!(json_body(&first)["message"]
        .as_str()
        .unwrap()
        .contains("Bad package"));
    assert_eq!(harness.dispatcher.cache().stats().ready_count, 0);

    // Same fingerprint fails again without becoming Ready.
    let second = harness.get("tampered", "").await;
    assert_eq!(second.status, 500);
    assert_eq!(harness.dispatcher.cache().stats().ready_count, 0);
}

// ============================================================================
// Scenario 5: path escape
// ============================================================================

#[tokio::test]
async fn test_fs_escape_returns_eacces_to_handler() {
    let harness = Harness::new(|c| c);
    harness.install_function(
        "escape",
        &[(
            "index.js",
            r#"
            const fs = require('fs');
            module.exports = (req, res) => {
                try {
                    fs.readFileSync('../../../etc/passwd');
                    res.status(200).json({ leaked: true });
                } catch (e) {
                    res.status(500).json({ error: e.code });
                }
            };
            "#,
        )],
    );

    let response = harness.get("escape", "").await;
    assert_eq!(response.status, 500);
    assert_eq!(json_body(&response), serde_json::json!({"error": "EACCES"}));
}

// ============================================================================
// Scenario 6: auth matrix
// ============================================================================

#[tokio::test]
async fn test_auth_matrix() {
    let harness = Harness::new(|c| c);
    let mut descriptor = harness.install_function(
        "locked",
        &[("index.js", "module.exports = (req, res) => res.json({ ok: 1 });")],
    );
    descriptor.requires_api_key = true;
    descriptor.api_key = Some("K".into());
    harness.store.upsert(descriptor);

    let h = |name: &str, value: &str| vec![(name.to_string(), value.to_string())];

    // Correct key in each of the three locations dispatches.
    assert_eq!(
        harness.invoke_with("locked", h("Authorization", "Bearer K"), "").await.status,
        200
    );
    assert_eq!(harness.invoke_with("locked", vec![], "api_key=K").await.status, 200);
    assert_eq!(harness.invoke_with("locked", vec![], "apiKey=K").await.status, 200);
    assert_eq!(
        harness.invoke_with("locked", h("X-Api-Key", "K"), "").await.status,
        200
    );

    // Missing or wrong keys never reach the function.
    assert_eq!(harness.invoke_with("locked", vec![], "").await.status, 401);
    assert_eq!(
        harness.invoke_with("locked", h("Authorization", "Bearer WRONG"), "").await.status,
        401
    );
    assert_eq!(
        harness.invoke_with("locked", h("X-Api-Key", "WRONG"), "").await.status,
        401
    );
}

// ============================================================================
// Header hygiene
// ============================================================================

#[tokio::test]
async fn test_sensitive_headers_never_reach_guest() {
    let harness = Harness::new(|c| c);
    harness.install_function(
        "headers",
        &[(
            "index.js",
            r#"
            module.exports = (req, res) => res.json({
                auth: req.headers['authorization'] === undefined,
                apiKey: req.headers['x-api-key'] === undefined,
                cookie: req.headers['cookie'] === undefined,
                custom: req.headers['x-custom'],
            });
            "#,
        )],
    );

    let headers = vec![
        ("Authorization".to_string(), "Bearer sneak".to_string()),
        ("X-Api-Key".to_string(), "sneak".to_string()),
        ("Cookie".to_string(), "sid=1".to_string()),
        ("X-Custom".to_string(), "visible".to_string()),
    ];
    let response = harness.invoke_with("headers", headers, "").await;
    assert_eq!(
        json_body(&response),
        serde_json::json!({"auth": true, "apiKey": true, "cookie": true, "custom": "visible"})
    );
}

// ============================================================================
// Export recognition
// ============================================================================

#[tokio::test]
async fn test_export_recognition_shapes() {
    let harness = Harness::new(|c| c);
    for (id, source) in [
        ("direct", "module.exports = (req, res) => res.json({ ok: 1 });"),
        ("handler-prop", "exports.handler = (req, res) => res.json({ ok: 1 });"),
        ("default-prop", "exports.default = (req, res) => res.json({ ok: 1 });"),
    ] {
        harness.install_function(id, &[("index.js", source)]);
        let response = harness.get(id, "").await;
        assert_eq!(response.status, 200, "export shape '{}'", id);
    }

    harness.install_function("no-export", &[("index.js", "module.exports = { x: 1 };")]);
    let response = harness.get("no-export", "").await;
    assert_eq!(response.status, 500);
    assert!(json_body(&response)["message"]
        .as_str()
        .unwrap()
        .contains("export"));
}

// ============================================================================
// Log fidelity
// ============================================================================

#[tokio::test]
async fn test_execution_log_matches_client_view() {
    let harness = Harness::new(|c| c);
    harness.install_function(
        "logged",
        &[(
            "index.js",
            r#"
            module.exports = (req, res) => {
                console.log('one');
                console.error('two');
                res.status(418).json({ brew: false });
            };
            "#,
        )],
    );

    let response = harness.get("logged", "a=1").await;
    assert_eq!(response.status, 418);

    let logs = harness.store.recent_logs("logged", 1).await.unwrap();
    let record = &logs[0];
    assert_eq!(record.status_code, 418);
    assert_eq!(record.request_method, "GET");
    assert_eq!(record.request_url, "/?a=1");
    assert_eq!(
        record.response_body.as_deref(),
        Some(String::from_utf8_lossy(&response.body).as_ref())
    );
    assert_eq!(record.response_size, response.body.len() as u64);
    assert_eq!(record.client_ip, "203.0.113.5");
    let console: Vec<&str> = record.console.iter().map(|c| c.message.as_str()).collect();
    assert_eq!(console, vec!["one", "two"]);
    assert_eq!(record.console[1].level, runlet::store::LogLevel::Error);
}

// ============================================================================
// Guest error shaping
// ============================================================================

#[tokio::test]
async fn test_guest_error_payload_includes_console() {
    let harness = Harness::new(|c| c);
    harness.install_function(
        "thrower",
        &[(
            "index.js",
            r#"
            module.exports = () => {
                console.log('before the bang');
                throw new Error('bang');
            };
            "#,
        )],
    );

    let response = harness.get("thrower", "").await;
    assert_eq!(response.status, 500);
    let payload = json_body(&response);
    assert_eq!(payload["success"], false);
    assert!(payload["message"].as_str().unwrap().contains("bang"));
    assert_eq!(payload["console"][0]["message"], "before the bang");
}

// ============================================================================
// Relative requires and denied modules
// ============================================================================

#[tokio::test]
async fn test_multi_file_package_and_denied_module() {
    let harness = Harness::new(|c| c);
    harness.install_function(
        "modular",
        &[
            (
                "index.js",
                r#"
                const { greet } = require('./lib/greeting');
                module.exports = (req, res) => {
                    let denied = null;
                    try { require('cluster'); } catch (e) { denied = e.code; }
                    res.json({ greeting: greet('runlet'), denied });
                };
                "#,
            ),
            (
                "lib/greeting.js",
                "exports.greet = (name) => `hello ${name}`;",
            ),
        ],
    );

    let response = harness.get("modular", "").await;
    assert_eq!(
        json_body(&response),
        serde_json::json!({"greeting": "hello runlet", "denied": "MODULE_NOT_FOUND"})
    );
}

// ============================================================================
// Scheduled execution
// ============================================================================

#[tokio::test]
async fn test_scheduler_runs_due_functions_and_advances() {
    let harness = Harness::new(|c| c);
    let mut descriptor = harness.install_function(
        "cronjob",
        &[(
            "index.js",
            r#"
            module.exports = (req, res) => {
                res.json({
                    scheduled: req.headers['x-scheduled-execution'],
                    method: req.method,
                    url: req.url,
                });
            };
            "#,
        )],
    );
    descriptor.cron_expression = Some("*/5 * * * *".into());
    descriptor.next_execution = Some(Utc::now() - chrono::Duration::minutes(1));
    harness.store.upsert(descriptor);

    let report = scheduler::run_due(&harness.dispatcher).await;
    assert_eq!(report.executed.len(), 1);
    assert_eq!(report.executed[0].status, 200);
    assert!(report.executed[0].next_execution.unwrap() > Utc::now());

    // The log row is marked SCHEDULED and the guest saw the synthetic mirror.
    let logs = harness.store.recent_logs("cronjob", 1).await.unwrap();
    assert_eq!(logs[0].request_method, "SCHEDULED");
    let body: serde_json::Value =
        serde_json::from_str(logs[0].response_body.as_deref().unwrap()).unwrap();
    assert_eq!(body["scheduled"], "true");
    assert_eq!(body["method"], "POST");
    assert_eq!(body["url"], "/scheduled");

    // Not due anymore: a second sweep runs nothing.
    let report = scheduler::run_due(&harness.dispatcher).await;
    assert!(report.executed.is_empty());
}

#[tokio::test]
async fn test_scheduler_disables_unparseable_expression() {
    let harness = Harness::new(|c| c);
    let mut descriptor = harness.install_function(
        "broken-cron",
        &[("index.js", "module.exports = (req, res) => res.json({ ok: 1 });")],
    );
    descriptor.cron_expression = Some("not a cron".into());
    descriptor.next_execution = Some(Utc::now() - chrono::Duration::minutes(1));
    harness.store.upsert(descriptor);

    let report = scheduler::run_due(&harness.dispatcher).await;
    assert!(report.executed.is_empty());
    assert_eq!(report.disabled, vec!["broken-cron".to_string()]);

    let after = harness.store.fetch_active("broken-cron").await.unwrap();
    assert!(after.cron_expression.is_none());
    assert!(after.next_execution.is_none());
}

// ============================================================================
// Concurrency: one populator per fingerprint under contention
// ============================================================================

#[tokio::test]
async fn test_concurrent_invocations_single_population() {
    let harness = Harness::new(|c| c);
    harness.install_function(
        "stampede",
        &[("index.js", "module.exports = (req, res) => res.json({ ok: 1 });")],
    );

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let dispatcher = harness.dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher
                .invoke(InvokeRequest {
                    function_id: "stampede".into(),
                    method: "GET".into(),
                    subpath: "/".into(),
                    query_string: String::new(),
                    headers: vec![],
                    body: vec![],
                    client_ip: "127.0.0.1".into(),
                    user_agent: None,
                })
                .await
                .status
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 200);
    }
    assert_eq!(harness.dispatcher.cache().stats().misses, 1);
}
