//! In-memory metadata store.
//!
//! Backs standalone deployments and tests. Seeds from a JSON manifest of
//! function descriptors; execution logs accumulate in memory with a bounded
//! ring so long-running dev servers do not grow without limit.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::types::{ExecutionLogRecord, FunctionDescriptor};
use super::MetadataStore;

/// Maximum execution-log rows kept in memory.
const LOG_RING_CAPACITY: usize = 10_000;

/// Manifest file shape: `{ "functions": [ ... ] }`.
#[derive(Debug, Deserialize)]
struct Manifest {
    functions: Vec<FunctionDescriptor>,
}

/// DashMap-backed [`MetadataStore`].
#[derive(Default)]
pub struct MemoryStore {
    functions: DashMap<String, FunctionDescriptor>,
    logs: Mutex<VecDeque<ExecutionLogRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded from a JSON manifest file.
    pub fn from_manifest(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| Error::FileNotFound(path.to_path_buf()))?;
        let manifest: Manifest = serde_json::from_str(&raw)?;

        let store = Self::new();
        for descriptor in manifest.functions {
            descriptor
                .validate()
                .map_err(|message| Error::BrokenVersion {
                    function_id: descriptor.function_id.clone(),
                    message,
                })?;
            debug!(
                function_id = %descriptor.function_id,
                version = descriptor.version,
                "loaded function from manifest"
            );
            store.upsert(descriptor);
        }
        info!(count = store.functions.len(), manifest = %path.display(), "manifest loaded");
        Ok(store)
    }

    /// Insert or replace a function row.
    pub fn upsert(&self, descriptor: FunctionDescriptor) {
        self.functions
            .insert(descriptor.function_id.clone(), descriptor);
    }

    /// Remove a function row.
    pub fn remove(&self, function_id: &str) {
        self.functions.remove(function_id);
    }

    /// Number of stored functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the store holds no functions.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Total log rows currently retained.
    pub fn log_count(&self) -> usize {
        self.logs.lock().len()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn fetch_active(&self, function_id: &str) -> Result<FunctionDescriptor> {
        match self.functions.get(function_id) {
            Some(descriptor) if descriptor.is_active => Ok(descriptor.clone()),
            _ => Err(Error::FunctionNotFound(function_id.to_string())),
        }
    }

    async fn append_execution_log(&self, record: ExecutionLogRecord) {
        let mut logs = self.logs.lock();
        if logs.len() >= LOG_RING_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(record);
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<FunctionDescriptor>> {
        let mut due: Vec<FunctionDescriptor> = self
            .functions
            .iter()
            .filter(|entry| {
                entry.is_active
                    && entry.cron_expression.is_some()
                    && entry.next_execution.map(|at| at <= now).unwrap_or(false)
            })
            .map(|entry| entry.clone())
            .collect();
        due.sort_by(|a, b| a.next_execution.cmp(&b.next_execution));
        Ok(due)
    }

    async fn set_next_execution(
        &self,
        function_id: &str,
        next: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match self.functions.get_mut(function_id) {
            Some(mut entry) => {
                entry.next_execution = next;
                if next.is_none() {
                    entry.cron_expression = None;
                }
                Ok(())
            }
            None => Err(Error::FunctionNotFound(function_id.to_string())),
        }
    }

    async fn recent_logs(
        &self,
        function_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionLogRecord>> {
        let logs = self.logs.lock();
        Ok(logs
            .iter()
            .rev()
            .filter(|record| record.function_id == function_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn descriptor(id: &str, active: bool) -> FunctionDescriptor {
        FunctionDescriptor {
            function_id: id.into(),
            name: id.into(),
            is_active: active,
            requires_api_key: false,
            api_key: None,
            version: 1,
            package_path: format!("{}/1.tar.gz", id),
            package_hash: "ef".repeat(32),
            file_size: 0,
            env: vec![("GREETING".into(), "hello".into())],
            cron_expression: None,
            next_execution: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_active_rejects_inactive() {
        let store = MemoryStore::new();
        store.upsert(descriptor("live", true));
        store.upsert(descriptor("dead", false));

        assert!(store.fetch_active("live").await.is_ok());
        assert!(matches!(
            store.fetch_active("dead").await,
            Err(Error::FunctionNotFound(_))
        ));
        assert!(matches!(
            store.fetch_active("ghost").await,
            Err(Error::FunctionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_due_scheduled_filters_and_orders() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut early = descriptor("early", true);
        early.cron_expression = Some("* * * * *".into());
        early.next_execution = Some(now - ChronoDuration::minutes(5));
        store.upsert(early);

        let mut late = descriptor("late", true);
        late.cron_expression = Some("* * * * *".into());
        late.next_execution = Some(now - ChronoDuration::minutes(1));
        store.upsert(late);

        let mut future = descriptor("future", true);
        future.cron_expression = Some("* * * * *".into());
        future.next_execution = Some(now + ChronoDuration::minutes(10));
        store.upsert(future);

        let due = store.due_scheduled(now).await.unwrap();
        let ids: Vec<_> = due.iter().map(|d| d.function_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_disabling_schedule_clears_expression() {
        let store = MemoryStore::new();
        let mut d = descriptor("cronic", true);
        d.cron_expression = Some("bogus".into());
        d.next_execution = Some(Utc::now());
        store.upsert(d);

        store.set_next_execution("cronic", None).await.unwrap();
        let after = store.fetch_active("cronic").await.unwrap();
        assert!(after.cron_expression.is_none());
        assert!(after.next_execution.is_none());
    }

    #[tokio::test]
    async fn test_recent_logs_newest_first() {
        let store = MemoryStore::new();
        for status in [200u16, 404, 500] {
            store
                .append_execution_log(ExecutionLogRecord {
                    function_id: "fn-a".into(),
                    status_code: status,
                    duration_ms: 5,
                    request_method: "GET".into(),
                    request_url: "/invoke/fn-a".into(),
                    request_body: None,
                    request_size: 0,
                    response_body: None,
                    response_size: 0,
                    request_headers: vec![],
                    response_headers: vec![],
                    console: vec![],
                    client_ip: "127.0.0.1".into(),
                    user_agent: None,
                    executed_at: Utc::now(),
                    error: None,
                })
                .await;
        }

        let logs = store.recent_logs("fn-a", 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status_code, 500);
        assert_eq!(logs[1].status_code, 404);
    }
}
