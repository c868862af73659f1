//! Metadata store client.
//!
//! The relational store holding `functions`, `function_versions`,
//! `function_environment_variables`, and `execution_logs` is an external
//! collaborator; the engine talks to it through [`MetadataStore`]. The
//! in-process [`MemoryStore`] implements the same contract for standalone
//! deployments and tests, seeding itself from a JSON manifest.

pub mod memory;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{Error, Result};

pub use memory::MemoryStore;
pub use types::{ConsoleEntry, ExecutionLogRecord, FunctionDescriptor, LogLevel};

/// Read-side and log-append contract the engine consumes.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch a function joined with its active version.
    ///
    /// Fails with [`Error::FunctionNotFound`] when the row is absent or the
    /// function is inactive.
    async fn fetch_active(&self, function_id: &str) -> Result<FunctionDescriptor>;

    /// Append an execution log row. Must never fail the caller: transient
    /// store errors are the implementation's problem to retry or drop.
    async fn append_execution_log(&self, record: ExecutionLogRecord);

    /// Scheduled functions whose `next_execution` is at or before `now`.
    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<FunctionDescriptor>>;

    /// Write back the next fire time; `None` disables the schedule.
    async fn set_next_execution(
        &self,
        function_id: &str,
        next: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Most recent execution logs for a function, newest first.
    async fn recent_logs(&self, function_id: &str, limit: usize)
        -> Result<Vec<ExecutionLogRecord>>;
}

/// Fetch a descriptor, retrying transient store errors with exponential
/// backoff. Non-transient errors (including not-found) surface immediately.
pub async fn fetch_active_with_retry(
    store: &Arc<dyn MetadataStore>,
    function_id: &str,
    max_retries: u32,
) -> Result<FunctionDescriptor> {
    let mut attempt = 0u32;
    loop {
        match store.fetch_active(function_id).await {
            Ok(descriptor) => {
                descriptor.validate().map_err(|message| Error::BrokenVersion {
                    function_id: function_id.to_string(),
                    message,
                })?;
                return Ok(descriptor);
            }
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = Duration::from_millis(100u64.saturating_mul(1 << attempt.min(6)));
                warn!(
                    function_id,
                    attempt,
                    error = %e,
                    "transient store error reading function metadata, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyStore {
        failures: AtomicU32,
        inner: MemoryStore,
    }

    #[async_trait]
    impl MetadataStore for FlakyStore {
        async fn fetch_active(&self, function_id: &str) -> Result<FunctionDescriptor> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return Err(Error::StoreTransient("connection reset".into()));
            }
            self.inner.fetch_active(function_id).await
        }

        async fn append_execution_log(&self, record: ExecutionLogRecord) {
            self.inner.append_execution_log(record).await;
        }

        async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<FunctionDescriptor>> {
            self.inner.due_scheduled(now).await
        }

        async fn set_next_execution(
            &self,
            function_id: &str,
            next: Option<DateTime<Utc>>,
        ) -> Result<()> {
            self.inner.set_next_execution(function_id, next).await
        }

        async fn recent_logs(
            &self,
            function_id: &str,
            limit: usize,
        ) -> Result<Vec<ExecutionLogRecord>> {
            self.inner.recent_logs(function_id, limit).await
        }
    }

    fn descriptor(id: &str) -> FunctionDescriptor {
        FunctionDescriptor {
            function_id: id.into(),
            name: id.into(),
            is_active: true,
            requires_api_key: false,
            api_key: None,
            version: 1,
            package_path: format!("{}/1.tar.gz", id),
            package_hash: "cd".repeat(32),
            file_size: 0,
            env: vec![],
            cron_expression: None,
            next_execution: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_errors() {
        let inner = MemoryStore::new();
        inner.upsert(descriptor("fn-a"));
        let store: Arc<dyn MetadataStore> = Arc::new(FlakyStore {
            failures: AtomicU32::new(2),
            inner,
        });

        let fetched = fetch_active_with_retry(&store, "fn-a", 3).await.unwrap();
        assert_eq!(fetched.function_id, "fn-a");
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_not_found() {
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        let err = fetch_active_with_retry(&store, "ghost", 3).await.unwrap_err();
        assert!(matches!(err, Error::FunctionNotFound(_)));
    }
}
