//! Rows the engine reads from and writes to the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a captured guest console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Log,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Guest-facing method name that produced this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Log => "log",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse a console method name; unknown names collapse to `log`.
    pub fn from_method(name: &str) -> Self {
        match name {
            "debug" | "trace" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Log,
        }
    }
}

/// One captured console call, in call order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEntry {
    /// Which console method fired
    pub level: LogLevel,
    /// Formatted message
    pub message: String,
    /// When the call happened
    pub timestamp: DateTime<Utc>,
}

/// A function joined with its active version, as the dispatcher consumes it.
///
/// Invariant: an active function always carries a non-empty `package_hash`
/// and `package_path`; [`FunctionDescriptor::validate`] enforces it at the
/// store boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// Stable function identifier
    pub function_id: String,
    /// Human-readable name
    pub name: String,
    /// Whether the function accepts invocations at all
    pub is_active: bool,
    /// Whether invocations must present the stored API key
    pub requires_api_key: bool,
    /// Stored API key, when one is required
    #[serde(default)]
    pub api_key: Option<String>,
    /// Active version number
    pub version: i64,
    /// Archive location inside blob storage
    pub package_path: String,
    /// SHA-256 (hex) over the archive bytes
    pub package_hash: String,
    /// Archive size in bytes; 0 skips the size check
    #[serde(default)]
    pub file_size: u64,
    /// Function-scoped environment variables, exposed as `process.env`
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Cron expression driving scheduled runs, if any
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Next scheduled fire time, maintained by the scheduler
    #[serde(default)]
    pub next_execution: Option<DateTime<Utc>>,
}

impl FunctionDescriptor {
    /// Check the active-version invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.package_hash.is_empty() {
            return Err("active version has an empty package_hash".into());
        }
        if self.package_path.is_empty() {
            return Err("active version has an empty package_path".into());
        }
        Ok(())
    }
}

/// Immutable record of one finished invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogRecord {
    /// Function that ran
    pub function_id: String,
    /// Status code the client received
    pub status_code: u16,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Request method; `SCHEDULED` for cron-driven runs
    pub request_method: String,
    /// Request url (path + query)
    pub request_url: String,
    /// Request body, possibly truncated at the configured cap
    pub request_body: Option<String>,
    /// Request body size in bytes, before truncation
    pub request_size: u64,
    /// Response body, possibly truncated at the configured cap
    pub response_body: Option<String>,
    /// Response body size in bytes, before truncation
    pub response_size: u64,
    /// Request headers as seen after sanitization
    pub request_headers: Vec<(String, String)>,
    /// Response headers the client received
    pub response_headers: Vec<(String, String)>,
    /// Captured console output in call order
    pub console: Vec<ConsoleEntry>,
    /// Client address
    pub client_ip: String,
    /// Client user agent, when presented
    pub user_agent: Option<String>,
    /// When the invocation started
    pub executed_at: DateTime<Utc>,
    /// Error message when the invocation failed
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> FunctionDescriptor {
        FunctionDescriptor {
            function_id: "fn-1".into(),
            name: "echo".into(),
            is_active: true,
            requires_api_key: false,
            api_key: None,
            version: 3,
            package_path: "packages/fn-1/3.tar.gz".into(),
            package_hash: "ab".repeat(32),
            file_size: 1024,
            env: vec![],
            cron_expression: None,
            next_execution: None,
        }
    }

    #[test]
    fn test_descriptor_validates() {
        assert!(descriptor().validate().is_ok());

        let mut broken = descriptor();
        broken.package_hash.clear();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_log_level_from_method() {
        assert_eq!(LogLevel::from_method("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::from_method("trace"), LogLevel::Debug);
        assert_eq!(LogLevel::from_method("table"), LogLevel::Log);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let json = serde_json::to_string(&descriptor()).unwrap();
        let back: FunctionDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.function_id, "fn-1");
        assert_eq!(back.version, 3);
    }
}
