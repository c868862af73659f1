//! API response types.

use serde::Serialize;

use crate::cache::{CacheStats, EntryStats, EvictionReport};
use crate::metrics::MetricsSnapshot;

/// `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

/// One dependency's probe result in the detailed health view.
#[derive(Debug, Serialize)]
pub struct DependencyHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `GET /health/detailed`
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub guests_in_use: usize,
    pub dependencies: Vec<DependencyHealth>,
}

/// `GET /cache/stats`
#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub entries: Vec<EntryStats>,
}

/// `POST /cache/cleanup`
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    #[serde(flatten)]
    pub report: EvictionReport,
}

/// `DELETE /cache/{functionId}`
#[derive(Debug, Serialize)]
pub struct EvictResponse {
    pub function_id: String,
    pub freed_bytes: u64,
}

/// `GET /metrics`
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
}

/// `GET /`
#[derive(Debug, Serialize)]
pub struct ApiInfo {
    pub name: &'static str,
    pub version: &'static str,
}
