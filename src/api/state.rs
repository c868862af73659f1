//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::dispatch::Dispatcher;

/// Shared state behind every route.
pub struct AppState {
    /// The invocation dispatcher and everything it owns
    pub dispatcher: Arc<Dispatcher>,
    /// Engine configuration as loaded at startup
    pub config: Config,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            config,
            started_at: Instant::now(),
        })
    }

    /// Seconds since the server came up.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
