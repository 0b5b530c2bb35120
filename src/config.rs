//! Pipeline configuration.
//!
//! All sections default to sensible values, so an embedding application can
//! deserialize a partial JSON document and override only what it needs.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub undo: UndoConfig,
    pub rate_limit: RateLimitPolicy,
    pub audit: AuditConfig,
    pub dispatcher: DispatcherConfig,
}

impl PipelineConfig {
    /// Parse from a JSON document. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_in_flight == 0 {
            return Err(PipelineError::Config("queue.max_in_flight must be > 0".into()));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_minutes == 0 {
            return Err(PipelineError::Config(
                "rate_limit.max_requests and window_minutes must be > 0".into(),
            ));
        }
        if self.undo.duration_ms == 0 {
            return Err(PipelineError::Config("undo.duration_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Mutation queue settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Journal file for surviving restarts (None = in-memory only).
    pub journal_path: Option<PathBuf>,

    /// Dispatch at most one write per entity at a time.
    pub serialize_per_entity: bool,

    /// Max submissions in flight during one dispatch pass.
    pub max_in_flight: usize,

    /// Rewrite the journal once it holds this many stale entries.
    pub compact_after: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            serialize_per_entity: true,
            max_in_flight: 8,
            compact_after: 1024,
        }
    }
}

/// Undo window settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UndoConfig {
    /// How long a destructive action stays reversible.
    pub duration_ms: u64,
}

impl UndoConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self { duration_ms: 10_000 }
    }
}

/// Sliding-window limit applied to bulk writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub action_type: String,
    pub max_requests: u32,
    pub window_minutes: u32,
    /// Run a local advisory check before calling the remote store.
    pub advisory_precheck: bool,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            action_type: "bulk_insert".to_string(),
            max_requests: 10,
            window_minutes: 1,
            advisory_precheck: true,
        }
    }
}

/// Audit query settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub default_query_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_query_limit: 50,
        }
    }
}

/// Background dispatcher settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub interval_ms: u64,
}

impl DispatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}
