//! Execution settings
//!
//! Loaded once from a JSON file (or defaulted) and immutable afterwards.
//! Every field is optional in the file; missing fields take the defaults
//! below.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::{ExecResult, ExecutionError};
use crate::observability::{Event, Logger, Severity};

/// Items per bulk request when a projection does not override it
pub const DEFAULT_BULK_SIZE: usize = 10_000;
/// Simultaneous in-flight bulk requests per target node
pub const DEFAULT_MAX_CONCURRENT_REQUESTS_PER_NODE: usize = 5;
/// Rows buffered before a fetch round-trip
pub const DEFAULT_FETCH_SIZE: usize = 500;
/// Upper bound on a single bulk request
pub const DEFAULT_BULK_REQUEST_TIMEOUT_MS: u64 = 60_000;
/// Per-job memory budget (256 MiB)
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 256 * 1024 * 1024;

/// Node-level settings of the execution core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Default number of items per bulk request
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Per-node cap on in-flight bulk requests (backpressure)
    #[serde(default = "default_max_concurrent_requests_per_node")]
    pub max_concurrent_requests_per_node: usize,

    /// Default number of rows per fetch batch
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    /// Timeout applied to every bulk request
    #[serde(default = "default_bulk_request_timeout_ms")]
    pub bulk_request_timeout_ms: u64,

    /// Memory budget per job in bytes
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,

    /// Minimum log severity: trace, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bulk_size() -> usize {
    DEFAULT_BULK_SIZE
}
fn default_max_concurrent_requests_per_node() -> usize {
    DEFAULT_MAX_CONCURRENT_REQUESTS_PER_NODE
}
fn default_fetch_size() -> usize {
    DEFAULT_FETCH_SIZE
}
fn default_bulk_request_timeout_ms() -> u64 {
    DEFAULT_BULK_REQUEST_TIMEOUT_MS
}
fn default_memory_limit_bytes() -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            bulk_size: DEFAULT_BULK_SIZE,
            max_concurrent_requests_per_node: DEFAULT_MAX_CONCURRENT_REQUESTS_PER_NODE,
            fetch_size: DEFAULT_FETCH_SIZE,
            bulk_request_timeout_ms: DEFAULT_BULK_REQUEST_TIMEOUT_MS,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            log_level: default_log_level(),
        }
    }
}

impl ExecutionSettings {
    /// Load settings from a JSON file and validate them
    pub fn load(path: &Path) -> ExecResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ExecutionError::invalid_parameter(format!("Failed to read settings: {}", e))
        })?;
        let settings = Self::from_json(&content)?;
        Logger::info(
            Event::ConfigLoaded.as_str(),
            &[("path", path.display().to_string().as_str())],
        );
        Ok(settings)
    }

    /// Parse and validate settings from a JSON string
    pub fn from_json(content: &str) -> ExecResult<Self> {
        let settings: ExecutionSettings = serde_json::from_str(content).map_err(|e| {
            ExecutionError::invalid_parameter(format!("Invalid settings JSON: {}", e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate value ranges
    pub fn validate(&self) -> ExecResult<()> {
        if self.bulk_size == 0 {
            return Err(ExecutionError::invalid_parameter("bulk_size must be > 0"));
        }
        if self.max_concurrent_requests_per_node == 0 {
            return Err(ExecutionError::invalid_parameter(
                "max_concurrent_requests_per_node must be > 0",
            ));
        }
        if self.fetch_size == 0 {
            return Err(ExecutionError::invalid_parameter("fetch_size must be > 0"));
        }
        if self.bulk_request_timeout_ms == 0 {
            return Err(ExecutionError::invalid_parameter(
                "bulk_request_timeout_ms must be > 0",
            ));
        }
        if self.memory_limit_bytes == 0 {
            return Err(ExecutionError::invalid_parameter(
                "memory_limit_bytes must be > 0",
            ));
        }
        if Severity::parse(&self.log_level).is_none() {
            return Err(ExecutionError::invalid_parameter(format!(
                "Invalid log_level: '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Configured minimum log severity
    pub fn log_severity(&self) -> Severity {
        Severity::parse(&self.log_level).unwrap_or(Severity::Info)
    }

    pub fn bulk_request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.bulk_request_timeout_ms)
    }
}
