//! Execution context
//!
//! Carried into every projector built for one job on one shard or node.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

use super::ram::RamAccountingContext;
use crate::cluster::ShardId;
use crate::config::ExecutionSettings;

/// Failure that affected a single row or item, not the whole stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Kind tag of the stage that recorded it
    pub stage: &'static str,
    pub message: String,
}

/// Per-job log of row-level failures.
///
/// Stages that skip a row instead of failing (fetch-join on a missing
/// document) record the reason here so the caller can decide policy.
#[derive(Debug, Default)]
pub struct FailureLog {
    failures: Mutex<Vec<RowFailure>>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: &'static str, message: impl Into<String>) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.push(RowFailure {
            stage,
            message: message.into(),
        });
    }

    pub fn failures(&self) -> Vec<RowFailure> {
        match self.failures.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.failures().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Context shared by all projectors of one job
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Correlates distributed sub-requests
    pub job_id: Uuid,

    /// Shared memory budget of the job
    pub ram: RamAccountingContext,

    /// Shard this chain runs on; `None` for node-level chains
    pub shard_id: Option<ShardId>,

    /// Row-level failures recorded by any stage of the job
    pub failures: Arc<FailureLog>,

    started_at: Instant,
}

impl ExecutionContext {
    pub fn new(job_id: Uuid, ram: RamAccountingContext, shard_id: Option<ShardId>) -> Self {
        Self {
            job_id,
            ram,
            shard_id,
            failures: Arc::new(FailureLog::new()),
            started_at: Instant::now(),
        }
    }

    /// Node-level context for a fresh job, budgeted from `settings`
    pub fn for_job(settings: &ExecutionSettings) -> Self {
        let job_id = Uuid::new_v4();
        let ram = RamAccountingContext::new(format!("job-{}", job_id), settings.memory_limit_bytes);
        Self::new(job_id, ram, None)
    }

    /// Same job, bound to `shard`
    pub fn with_shard(mut self, shard: ShardId) -> Self {
        self.shard_id = Some(shard);
        self
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}
