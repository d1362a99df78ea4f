//! Sharded batch executor
//!
//! Shared engine of every batched write stage (source and column index
//! writers, update, delete). Items are grouped into one pending request
//! per shard; a request is dispatched when it reaches `bulk_size` items or
//! when the stage finishes.
//!
//! Dispatch first takes a slot from the node's in-flight counter and
//! suspends while the node is at `max_concurrent_requests_per_node`. This
//! is the only backpressure towards shards. Requests then run as tasks on
//! a `JoinSet`, each bounded by the bulk timeout.
//!
//! Failure semantics:
//! - a request that fails as a whole (transport error, timeout, index
//!   creation failure) fails every item it carried
//! - a malformed item fails alone and is never sent
//! - nothing is retried here

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::task::JoinSet;
use uuid::Uuid;

use super::result::BulkSummary;
use crate::cluster::{BulkItem, BulkOperation, BulkOptions, NodeId, ShardBulkRequest, ShardId};
use crate::config::ExecutionSettings;
use crate::engine::{ClusterServices, ExecResult, ExecutionError};
use crate::observability::{log_event, Event};

/// Per-stage executor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkConfig {
    pub bulk_size: usize,
    pub max_concurrent_requests_per_node: usize,
    pub timeout: Duration,
    pub auto_create_indices: bool,
    pub options: BulkOptions,
}

impl BulkConfig {
    /// Node defaults, with an optional per-stage bulk size override
    pub fn from_settings(settings: &ExecutionSettings, bulk_actions: Option<usize>) -> ExecResult<Self> {
        let bulk_size = bulk_actions.unwrap_or(settings.bulk_size);
        if bulk_size == 0 {
            return Err(ExecutionError::invalid_parameter("bulk_actions must be > 0"));
        }
        Ok(Self {
            bulk_size,
            max_concurrent_requests_per_node: settings.max_concurrent_requests_per_node,
            timeout: settings.bulk_request_timeout(),
            auto_create_indices: false,
            options: BulkOptions::default(),
        })
    }

    pub fn with_auto_create_indices(mut self, enabled: bool) -> Self {
        self.auto_create_indices = enabled;
        self
    }

    pub fn with_options(mut self, options: BulkOptions) -> Self {
        self.options = options;
        self
    }
}

struct PendingRequest {
    node: NodeId,
    items: Vec<BulkItem>,
}

/// Outcome of one dispatched request
struct BulkOutcome {
    node: NodeId,
    shard: ShardId,
    locations: Vec<usize>,
    result: ExecResult<crate::cluster::ShardBulkResponse>,
}

pub struct ShardedBatchExecutor {
    services: ClusterServices,
    config: BulkConfig,
    job_id: Uuid,
    pending: HashMap<ShardId, PendingRequest>,
    in_flight: JoinSet<BulkOutcome>,
    /// Source URI per item location, kept only for items that have one
    sources: HashMap<usize, String>,
    ensured_indices: HashSet<String>,
    next_location: usize,
    summary: BulkSummary,
}

impl ShardedBatchExecutor {
    pub fn new(services: ClusterServices, config: BulkConfig, job_id: Uuid) -> Self {
        Self {
            services,
            config,
            job_id,
            pending: HashMap::new(),
            in_flight: JoinSet::new(),
            sources: HashMap::new(),
            ensured_indices: HashSet::new(),
            next_location: 0,
            summary: BulkSummary::new(),
        }
    }

    pub fn services(&self) -> &ClusterServices {
        &self.services
    }

    /// Queues one item for `shard` on `node`, dispatching the shard's
    /// request once it is full
    pub async fn add(
        &mut self,
        shard: ShardId,
        node: NodeId,
        id: String,
        routing: Option<String>,
        operation: BulkOperation,
        source_uri: Option<String>,
    ) -> ExecResult<()> {
        let location = self.next_location;
        self.next_location += 1;
        if let Some(uri) = source_uri {
            self.sources.insert(location, uri);
        }

        let pending = self
            .pending
            .entry(shard.clone())
            .or_insert_with(|| PendingRequest {
                node,
                items: Vec::new(),
            });
        pending.items.push(BulkItem {
            location,
            id,
            routing,
            operation,
        });

        if pending.items.len() >= self.config.bulk_size {
            self.dispatch(shard).await;
        }
        self.reap_completed()
    }

    /// Records a malformed item without sending it
    pub fn reject(&mut self, source_uri: Option<&str>, message: &str) {
        self.next_location += 1;
        let node = self.services.local_node.clone();
        self.summary.record_failure(&node, source_uri, message);
        self.services.metrics.add_bulk_items(0, 1);
    }

    async fn dispatch(&mut self, shard: ShardId) {
        let Some(PendingRequest { node, items }) = self.pending.remove(&shard) else {
            return;
        };
        let locations: Vec<usize> = items.iter().map(|item| item.location).collect();

        if self.config.auto_create_indices && !self.ensured_indices.contains(&shard.index) {
            if !self.services.routing.index_exists(&shard.index) {
                let created = self
                    .services
                    .index_creation
                    .ensure(
                        &shard.index,
                        self.services.index_admin.as_ref(),
                        &self.services.metrics,
                    )
                    .await;
                if let Err(error) = created {
                    self.merge(BulkOutcome {
                        node,
                        shard,
                        locations,
                        result: Err(error),
                    });
                    return;
                }
            }
            self.ensured_indices.insert(shard.index.clone());
        }

        let permit = self
            .services
            .node_jobs
            .acquire(&node, self.config.max_concurrent_requests_per_node)
            .await;

        self.services.metrics.increment_bulk_dispatched();
        log_event(
            Event::BulkDispatched,
            &[
                ("items", items.len().to_string().as_str()),
                ("job_id", self.job_id.to_string().as_str()),
                ("node", node.as_str()),
                ("shard", shard.to_string().as_str()),
            ],
        );

        let request = ShardBulkRequest {
            job_id: self.job_id,
            shard: shard.clone(),
            options: self.config.options,
            items,
        };
        let transport = self.services.bulk.clone();
        let timeout = self.config.timeout;
        self.in_flight.spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.execute_bulk(&node, request)).await
            {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Transport(format!(
                    "bulk request to {} timed out after {}ms",
                    shard,
                    timeout.as_millis()
                ))),
            };
            drop(permit);
            BulkOutcome {
                node,
                shard,
                locations,
                result,
            }
        });
    }

    /// Merges requests that already completed without waiting
    fn reap_completed(&mut self) -> ExecResult<()> {
        while let Some(joined) = self.in_flight.try_join_next() {
            let outcome = joined
                .map_err(|e| ExecutionError::Internal(format!("bulk task failed: {}", e)))?;
            self.merge(outcome);
        }
        Ok(())
    }

    fn merge(&mut self, outcome: BulkOutcome) {
        let BulkOutcome {
            node,
            shard,
            locations,
            result,
        } = outcome;
        let (mut succeeded, mut failed) = (0u64, 0u64);

        match result {
            Ok(response) => {
                let mut by_location: HashMap<usize, Option<String>> = response
                    .items
                    .into_iter()
                    .map(|item| (item.location, item.error))
                    .collect();
                for location in locations {
                    let source = self.sources.remove(&location);
                    match by_location.remove(&location) {
                        Some(None) => {
                            succeeded += 1;
                            self.summary.record_success(&node, source.as_deref());
                        }
                        Some(Some(message)) => {
                            failed += 1;
                            self.summary.record_failure(&node, source.as_deref(), &message);
                        }
                        None => {
                            failed += 1;
                            self.summary.record_failure(
                                &node,
                                source.as_deref(),
                                "no response for item",
                            );
                        }
                    }
                }
            }
            Err(error) => {
                self.services.metrics.increment_bulk_failed();
                log_event(
                    Event::BulkFailed,
                    &[
                        ("error", error.to_string().as_str()),
                        ("items", locations.len().to_string().as_str()),
                        ("job_id", self.job_id.to_string().as_str()),
                        ("node", node.as_str()),
                        ("shard", shard.to_string().as_str()),
                    ],
                );
                let message = error.to_string();
                for location in locations {
                    let source = self.sources.remove(&location);
                    failed += 1;
                    self.summary.record_failure(&node, source.as_deref(), &message);
                }
            }
        }
        self.services.metrics.add_bulk_items(succeeded, failed);
    }

    /// Dispatches every pending request and waits for all in-flight
    /// requests to complete
    pub async fn finish(&mut self) -> ExecResult<BulkSummary> {
        let mut shards: Vec<ShardId> = self.pending.keys().cloned().collect();
        shards.sort();
        for shard in shards {
            self.dispatch(shard).await;
            self.reap_completed()?;
        }
        while let Some(joined) = self.in_flight.join_next().await {
            let outcome = joined
                .map_err(|e| ExecutionError::Internal(format!("bulk task failed: {}", e)))?;
            self.merge(outcome);
        }
        Ok(std::mem::take(&mut self.summary))
    }

    /// Drops pending items. Requests already dispatched keep running to
    /// completion; their results are discarded.
    pub fn abandon(&mut self) {
        self.pending.clear();
        self.sources.clear();
        self.in_flight.detach_all();
    }
}
