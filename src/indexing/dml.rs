//! Shard-local update and delete
//!
//! Both stages run on the shard that produced their rows: every item goes
//! to that shard, addressed by the document id in the `uid` column. They
//! emit a single row with the number of documents affected.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use uuid::Uuid;

use super::bulk::{BulkConfig, ShardedBatchExecutor};
use crate::cluster::{BulkOperation, NodeId, ShardId};
use crate::config::ExecutionSettings;
use crate::data::{Row, Value};
use crate::engine::{
    ClusterServices, Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow,
    RowReceiver,
};
use crate::expression::{Input, InputFactory};
use crate::projection::{DeleteProjection, UpdateProjection, WriterResultMode};

enum DmlOperation {
    Update {
        assignments: Vec<(String, Box<dyn Input>)>,
        required_version: Option<Box<dyn Input>>,
    },
    Delete,
}

pub struct ShardDmlProjector {
    kind: &'static str,
    lifecycle: Lifecycle,
    downstream: Downstream,
    shard: ShardId,
    node: NodeId,
    uid: Box<dyn Input>,
    operation: DmlOperation,
    executor: ShardedBatchExecutor,
}

impl ShardDmlProjector {
    pub fn update(
        projection: &UpdateProjection,
        shard: ShardId,
        services: ClusterServices,
        settings: &ExecutionSettings,
        job_id: Uuid,
    ) -> ExecResult<Self> {
        let assignments = projection
            .assignments
            .iter()
            .map(|(column, symbol)| Ok((column.clone(), InputFactory::compile(symbol)?)))
            .collect::<ExecResult<Vec<_>>>()?;
        if assignments.is_empty() {
            return Err(ExecutionError::invalid_parameter("update without assignments"));
        }
        let operation = DmlOperation::Update {
            assignments,
            required_version: projection
                .required_version
                .as_ref()
                .map(InputFactory::compile)
                .transpose()?,
        };
        Self::new(
            "update",
            &projection.uid,
            operation,
            projection.bulk_actions,
            shard,
            services,
            settings,
            job_id,
        )
    }

    pub fn delete(
        projection: &DeleteProjection,
        shard: ShardId,
        services: ClusterServices,
        settings: &ExecutionSettings,
        job_id: Uuid,
    ) -> ExecResult<Self> {
        Self::new(
            "delete",
            &projection.uid,
            DmlOperation::Delete,
            projection.bulk_actions,
            shard,
            services,
            settings,
            job_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        kind: &'static str,
        uid: &crate::expression::Symbol,
        operation: DmlOperation,
        bulk_actions: Option<usize>,
        shard: ShardId,
        services: ClusterServices,
        settings: &ExecutionSettings,
        job_id: Uuid,
    ) -> ExecResult<Self> {
        let node = services
            .routing
            .node_for_shard(&shard)
            .unwrap_or_else(|| services.local_node.clone());
        let config = BulkConfig::from_settings(settings, bulk_actions)?;
        Ok(Self {
            kind,
            lifecycle: Lifecycle::new(kind),
            downstream: Downstream::default(),
            shard,
            node,
            uid: InputFactory::compile(uid)?,
            operation,
            executor: ShardedBatchExecutor::new(services, config, job_id),
        })
    }

    fn bulk_operation(&self, row: &dyn Row) -> ExecResult<BulkOperation> {
        match &self.operation {
            DmlOperation::Update {
                assignments,
                required_version,
            } => {
                let assignments = assignments
                    .iter()
                    .map(|(column, input)| Ok((column.clone(), input.value(row)?)))
                    .collect::<ExecResult<Vec<_>>>()?;
                let required_version = match required_version {
                    Some(input) => match input.value(row)? {
                        Value::Null => None,
                        value => Some(value.as_i64().ok_or_else(|| {
                            ExecutionError::evaluation(format!(
                                "version must be an integer, got {}",
                                value.type_name()
                            ))
                        })?),
                    },
                    None => None,
                };
                Ok(BulkOperation::Update {
                    assignments,
                    required_version,
                })
            }
            DmlOperation::Delete => Ok(BulkOperation::Delete),
        }
    }
}

impl RowReceiver for ShardDmlProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            let id = match self.uid.value(row) {
                Err(e) => {
                    self.executor.reject(None, &e.into_item_failure()?);
                    return Ok(RowFlow::Continue);
                }
                Ok(Value::Null) => {
                    self.executor.reject(None, "document id must not be null");
                    return Ok(RowFlow::Continue);
                }
                Ok(value) => value.to_string(),
            };
            let operation = match self.bulk_operation(row) {
                Ok(operation) => operation,
                Err(e) => {
                    self.executor.reject(None, &e.into_item_failure()?);
                    return Ok(RowFlow::Continue);
                }
            };
            self.executor
                .add(self.shard.clone(), self.node.clone(), id, None, operation, None)
                .await?;
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            let summary = self.executor.finish().await?;
            self.downstream
                .push_all(summary.to_rows(WriterResultMode::RowCount))
                .await?;
            self.downstream.finish().await
        }
        .boxed()
    }

    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()> {
        async move {
            if self.lifecycle.on_fail() {
                self.executor.abandon();
                self.downstream.fail(error).await;
            }
        }
        .boxed()
    }
}

impl Projector for ShardDmlProjector {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}
