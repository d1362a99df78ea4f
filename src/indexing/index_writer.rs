//! Index writers
//!
//! Turn each input row into one bulk item addressed by primary key,
//! clustered-by routing and (for partitioned tables) partition values.
//! Two payload shapes share the same stage: a raw JSON document, or a
//! list of column values with an optional upsert clause.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use uuid::Uuid;

use super::bulk::{BulkConfig, ShardedBatchExecutor};
use super::index_name::{DocAddress, DocAddressBuilder, IndexNameResolver};
use crate::cluster::{BulkOperation, BulkOptions};
use crate::config::ExecutionSettings;
use crate::data::{Row, Value};
use crate::engine::{
    ClusterServices, Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow,
    RowReceiver,
};
use crate::expression::{Input, InputFactory, InputRow};
use crate::projection::{ColumnIndexWriterProjection, SourceIndexWriterProjection, WriterResultMode};

enum Payload {
    Source {
        raw: Box<dyn Input>,
        includes: Option<Vec<String>>,
        excludes: Option<Vec<String>>,
    },
    Columns {
        names: Vec<String>,
        values: InputRow,
        on_duplicate: Option<Vec<(String, Box<dyn Input>)>>,
    },
}

impl Payload {
    /// `Ok(Err(message))` marks a malformed item
    fn operation(&self, row: &dyn Row) -> ExecResult<Result<BulkOperation, String>> {
        match self {
            Payload::Source {
                raw,
                includes,
                excludes,
            } => {
                let source = match raw.value(row)? {
                    Value::Object(fields) => fields,
                    Value::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(serde_json::Value::Object(map)) => map
                            .into_iter()
                            .map(|(k, v)| (k, Value::from(v)))
                            .collect(),
                        Ok(_) => return Ok(Err("source must be a JSON object".to_string())),
                        Err(e) => return Ok(Err(format!("failed to parse source: {}", e))),
                    },
                    other => {
                        return Ok(Err(format!(
                            "source must be an object, got {}",
                            other.type_name()
                        )))
                    }
                };
                let source = source
                    .into_iter()
                    .filter(|(key, _)| includes.as_ref().map_or(true, |inc| inc.contains(key)))
                    .filter(|(key, _)| excludes.as_ref().map_or(true, |exc| !exc.contains(key)))
                    .collect();
                Ok(Ok(BulkOperation::Index {
                    source: Value::Object(source),
                }))
            }
            Payload::Columns {
                names,
                values,
                on_duplicate,
            } => {
                let on_duplicate = match on_duplicate {
                    Some(assignments) => Some(
                        assignments
                            .iter()
                            .map(|(column, input)| Ok((column.clone(), input.value(row)?)))
                            .collect::<ExecResult<Vec<_>>>()?,
                    ),
                    None => None,
                };
                Ok(Ok(BulkOperation::Insert {
                    columns: names.clone(),
                    values: values.evaluate_owned(row)?,
                    on_duplicate,
                }))
            }
        }
    }
}

pub struct IndexWriterProjector {
    kind: &'static str,
    lifecycle: Lifecycle,
    downstream: Downstream,
    index_names: IndexNameResolver,
    addresses: DocAddressBuilder,
    payload: Payload,
    source_uri: Option<Box<dyn Input>>,
    result_mode: WriterResultMode,
    executor: ShardedBatchExecutor,
}

impl IndexWriterProjector {
    pub fn for_source(
        projection: &SourceIndexWriterProjection,
        services: ClusterServices,
        settings: &ExecutionSettings,
        job_id: Uuid,
    ) -> ExecResult<Self> {
        let target = &projection.target;
        let config = BulkConfig::from_settings(settings, projection.bulk_actions)?
            .with_auto_create_indices(target.auto_create_indices)
            .with_options(BulkOptions {
                overwrite_duplicates: projection.overwrite_duplicates,
                ignore_duplicate_keys: false,
            });
        Ok(Self {
            kind: "source_index_writer",
            lifecycle: Lifecycle::new("source_index_writer"),
            downstream: Downstream::default(),
            index_names: IndexNameResolver::compile(&target.table, &target.partitioned_by)?,
            addresses: DocAddressBuilder::compile(&target.primary_keys, target.clustered_by.as_ref())?,
            payload: Payload::Source {
                raw: InputFactory::compile(&projection.raw_source)?,
                includes: projection.includes.clone(),
                excludes: projection.excludes.clone(),
            },
            source_uri: projection
                .source_uri
                .as_ref()
                .map(InputFactory::compile)
                .transpose()?,
            result_mode: projection.result_mode,
            executor: ShardedBatchExecutor::new(services, config, job_id),
        })
    }

    pub fn for_columns(
        projection: &ColumnIndexWriterProjection,
        services: ClusterServices,
        settings: &ExecutionSettings,
        job_id: Uuid,
    ) -> ExecResult<Self> {
        if projection.columns.len() != projection.column_symbols.len() {
            return Err(ExecutionError::invalid_parameter(format!(
                "{} column names for {} column values",
                projection.columns.len(),
                projection.column_symbols.len()
            )));
        }
        let target = &projection.target;
        let config = BulkConfig::from_settings(settings, projection.bulk_actions)?
            .with_auto_create_indices(target.auto_create_indices)
            .with_options(BulkOptions {
                overwrite_duplicates: false,
                ignore_duplicate_keys: projection.ignore_duplicate_keys,
            });
        let on_duplicate = match &projection.on_duplicate_key {
            Some(assignments) => Some(
                assignments
                    .iter()
                    .map(|(column, symbol)| Ok((column.clone(), InputFactory::compile(symbol)?)))
                    .collect::<ExecResult<Vec<_>>>()?,
            ),
            None => None,
        };
        Ok(Self {
            kind: "column_index_writer",
            lifecycle: Lifecycle::new("column_index_writer"),
            downstream: Downstream::default(),
            index_names: IndexNameResolver::compile(&target.table, &target.partitioned_by)?,
            addresses: DocAddressBuilder::compile(&target.primary_keys, target.clustered_by.as_ref())?,
            payload: Payload::Columns {
                names: projection.columns.clone(),
                values: InputRow::compile(&projection.column_symbols)?,
                on_duplicate,
            },
            source_uri: None,
            result_mode: projection.result_mode,
            executor: ShardedBatchExecutor::new(services, config, job_id),
        })
    }

    async fn write_row(&mut self, row: &dyn Row) -> ExecResult<()> {
        let source_uri = match &self.source_uri {
            Some(input) => match input.value(row) {
                Ok(Value::Null) => None,
                Ok(value) => Some(value.to_string()),
                Err(e) => {
                    self.executor.reject(None, &e.into_item_failure()?);
                    return Ok(());
                }
            },
            None => None,
        };

        let item = match self.prepare_item(row) {
            Ok(item) => item,
            Err(e) => Err(e.into_item_failure()?),
        };
        let (address, operation, index) = match item {
            Ok(item) => item,
            Err(message) => {
                self.executor.reject(source_uri.as_deref(), &message);
                return Ok(());
            }
        };
        let Some(target) = self
            .executor
            .services()
            .routing
            .resolve(&index, address.routing_key())
        else {
            let message = format!("no shard found for index {}", index);
            self.executor.reject(source_uri.as_deref(), &message);
            return Ok(());
        };

        self.executor
            .add(
                target.shard,
                target.node,
                address.id,
                address.routing,
                operation,
                source_uri,
            )
            .await
    }

    /// Address, payload and target index of one row; `Ok(Err(message))`
    /// marks a malformed item
    fn prepare_item(
        &self,
        row: &dyn Row,
    ) -> ExecResult<Result<(DocAddress, BulkOperation, String), String>> {
        let address = match self.addresses.build(row)? {
            Ok(address) => address,
            Err(message) => return Ok(Err(message)),
        };
        let operation = match self.payload.operation(row)? {
            Ok(operation) => operation,
            Err(message) => return Ok(Err(message)),
        };
        let index = self.index_names.resolve(row)?;
        Ok(Ok((address, operation, index)))
    }
}

impl RowReceiver for IndexWriterProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            self.write_row(row).await?;
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            let summary = self.executor.finish().await?;
            self.downstream.push_all(summary.to_rows(self.result_mode)).await?;
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

impl Projector for IndexWriterProjector {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::local::LocalCluster;
    use crate::engine::RowCollector;
    use crate::expression::Symbol;
    use crate::projection::IndexTarget;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn target(table: &str) -> IndexTarget {
        IndexTarget {
            table: table.into(),
            primary_keys: vec![Symbol::input(0)],
            clustered_by: None,
            partitioned_by: vec![],
            auto_create_indices: false,
        }
    }

    fn column_projection(table: &str) -> ColumnIndexWriterProjection {
        ColumnIndexWriterProjection {
            target: target(table),
            columns: vec!["id".into(), "name".into()],
            column_symbols: vec![Symbol::input(0), Symbol::input(1)],
            on_duplicate_key: None,
            ignore_duplicate_keys: false,
            bulk_actions: None,
            result_mode: WriterResultMode::RowCount,
        }
    }

    async fn run(mut projector: IndexWriterProjector, rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
        let (collector, handle) = RowCollector::new();
        projector.set_downstream(Box::new(collector));
        for row in &rows {
            projector.take_row(row).await.unwrap();
        }
        projector.finish().await.unwrap();
        handle.result().await.unwrap()
    }

    #[tokio::test]
    async fn test_column_writer_counts_rows() {
        let cluster = Arc::new(LocalCluster::new(2, 4));
        cluster.create_index("users");
        let projector = IndexWriterProjector::for_columns(
            &column_projection("users"),
            ClusterServices::local(cluster.clone()),
            &ExecutionSettings::default(),
            Uuid::new_v4(),
        )
        .unwrap();

        let rows = (0..10)
            .map(|i| vec![Value::Long(i), Value::from(format!("u{}", i))])
            .collect();
        assert_eq!(run(projector, rows).await, vec![vec![Value::Long(10)]]);
        assert_eq!(cluster.document_count("users"), 10);
        let doc = cluster.document("users", "3").unwrap();
        assert_eq!(doc.fields.get("name"), Some(&Value::from("u3")));
    }

    #[tokio::test]
    async fn test_duplicate_key_fails_item_unless_ignored() {
        let cluster = Arc::new(LocalCluster::new(1, 1));
        cluster.create_index("users");
        let rows = vec![
            vec![Value::Long(1), Value::from("a")],
            vec![Value::Long(1), Value::from("b")],
        ];

        let projector = IndexWriterProjector::for_columns(
            &column_projection("users"),
            ClusterServices::local(cluster.clone()),
            &ExecutionSettings::default(),
            Uuid::new_v4(),
        )
        .unwrap();
        assert_eq!(run(projector, rows.clone()).await, vec![vec![Value::Long(1)]]);

        let mut projection = column_projection("users");
        projection.ignore_duplicate_keys = true;
        let projector = IndexWriterProjector::for_columns(
            &projection,
            ClusterServices::local(cluster.clone()),
            &ExecutionSettings::default(),
            Uuid::new_v4(),
        )
        .unwrap();
        assert_eq!(run(projector, rows).await, vec![vec![Value::Long(2)]]);
    }

    #[tokio::test]
    async fn test_upsert_applies_on_duplicate_assignments() {
        let cluster = Arc::new(LocalCluster::new(1, 1));
        cluster.create_index("users");
        let mut projection = column_projection("users");
        projection.on_duplicate_key = Some(BTreeMap::from([(
            "name".to_string(),
            Symbol::literal("updated"),
        )]));
        let projector = IndexWriterProjector::for_columns(
            &projection,
            ClusterServices::local(cluster.clone()),
            &ExecutionSettings::default(),
            Uuid::new_v4(),
        )
        .unwrap();
        let rows = vec![
            vec![Value::Long(1), Value::from("a")],
            vec![Value::Long(1), Value::from("b")],
        ];
        run(projector, rows).await;
        let doc = cluster.document("users", "1").unwrap();
        assert_eq!(doc.fields.get("name"), Some(&Value::from("updated")));
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_source_writer_filters_and_summarizes() {
        let cluster = Arc::new(LocalCluster::new(1, 1));
        let projection = SourceIndexWriterProjection {
            target: IndexTarget {
                auto_create_indices: true,
                ..target("logs")
            },
            raw_source: Symbol::input(1),
            includes: None,
            excludes: Some(vec!["secret".into()]),
            overwrite_duplicates: false,
            source_uri: Some(Symbol::input(2)),
            bulk_actions: Some(2),
            result_mode: WriterResultMode::ReturnSummary,
        };
        let projector = IndexWriterProjector::for_source(
            &projection,
            ClusterServices::local(cluster.clone()),
            &ExecutionSettings::default(),
            Uuid::new_v4(),
        )
        .unwrap();
        let rows = vec![
            vec![
                Value::Long(1),
                Value::from(r#"{"msg": "hi", "secret": "x"}"#),
                Value::from("file:///a.json"),
            ],
            vec![Value::Long(2), Value::from("not json"), Value::from("file:///a.json")],
            vec![Value::Null, Value::from("{}"), Value::from("file:///b.json")],
        ];
        let result = run(projector, rows).await;

        assert_eq!(result.len(), 2);
        assert_eq!(result[0][1], Value::from("file:///a.json"));
        assert_eq!(result[0][2], Value::Long(1));
        assert_eq!(result[0][3], Value::Long(1));
        assert_eq!(result[1][1], Value::from("file:///b.json"));
        assert_eq!(result[1][3], Value::Long(1));

        let doc = cluster.document("logs", "1").unwrap();
        assert!(doc.fields.contains_key("msg"));
        assert!(!doc.fields.contains_key("secret"));
    }

    #[tokio::test]
    async fn test_partitioned_rows_go_to_partition_indices() {
        let cluster = Arc::new(LocalCluster::new(1, 1));
        let mut projection = column_projection("events");
        projection.target.partitioned_by = vec![Symbol::input(1)];
        projection.target.auto_create_indices = true;
        let projector = IndexWriterProjector::for_columns(
            &projection,
            ClusterServices::local(cluster.clone()),
            &ExecutionSettings::default(),
            Uuid::new_v4(),
        )
        .unwrap();
        let rows = vec![
            vec![Value::Long(1), Value::from("eu")],
            vec![Value::Long(2), Value::from("us")],
            vec![Value::Long(3), Value::from("eu")],
        ];
        assert_eq!(run(projector, rows).await, vec![vec![Value::Long(3)]]);
        let names = cluster.index_names();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.starts_with(".partitioned.events.")));
    }

    #[tokio::test]
    async fn test_failed_column_evaluation_fails_only_that_item() {
        let cluster = Arc::new(LocalCluster::new(1, 1));
        cluster.create_index("users");
        let mut projection = column_projection("users");
        projection.column_symbols[1] = Symbol::function(
            crate::expression::ScalarFunction::Add,
            vec![Symbol::input(1), Symbol::literal(1i64)],
        );
        projection.result_mode = WriterResultMode::ReturnSummary;
        let projector = IndexWriterProjector::for_columns(
            &projection,
            ClusterServices::local(cluster.clone()),
            &ExecutionSettings::default(),
            Uuid::new_v4(),
        )
        .unwrap();
        let rows = vec![
            vec![Value::Long(1), Value::Long(5)],
            vec![Value::Long(2), Value::from("x")],
            vec![Value::Long(3), Value::Long(7)],
        ];
        let result = run(projector, rows).await;

        assert_eq!(result.len(), 1);
        assert_eq!(result[0][2], Value::Long(2));
        assert_eq!(result[0][3], Value::Long(1));
        assert_eq!(cluster.document_count("users"), 2);
        assert!(cluster.document("users", "2").is_none());
        assert_eq!(
            cluster.document("users", "3").unwrap().fields.get("name"),
            Some(&Value::Long(8))
        );
    }

    #[test]
    fn test_column_count_mismatch_rejected() {
        let cluster = Arc::new(LocalCluster::new(1, 1));
        let mut projection = column_projection("users");
        projection.column_symbols.pop();
        assert!(IndexWriterProjector::for_columns(
            &projection,
            ClusterServices::local(cluster),
            &ExecutionSettings::default(),
            Uuid::new_v4(),
        )
        .is_err());
    }
}
