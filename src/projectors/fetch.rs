//! Fetch-join
//!
//! Input rows carry a 64-bit fetch id (`reader_id << 32 | doc_id`). Rows are
//! buffered until `fetch_size` are pending, then one request per owning
//! node is issued; all requests of a batch run concurrently and rows are
//! emitted in response arrival order as `input columns ++ fetched columns`.
//!
//! A row whose document is missing from the response, whose reader is
//! unknown, whose request failed, or whose fetched values do not match the
//! requested columns is recorded in the job's failure log and not emitted.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use uuid::Uuid;

use crate::cluster::{FetchRequest, FetchTransport, NodeId};
use crate::data::{Row, Value};
use crate::engine::ram::StageMemory;
use crate::engine::{
    Downstream, ExecResult, ExecutionError, FailureLog, Lifecycle, Projector, RowFlow,
    RowReceiver,
};
use crate::observability::{log_event, Event, MetricsRegistry};

const STAGE: &str = "fetch";

/// Packs a reader id and a reader-local document id
pub fn fetch_id(reader_id: u32, doc_id: u32) -> u64 {
    ((reader_id as u64) << 32) | doc_id as u64
}

pub fn reader_id(fetch_id: u64) -> u32 {
    (fetch_id >> 32) as u32
}

struct PendingRow {
    cells: Vec<Value>,
    fetch_id: u64,
    size: usize,
}

/// Collaborators and identity of a fetch stage
pub struct FetchSources {
    pub transport: Arc<dyn FetchTransport>,
    pub job_id: Uuid,
    pub failures: Arc<FailureLog>,
    pub metrics: Arc<MetricsRegistry>,
}

pub struct FetchProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    fetch_id_column: usize,
    columns: Vec<String>,
    reader_nodes: HashMap<u32, NodeId>,
    fetch_size: usize,
    sources: FetchSources,
    memory: StageMemory,
    pending: Vec<(NodeId, PendingRow)>,
}

impl FetchProjector {
    pub fn new(
        fetch_id_column: usize,
        columns: Vec<String>,
        reader_nodes: HashMap<u32, NodeId>,
        fetch_size: usize,
        sources: FetchSources,
        memory: StageMemory,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(STAGE),
            downstream: Downstream::default(),
            fetch_id_column,
            columns,
            reader_nodes,
            fetch_size: fetch_size.max(1),
            sources,
            memory,
            pending: Vec::new(),
        }
    }

    fn read_fetch_id(&self, row: &dyn Row) -> ExecResult<Option<u64>> {
        if self.fetch_id_column >= row.num_columns() {
            return Err(ExecutionError::evaluation(format!(
                "fetch id column {} out of range for row of width {}",
                self.fetch_id_column,
                row.num_columns()
            )));
        }
        match row.get(self.fetch_id_column) {
            Value::Null => Ok(None),
            Value::Long(id) => Ok(Some(*id as u64)),
            other => Err(ExecutionError::evaluation(format!(
                "fetch id must be a long, got {}",
                other.type_name()
            ))),
        }
    }

    /// Fetches every pending row and pushes the joined rows downstream
    async fn flush(&mut self) -> ExecResult<RowFlow> {
        if self.pending.is_empty() {
            return Ok(RowFlow::Continue);
        }
        let mut by_node: HashMap<NodeId, Vec<PendingRow>> = HashMap::new();
        for (node, row) in self.pending.drain(..) {
            by_node.entry(node).or_default().push(row);
        }

        let mut in_flight = FuturesUnordered::new();
        for (node, rows) in by_node {
            let transport = self.sources.transport.clone();
            let request = FetchRequest {
                job_id: self.sources.job_id,
                columns: self.columns.clone(),
                fetch_ids: rows.iter().map(|r| r.fetch_id).collect(),
            };
            in_flight.push(async move {
                let result = transport.execute_fetch(&node, request).await;
                (node, rows, result)
            });
        }

        let mut flow = RowFlow::Continue;
        while let Some((node, rows, result)) = in_flight.next().await {
            self.sources.metrics.increment_fetch_requests();
            let mut fetched = match result {
                Ok(response) => response.rows,
                Err(error) => {
                    for row in &rows {
                        self.sources.failures.record(
                            STAGE,
                            format!("fetch id {} on node {}: {}", row.fetch_id, node, error),
                        );
                        self.memory.release(row.size);
                    }
                    continue;
                }
            };

            let mut missing = 0u64;
            for mut row in rows {
                self.memory.release(row.size);
                let Some(values) = fetched.remove(&row.fetch_id) else {
                    missing += 1;
                    self.sources.failures.record(
                        STAGE,
                        format!("document for fetch id {} missing on node {}", row.fetch_id, node),
                    );
                    continue;
                };
                if values.len() != self.columns.len() {
                    self.sources.failures.record(
                        STAGE,
                        format!(
                            "fetch id {} on node {} returned {} values for {} columns",
                            row.fetch_id,
                            node,
                            values.len(),
                            self.columns.len()
                        ),
                    );
                    continue;
                }
                if flow == RowFlow::Stop {
                    continue;
                }
                row.cells.extend(values);
                flow = self.downstream.push(&row.cells).await?;
            }
            if missing > 0 {
                self.sources.metrics.add_fetch_rows_missing(missing);
                log_event(
                    Event::FetchPartial,
                    &[
                        ("job_id", self.sources.job_id.to_string().as_str()),
                        ("missing", missing.to_string().as_str()),
                        ("node", node.as_str()),
                    ],
                );
            }
        }
        Ok(flow)
    }
}

impl RowReceiver for FetchProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            let Some(fetch_id) = self.read_fetch_id(row)? else {
                self.sources.failures.record(STAGE, "row without fetch id");
                return Ok(RowFlow::Continue);
            };
            let reader = reader_id(fetch_id);
            let Some(node) = self.reader_nodes.get(&reader).cloned() else {
                self.sources
                    .failures
                    .record(STAGE, format!("unknown reader {} for fetch id {}", reader, fetch_id));
                return Ok(RowFlow::Continue);
            };

            let cells = row.materialize();
            let size = cells.estimated_size();
            self.memory.charge(size)?;
            self.pending.push((node, PendingRow { cells, fetch_id, size }));

            if self.pending.len() >= self.fetch_size {
                return self.flush().await;
            }
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            self.flush().await?;
            self.downstream.finish().await
        }
        .boxed()
    }

    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()> {
        async move {
            if self.lifecycle.on_fail() {
                self.pending.clear();
                self.memory.release_all();
                self.downstream.fail(error).await;
            }
        }
        .boxed()
    }
}

impl Projector for FetchProjector {
    fn kind(&self) -> &'static str {
        STAGE
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::local::LocalCluster;
    use crate::engine::{RamAccountingContext, RowCollector};
    use std::collections::BTreeMap;

    fn projector(cluster: Arc<LocalCluster>, fetch_size: usize, failures: Arc<FailureLog>) -> FetchProjector {
        let reader_nodes = HashMap::from([(1, "node-0".to_string()), (2, "node-1".to_string())]);
        FetchProjector::new(
            0,
            vec!["name".into()],
            reader_nodes,
            fetch_size,
            FetchSources {
                transport: cluster,
                job_id: Uuid::new_v4(),
                failures,
                metrics: Arc::new(MetricsRegistry::new()),
            },
            StageMemory::new(RamAccountingContext::unlimited("test")),
        )
    }

    fn doc(name: &str) -> BTreeMap<String, Value> {
        BTreeMap::from([("name".to_string(), Value::from(name))])
    }

    #[test]
    fn test_fetch_id_packing() {
        let id = fetch_id(3, 17);
        assert_eq!(reader_id(id), 3);
        assert_eq!(id & 0xffff_ffff, 17);
    }

    #[tokio::test]
    async fn test_fetch_joins_columns_and_records_missing() {
        let cluster = Arc::new(LocalCluster::new(2, 1));
        cluster.add_fetch_document(fetch_id(1, 1), doc("a"));
        cluster.add_fetch_document(fetch_id(2, 1), doc("b"));
        let failures = Arc::new(FailureLog::new());
        let mut fetch = projector(cluster.clone(), 10, failures.clone());
        let (collector, handle) = RowCollector::new();
        fetch.set_downstream(Box::new(collector));

        for id in [fetch_id(1, 1), fetch_id(2, 1), fetch_id(1, 9), fetch_id(7, 1)] {
            fetch.take_row(&vec![Value::Long(id as i64)]).await.unwrap();
        }
        fetch.finish().await.unwrap();

        let mut rows = handle.result().await.unwrap();
        rows.sort_by(|a, b| a[1].total_cmp(&b[1]));
        assert_eq!(
            rows,
            vec![
                vec![Value::Long(fetch_id(1, 1) as i64), Value::from("a")],
                vec![Value::Long(fetch_id(2, 1) as i64), Value::from("b")],
            ]
        );
        // one unknown reader, one missing document
        assert_eq!(failures.len(), 2);
        assert_eq!(cluster.fetch_log().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_batches_by_fetch_size() {
        let cluster = Arc::new(LocalCluster::new(2, 1));
        for doc_id in 0..5 {
            cluster.add_fetch_document(fetch_id(1, doc_id), doc("x"));
        }
        let mut fetch = projector(cluster.clone(), 2, Arc::new(FailureLog::new()));
        let (collector, handle) = RowCollector::new();
        fetch.set_downstream(Box::new(collector));
        for doc_id in 0..5 {
            fetch
                .take_row(&vec![Value::Long(fetch_id(1, doc_id) as i64)])
                .await
                .unwrap();
        }
        fetch.finish().await.unwrap();
        assert_eq!(handle.result().await.unwrap().len(), 5);
        let sizes: Vec<usize> = cluster.fetch_log().iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_failed_node_is_recorded_per_row() {
        let cluster = Arc::new(LocalCluster::new(2, 1));
        cluster.add_fetch_document(fetch_id(1, 1), doc("a"));
        cluster.add_fetch_document(fetch_id(2, 1), doc("b"));
        cluster.fail_fetch_node("node-1");
        let failures = Arc::new(FailureLog::new());
        let mut fetch = projector(cluster, 10, failures.clone());
        let (collector, handle) = RowCollector::new();
        fetch.set_downstream(Box::new(collector));
        for id in [fetch_id(1, 1), fetch_id(2, 1)] {
            fetch.take_row(&vec![Value::Long(id as i64)]).await.unwrap();
        }
        fetch.finish().await.unwrap();
        assert_eq!(handle.result().await.unwrap().len(), 1);
        assert_eq!(failures.len(), 1);
    }

    /// Answers every id with a fixed row, whatever columns were asked for
    struct FixedWidthTransport {
        values: Vec<Value>,
    }

    impl FetchTransport for FixedWidthTransport {
        fn execute_fetch<'a>(
            &'a self,
            _node: &'a NodeId,
            request: FetchRequest,
        ) -> BoxFuture<'a, ExecResult<crate::cluster::FetchResponse>> {
            async move {
                Ok(crate::cluster::FetchResponse {
                    rows: request
                        .fetch_ids
                        .into_iter()
                        .map(|id| (id, self.values.clone()))
                        .collect(),
                })
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_wrong_width_response_is_a_row_failure() {
        let failures = Arc::new(FailureLog::new());
        let mut fetch = FetchProjector::new(
            0,
            vec!["name".into()],
            HashMap::from([(1, "node-0".to_string())]),
            10,
            FetchSources {
                transport: Arc::new(FixedWidthTransport {
                    values: vec![Value::from("a"), Value::from("extra")],
                }),
                job_id: Uuid::new_v4(),
                failures: failures.clone(),
                metrics: Arc::new(MetricsRegistry::new()),
            },
            StageMemory::new(RamAccountingContext::unlimited("test")),
        );
        let (collector, handle) = RowCollector::new();
        fetch.set_downstream(Box::new(collector));
        fetch
            .take_row(&vec![Value::Long(fetch_id(1, 1) as i64)])
            .await
            .unwrap();
        fetch.finish().await.unwrap();

        assert!(handle.result().await.unwrap().is_empty());
        assert_eq!(failures.len(), 1);
        assert!(failures.failures()[0].message.contains("2 values for 1 columns"));
    }

    #[tokio::test]
    async fn test_fail_releases_buffered_rows() {
        let cluster = Arc::new(LocalCluster::new(2, 1));
        let ram = RamAccountingContext::unlimited("fetch");
        let mut fetch = FetchProjector::new(
            0,
            vec!["name".into()],
            HashMap::from([(1, "node-0".to_string())]),
            100,
            FetchSources {
                transport: cluster.clone(),
                job_id: Uuid::new_v4(),
                failures: Arc::new(FailureLog::new()),
                metrics: Arc::new(MetricsRegistry::new()),
            },
            StageMemory::new(ram.clone()),
        );
        let (collector, handle) = RowCollector::new();
        fetch.set_downstream(Box::new(collector));
        for doc_id in 0..3 {
            fetch
                .take_row(&vec![Value::Long(fetch_id(1, doc_id) as i64)])
                .await
                .unwrap();
        }
        assert!(ram.used() > 0);

        fetch.fail(ExecutionError::Cancelled).await;
        assert_eq!(ram.used(), 0);
        assert_eq!(handle.result().await, Err(ExecutionError::Cancelled));
        assert!(cluster.fetch_log().is_empty());
    }
}
