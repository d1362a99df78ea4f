//! Sharded Write Scenario Tests
//!
//! Batched writes and fetch-joins against the in-memory cluster:
//! - bulk request sizing
//! - per-shard failure isolation
//! - per-node admission limits
//! - shard-local update/delete
//! - fetch-join with missing documents
//! - file export

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use shardexec::cluster::local::{LocalCluster, LocalSysTable};
use shardexec::cluster::{ShardId, ShardRouting, SysUpdaters};
use shardexec::config::ExecutionSettings;
use shardexec::data::{ArrayBucket, Value};
use shardexec::engine::{
    execute, ClusterServices, ExecutionContext, ExecutionError, Projector, ProjectorFactory,
    RowCollector, RowReceiver,
};
use shardexec::expression::Symbol;
use shardexec::projection::{
    ColumnIndexWriterProjection, DeleteProjection, FetchProjection, IndexTarget, OutputFormat,
    Projection, ReaderLocation, SysAssignment, SysUpdateProjection, WriterProjection,
    WriterResultMode,
};
use shardexec::projectors::fetch_id;

// =============================================================================
// Test Utilities
// =============================================================================

fn settings(bulk_size: usize, max_per_node: usize) -> ExecutionSettings {
    ExecutionSettings {
        bulk_size,
        max_concurrent_requests_per_node: max_per_node,
        ..ExecutionSettings::default()
    }
}

fn factory(cluster: &Arc<LocalCluster>, settings: ExecutionSettings) -> ProjectorFactory {
    ProjectorFactory::new(ClusterServices::local(cluster.clone()), settings)
}

fn insert_into(table: &str) -> Projection {
    Projection::ColumnIndexWriter(ColumnIndexWriterProjection {
        target: IndexTarget {
            table: table.into(),
            primary_keys: vec![Symbol::input(0)],
            clustered_by: None,
            partitioned_by: vec![],
            auto_create_indices: false,
        },
        columns: vec!["id".into()],
        column_symbols: vec![Symbol::input(0)],
        on_duplicate_key: None,
        ignore_duplicate_keys: false,
        bulk_actions: None,
        result_mode: WriterResultMode::RowCount,
    })
}

fn id_rows(n: i64) -> ArrayBucket {
    ArrayBucket::from_cells((0..n).map(|i| vec![Value::Long(i)]).collect())
}

// =============================================================================
// Bulk sizing
// =============================================================================

/// 250 items with bulk size 100 go out as 100, 100, 50.
#[tokio::test]
async fn test_bulk_requests_split_at_bulk_size() {
    let cluster = Arc::new(LocalCluster::new(1, 1));
    cluster.create_index("t");
    let factory = factory(&cluster, settings(100, 5));

    let result = execute(&factory, &[insert_into("t")], &ExecutionContext::for_job(factory.settings()), &mut id_rows(250))
        .await
        .unwrap();

    assert_eq!(result, vec![vec![Value::Long(250)]]);
    let sizes: Vec<usize> = cluster.bulk_log().iter().map(|r| r.items).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    let metrics = factory.services().metrics.snapshot();
    assert_eq!(metrics.bulk_requests_dispatched, 3);
    assert_eq!(metrics.bulk_items_succeeded, 250);
}

// =============================================================================
// Failure isolation
// =============================================================================

/// A failing shard fails only its own items.
#[tokio::test]
async fn test_failed_shard_does_not_affect_other_shards() {
    let cluster = Arc::new(LocalCluster::new(2, 2));
    cluster.create_index("t");
    let broken = ShardId::new("t", 0);
    cluster.fail_shard(broken.clone());

    let on_broken = (0..40)
        .filter(|i| cluster.resolve("t", &i.to_string()).map(|t| t.shard) == Some(broken.clone()))
        .count() as i64;
    assert!(on_broken > 0 && on_broken < 40);

    let factory = factory(&cluster, settings(10, 5));
    let ctx = ExecutionContext::for_job(factory.settings());
    let result = execute(&factory, &[insert_into("t")], &ctx, &mut id_rows(40))
        .await
        .unwrap();

    assert_eq!(result, vec![vec![Value::Long(40 - on_broken)]]);
    assert_eq!(cluster.document_count("t") as i64, 40 - on_broken);
    let metrics = factory.services().metrics.snapshot();
    assert_eq!(metrics.bulk_items_failed as i64, on_broken);
    assert!(metrics.bulk_requests_failed >= 1);
}

/// Summary mode reports errors grouped by message.
#[tokio::test]
async fn test_return_summary_reports_errors() {
    let cluster = Arc::new(LocalCluster::new(1, 1));
    let factory = factory(&cluster, settings(100, 5));
    let mut projection = insert_into("missing");
    if let Projection::ColumnIndexWriter(p) = &mut projection {
        p.result_mode = WriterResultMode::ReturnSummary;
    }

    let result = execute(&factory, &[projection], &ExecutionContext::for_job(factory.settings()), &mut id_rows(3))
        .await
        .unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(result[0][0], Value::from("node-0"));
    assert_eq!(result[0][2], Value::Long(0));
    assert_eq!(result[0][3], Value::Long(3));
    assert_eq!(
        result[0][4],
        Value::Object(BTreeMap::from([(
            "index missing not found".to_string(),
            Value::Long(3)
        )]))
    );
}

// =============================================================================
// Admission control
// =============================================================================

/// Never more than `max_concurrent_requests_per_node` requests in flight
/// per node, even with many shards.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_node_in_flight_cap() {
    let cluster = Arc::new(LocalCluster::new(2, 8).with_latency(Duration::from_millis(10)));
    cluster.create_index("t");
    let factory = factory(&cluster, settings(2, 2));

    let result = execute(&factory, &[insert_into("t")], &ExecutionContext::for_job(factory.settings()), &mut id_rows(100))
        .await
        .unwrap();

    assert_eq!(result, vec![vec![Value::Long(100)]]);
    for node in cluster.nodes() {
        let peak = cluster.max_in_flight(node);
        assert!(peak >= 1 && peak <= 2, "node {} peaked at {}", node, peak);
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Failing a writer with a request in flight hands the error downstream,
/// drops queued items, and lets the dispatched request finish on its own.
#[tokio::test]
async fn test_fail_with_request_in_flight() {
    let cluster = Arc::new(LocalCluster::new(1, 1).with_latency(Duration::from_millis(50)));
    cluster.create_index("t");
    let factory = factory(&cluster, settings(2, 5));
    let ctx = ExecutionContext::for_job(factory.settings());
    let mut writer = factory.compile(&insert_into("t"), &ctx).unwrap();
    let (collector, handle) = RowCollector::new();
    writer.set_downstream(Box::new(collector));

    for i in 0..3i64 {
        writer.take_row(&vec![Value::Long(i)]).await.unwrap();
    }
    writer.fail(ExecutionError::Cancelled).await;
    assert_eq!(handle.result().await, Err(ExecutionError::Cancelled));

    tokio::time::sleep(Duration::from_millis(250)).await;
    let sizes: Vec<usize> = cluster.bulk_log().iter().map(|r| r.items).collect();
    assert_eq!(sizes, vec![2]);
    assert_eq!(cluster.document_count("t"), 2);
    assert!(cluster.document("t", "2").is_none());
}

// =============================================================================
// Shard-local DML
// =============================================================================

/// Delete on a shard removes the addressed documents.
#[tokio::test]
async fn test_delete_on_shard() {
    let cluster = Arc::new(LocalCluster::new(1, 1));
    cluster.create_index("t");
    let factory = factory(&cluster, settings(100, 5));
    execute(&factory, &[insert_into("t")], &ExecutionContext::for_job(factory.settings()), &mut id_rows(5))
        .await
        .unwrap();

    let ctx = ExecutionContext::for_job(factory.settings()).with_shard(ShardId::new("t", 0));
    let delete = Projection::Delete(DeleteProjection {
        uid: Symbol::input(0),
        bulk_actions: None,
    });
    let mut rows = ArrayBucket::from_cells(vec![vec![Value::from("1")], vec![Value::from("3")]]);
    let result = execute(&factory, &[delete], &ctx, &mut rows)
        .await
        .unwrap();

    assert_eq!(result, vec![vec![Value::Long(2)]]);
    assert_eq!(cluster.document_count("t"), 3);
    assert!(cluster.document("t", "1").is_none());
}

// =============================================================================
// Fetch-join
// =============================================================================

/// Missing documents are recorded and their rows skipped.
#[tokio::test]
async fn test_fetch_join_with_missing_document() {
    let cluster = Arc::new(LocalCluster::new(2, 1));
    cluster.add_fetch_document(
        fetch_id(1, 7),
        BTreeMap::from([("name".to_string(), Value::from("seven"))]),
    );
    cluster.add_fetch_document(
        fetch_id(2, 9),
        BTreeMap::from([("name".to_string(), Value::from("nine"))]),
    );
    let factory = factory(&cluster, ExecutionSettings::default());
    let ctx = ExecutionContext::for_job(factory.settings());

    let fetch = Projection::Fetch(FetchProjection {
        fetch_id: 0,
        columns: vec!["name".into()],
        readers: vec![
            ReaderLocation {
                reader_id: 1,
                node: "node-0".into(),
            },
            ReaderLocation {
                reader_id: 2,
                node: "node-1".into(),
            },
        ],
        fetch_size: Some(2),
    });
    let rows = vec![
        vec![Value::Long(fetch_id(1, 7) as i64)],
        vec![Value::Long(fetch_id(1, 8) as i64)],
        vec![Value::Long(fetch_id(2, 9) as i64)],
    ];
    let mut result = execute(&factory, &[fetch], &ctx, &mut ArrayBucket::from_cells(rows))
        .await
        .unwrap();
    result.sort_by(|a, b| a[1].total_cmp(&b[1]));

    assert_eq!(result.len(), 2);
    assert_eq!(result[0][1], Value::from("nine"));
    assert_eq!(result[1][1], Value::from("seven"));
    assert_eq!(ctx.failures.len(), 1);
    assert_eq!(factory.services().metrics.snapshot().fetch_rows_missing, 1);
}

// =============================================================================
// System tables and export
// =============================================================================

/// System-table updates count matched rows.
#[tokio::test]
async fn test_sys_update_counts_matched_rows() {
    let cluster = Arc::new(LocalCluster::new(1, 1));
    let table = LocalSysTable::new();
    table.insert_row("n1", BTreeMap::from([("active".to_string(), Value::Bool(false))]));
    let mut updaters = SysUpdaters::new();
    updaters.register("sys.nodes", table.clone());
    let factory = ProjectorFactory::new(
        ClusterServices::local(cluster).with_sys_updaters(updaters),
        ExecutionSettings::default(),
    );

    let update = Projection::SysUpdate(SysUpdateProjection {
        key: Symbol::input(0),
        assignments: vec![SysAssignment {
            relation: "sys.nodes".into(),
            column: "active".into(),
            value: Symbol::literal(true),
        }],
    });
    let mut rows = ArrayBucket::from_cells(vec![vec![Value::from("n1")], vec![Value::from("n2")]]);
    let result = execute(&factory, &[update], &ExecutionContext::for_job(factory.settings()), &mut rows)
        .await
        .unwrap();

    assert_eq!(result, vec![vec![Value::Long(1)]]);
    assert_eq!(table.row("n1").unwrap().get("active"), Some(&Value::Bool(true)));
}

/// Exported rows land one JSON object per line, in a file named after
/// the job inside the target directory.
#[tokio::test]
async fn test_export_to_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let cluster = Arc::new(LocalCluster::new(1, 1));
    let factory = factory(&cluster, ExecutionSettings::default());
    let ctx = ExecutionContext::for_job(factory.settings());
    let path = dir.path().join("export").join(format!("{}.json", ctx.job_id));

    let writer = Projection::Writer(WriterProjection {
        uri: format!("file://{}", dir.path().join("export").display()),
        compression: None,
        output_format: OutputFormat::JsonObject,
        inputs: vec![Symbol::input(0), Symbol::input(1)],
        output_names: vec!["id".into(), "name".into()],
        overwrites: BTreeMap::new(),
    });
    let mut rows = ArrayBucket::from_cells(vec![
        vec![Value::Long(1), Value::from("a")],
        vec![Value::Long(2), Value::from("b")],
    ]);
    let result = execute(&factory, &[writer], &ctx, &mut rows)
        .await
        .unwrap();

    assert_eq!(result, vec![vec![Value::Long(2)]]);
    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines[1], serde_json::json!({"id": 2, "name": "b"}));
}
