//! In-memory single-process cluster
//!
//! Implements every collaborator trait against process-local maps. Used by
//! the CLI and by tests. Supports failure injection per shard and per
//! node, artificial latency, and records every request it served.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::{
    BulkOperation, BulkTransport, FetchRequest, FetchResponse, FetchTransport, IndexAdmin,
    ItemResult, NodeId, ShardBulkRequest, ShardBulkResponse, ShardId, ShardRouting, ShardTarget,
    SysRowUpdater,
};
use crate::data::Value;
use crate::engine::{ExecResult, ExecutionError};

/// Stored document
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub version: i64,
    pub fields: BTreeMap<String, Value>,
}

/// One served bulk request
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRecord {
    pub node: NodeId,
    pub shard: ShardId,
    pub items: usize,
}

#[derive(Debug, Default)]
struct ClusterState {
    indices: HashMap<String, HashMap<String, StoredDocument>>,
    failing_shards: HashSet<ShardId>,
    failing_fetch_nodes: HashSet<NodeId>,
    fetch_documents: HashMap<u64, BTreeMap<String, Value>>,
    bulk_log: Vec<BulkRecord>,
    fetch_log: Vec<(NodeId, usize)>,
    create_index_calls: usize,
    in_flight: HashMap<NodeId, usize>,
    max_in_flight: HashMap<NodeId, usize>,
}

/// In-memory cluster
#[derive(Debug)]
pub struct LocalCluster {
    nodes: Vec<NodeId>,
    shards_per_index: u32,
    latency: Option<Duration>,
    state: Mutex<ClusterState>,
}

impl LocalCluster {
    /// Cluster of `nodes` nodes named `node-0..` with `shards_per_index`
    /// primaries per index
    pub fn new(nodes: usize, shards_per_index: u32) -> Self {
        Self {
            nodes: (0..nodes.max(1)).map(|i| format!("node-{}", i)).collect(),
            shards_per_index: shards_per_index.max(1),
            latency: None,
            state: Mutex::new(ClusterState::default()),
        }
    }

    /// Every request sleeps `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn create_index(&self, name: &str) {
        self.state().indices.entry(name.to_string()).or_default();
    }

    /// Every bulk request addressed to `shard` fails as a whole
    pub fn fail_shard(&self, shard: ShardId) {
        self.state().failing_shards.insert(shard);
    }

    /// Every fetch request addressed to `node` fails as a whole
    pub fn fail_fetch_node(&self, node: &str) {
        self.state().failing_fetch_nodes.insert(node.to_string());
    }

    /// Registers a fetchable document under its fetch id
    pub fn add_fetch_document(&self, fetch_id: u64, fields: BTreeMap<String, Value>) {
        self.state().fetch_documents.insert(fetch_id, fields);
    }

    pub fn document(&self, index: &str, id: &str) -> Option<StoredDocument> {
        self.state().indices.get(index)?.get(id).cloned()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.state().indices.get(index).map_or(0, HashMap::len)
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().indices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bulk_log(&self) -> Vec<BulkRecord> {
        self.state().bulk_log.clone()
    }

    /// (node, number of ids) per served fetch request
    pub fn fetch_log(&self) -> Vec<(NodeId, usize)> {
        self.state().fetch_log.clone()
    }

    pub fn create_index_calls(&self) -> usize {
        self.state().create_index_calls
    }

    /// Highest number of requests this cluster served concurrently for `node`
    pub fn max_in_flight(&self, node: &str) -> usize {
        self.state().max_in_flight.get(node).copied().unwrap_or(0)
    }

    fn enter(&self, node: &NodeId) {
        let mut state = self.state();
        let current = {
            let n = state.in_flight.entry(node.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let max = state.max_in_flight.entry(node.clone()).or_insert(0);
        *max = (*max).max(current);
    }

    fn leave(&self, node: &NodeId) {
        if let Some(n) = self.state().in_flight.get_mut(node) {
            *n = n.saturating_sub(1);
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn apply_bulk(&self, node: &NodeId, request: ShardBulkRequest) -> ExecResult<ShardBulkResponse> {
        let mut state = self.state();
        state.bulk_log.push(BulkRecord {
            node: node.clone(),
            shard: request.shard.clone(),
            items: request.items.len(),
        });
        if state.failing_shards.contains(&request.shard) {
            return Err(ExecutionError::Transport(format!(
                "shard {} is unavailable",
                request.shard
            )));
        }
        let Some(index) = state.indices.get_mut(&request.shard.index) else {
            return Ok(ShardBulkResponse {
                items: request
                    .items
                    .iter()
                    .map(|item| ItemResult {
                        location: item.location,
                        error: Some(format!("index {} not found", request.shard.index)),
                    })
                    .collect(),
            });
        };

        let items = request
            .items
            .into_iter()
            .map(|item| {
                let error = apply_item(index, &item.id, item.operation, request.options).err();
                ItemResult {
                    location: item.location,
                    error,
                }
            })
            .collect();
        Ok(ShardBulkResponse { items })
    }
}

fn apply_item(
    index: &mut HashMap<String, StoredDocument>,
    id: &str,
    operation: BulkOperation,
    options: super::BulkOptions,
) -> Result<(), String> {
    match operation {
        BulkOperation::Index { source } => {
            let fields = match source {
                Value::Object(fields) => fields,
                other => return Err(format!("source must be an object, got {}", other.type_name())),
            };
            let version = match index.get(id) {
                Some(_) if !options.overwrite_duplicates => {
                    return Err(format!("document with id {} already exists", id))
                }
                Some(existing) => existing.version + 1,
                None => 1,
            };
            index.insert(id.to_string(), StoredDocument { version, fields });
        }
        BulkOperation::Insert {
            columns,
            values,
            on_duplicate,
        } => match (index.get_mut(id), on_duplicate) {
            (Some(existing), Some(assignments)) => {
                existing.fields.extend(assignments);
                existing.version += 1;
            }
            (Some(_), None) if options.ignore_duplicate_keys => {}
            (Some(_), None) => return Err(format!("document with id {} already exists", id)),
            (None, _) => {
                let fields = columns.into_iter().zip(values).collect();
                index.insert(id.to_string(), StoredDocument { version: 1, fields });
            }
        },
        BulkOperation::Update {
            assignments,
            required_version,
        } => {
            let existing = index
                .get_mut(id)
                .ok_or_else(|| format!("document with id {} is missing", id))?;
            if let Some(required) = required_version {
                if existing.version != required {
                    return Err(format!(
                        "version conflict for {}: current {}, required {}",
                        id, existing.version, required
                    ));
                }
            }
            existing.fields.extend(assignments);
            existing.version += 1;
        }
        BulkOperation::Delete => {
            index
                .remove(id)
                .ok_or_else(|| format!("document with id {} is missing", id))?;
        }
    }
    Ok(())
}

impl ShardRouting for LocalCluster {
    fn resolve(&self, index: &str, routing_key: &str) -> Option<ShardTarget> {
        let shard = ShardId::new(index, crc32fast::hash(routing_key.as_bytes()) % self.shards_per_index);
        let node = self.node_for_shard(&shard)?;
        Some(ShardTarget { shard, node })
    }

    fn node_for_shard(&self, shard: &ShardId) -> Option<NodeId> {
        self.nodes
            .get(shard.id as usize % self.nodes.len())
            .cloned()
    }

    fn index_exists(&self, index: &str) -> bool {
        self.state().indices.contains_key(index)
    }
}

impl BulkTransport for LocalCluster {
    fn execute_bulk<'a>(
        &'a self,
        node: &'a NodeId,
        request: ShardBulkRequest,
    ) -> BoxFuture<'a, ExecResult<ShardBulkResponse>> {
        async move {
            self.enter(node);
            self.simulate_latency().await;
            let result = self.apply_bulk(node, request);
            self.leave(node);
            result
        }
        .boxed()
    }
}

impl IndexAdmin for LocalCluster {
    fn create_index_if_absent<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecResult<()>> {
        async move {
            self.simulate_latency().await;
            let mut state = self.state();
            state.create_index_calls += 1;
            state.indices.entry(name.to_string()).or_default();
            Ok(())
        }
        .boxed()
    }
}

impl FetchTransport for LocalCluster {
    fn execute_fetch<'a>(
        &'a self,
        node: &'a NodeId,
        request: FetchRequest,
    ) -> BoxFuture<'a, ExecResult<FetchResponse>> {
        async move {
            self.enter(node);
            self.simulate_latency().await;
            let result = {
                let mut state = self.state();
                state.fetch_log.push((node.clone(), request.fetch_ids.len()));
                if state.failing_fetch_nodes.contains(node) {
                    Err(ExecutionError::Transport(format!("node {} is unavailable", node)))
                } else {
                    let rows = request
                        .fetch_ids
                        .iter()
                        .filter_map(|id| {
                            let doc = state.fetch_documents.get(id)?;
                            let values = request
                                .columns
                                .iter()
                                .map(|c| doc.get(c).cloned().unwrap_or(Value::Null))
                                .collect();
                            Some((*id, values))
                        })
                        .collect();
                    Ok(FetchResponse { rows })
                }
            };
            self.leave(node);
            result
        }
        .boxed()
    }
}

/// In-memory system table keyed by the display form of the key value
#[derive(Debug, Default)]
pub struct LocalSysTable {
    rows: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl LocalSysTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<String, BTreeMap<String, Value>>> {
        match self.rows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert_row(&self, key: impl Into<Value>, fields: BTreeMap<String, Value>) {
        self.rows().insert(key.into().to_string(), fields);
    }

    pub fn row(&self, key: impl Into<Value>) -> Option<BTreeMap<String, Value>> {
        self.rows().get(&key.into().to_string()).cloned()
    }
}

impl SysRowUpdater for LocalSysTable {
    fn update_row(&self, key: &Value, assignments: &[(String, Value)]) -> ExecResult<bool> {
        let mut rows = self.rows();
        match rows.get_mut(&key.to_string()) {
            Some(row) => {
                row.extend(assignments.iter().cloned());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{BulkItem, BulkOptions};
    use uuid::Uuid;

    fn insert(location: usize, id: &str) -> BulkItem {
        BulkItem {
            location,
            id: id.to_string(),
            routing: None,
            operation: BulkOperation::Insert {
                columns: vec!["x".into()],
                values: vec![Value::Long(location as i64)],
                on_duplicate: None,
            },
        }
    }

    fn request(shard: ShardId, items: Vec<BulkItem>) -> ShardBulkRequest {
        ShardBulkRequest {
            job_id: Uuid::new_v4(),
            shard,
            options: BulkOptions::default(),
            items,
        }
    }

    #[test]
    fn test_routing_is_stable() {
        let cluster = LocalCluster::new(3, 4);
        let a = cluster.resolve("t", "key-1").unwrap();
        let b = cluster.resolve("t", "key-1").unwrap();
        assert_eq!(a, b);
        assert!(a.shard.id < 4);
        assert_eq!(Some(a.node), cluster.node_for_shard(&a.shard));
    }

    #[tokio::test]
    async fn test_bulk_insert_and_duplicate() {
        let cluster = LocalCluster::new(1, 1);
        cluster.create_index("t");
        let node = "node-0".to_string();
        let shard = ShardId::new("t", 0);

        let response = cluster
            .execute_bulk(&node, request(shard.clone(), vec![insert(0, "a"), insert(1, "a")]))
            .await
            .unwrap();
        assert_eq!(response.items[0].error, None);
        assert!(response.items[1].error.is_some());
        assert_eq!(cluster.document_count("t"), 1);
        assert_eq!(cluster.bulk_log().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_index_fails_items() {
        let cluster = LocalCluster::new(1, 1);
        let node = "node-0".to_string();
        let response = cluster
            .execute_bulk(&node, request(ShardId::new("nope", 0), vec![insert(0, "a")]))
            .await
            .unwrap();
        assert!(response.items[0].error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_failing_shard() {
        let cluster = LocalCluster::new(1, 1);
        cluster.create_index("t");
        cluster.fail_shard(ShardId::new("t", 0));
        let node = "node-0".to_string();
        let result = cluster
            .execute_bulk(&node, request(ShardId::new("t", 0), vec![insert(0, "a")]))
            .await;
        assert!(matches!(result, Err(ExecutionError::Transport(_))));
    }

    #[tokio::test]
    async fn test_fetch_skips_unknown_ids() {
        let cluster = LocalCluster::new(1, 1);
        cluster.add_fetch_document(7, BTreeMap::from([("name".to_string(), Value::from("x"))]));
        let node = "node-0".to_string();
        let response = cluster
            .execute_fetch(
                &node,
                FetchRequest {
                    job_id: Uuid::new_v4(),
                    columns: vec!["name".into(), "other".into()],
                    fetch_ids: vec![7, 8],
                },
            )
            .await
            .unwrap();
        assert_eq!(response.rows.len(), 1);
        assert_eq!(response.rows[&7], vec![Value::from("x"), Value::Null]);
    }

    #[test]
    fn test_sys_table_update() {
        let table = LocalSysTable::new();
        table.insert_row(1i64, BTreeMap::new());
        assert!(table
            .update_row(&Value::Long(1), &[("enabled".into(), Value::Bool(true))])
            .unwrap());
        assert!(!table.update_row(&Value::Long(2), &[]).unwrap());
        assert_eq!(table.row(1i64).unwrap()["enabled"], Value::Bool(true));
    }
}
