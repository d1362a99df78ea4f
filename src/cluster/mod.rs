//! Cluster collaborators
//!
//! The execution core does not own routing, transport or index metadata.
//! It reaches them through the traits below, which a node wires to its
//! real services and tests wire to `local::LocalCluster`.
//!
//! Async methods return `BoxFuture` so the traits stay object safe.

pub mod local;
mod node_jobs;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::Value;
use crate::engine::ExecResult;

pub use node_jobs::{NodeJobsCounter, NodePermit};

/// Node identity
pub type NodeId = String;

/// Shard identity: index name plus shard number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }

    /// Parses `<index>:<id>`
    pub fn parse(s: &str) -> Option<Self> {
        let (index, id) = s.rsplit_once(':')?;
        if index.is_empty() {
            return None;
        }
        Some(Self::new(index, id.parse().ok()?))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

/// Resolved location of a write
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardTarget {
    pub shard: ShardId,
    pub node: NodeId,
}

// ==================
// Bulk requests
// ==================

/// Payload of one bulk item
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Full-document insert
    Index { source: Value },
    /// Column insert, optionally an upsert
    Insert {
        columns: Vec<String>,
        values: Vec<Value>,
        on_duplicate: Option<Vec<(String, Value)>>,
    },
    /// Partial update of an existing document
    Update {
        assignments: Vec<(String, Value)>,
        required_version: Option<i64>,
    },
    Delete,
}

/// One addressed item of a bulk request
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    /// Position of the item in the stage's item stream
    pub location: usize,
    pub id: String,
    pub routing: Option<String>,
    pub operation: BulkOperation,
}

/// Duplicate handling for inserts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkOptions {
    pub overwrite_duplicates: bool,
    pub ignore_duplicate_keys: bool,
}

/// Items for exactly one shard
#[derive(Debug, Clone, PartialEq)]
pub struct ShardBulkRequest {
    pub job_id: Uuid,
    pub shard: ShardId,
    pub options: BulkOptions,
    pub items: Vec<BulkItem>,
}

/// Outcome of one item; `error == None` means success
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub location: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShardBulkResponse {
    pub items: Vec<ItemResult>,
}

// ==================
// Fetch requests
// ==================

/// Batch of fetch ids addressed to one node
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub job_id: Uuid,
    pub columns: Vec<String>,
    pub fetch_ids: Vec<u64>,
}

/// Fetched column values by fetch id. Ids the node could not
/// resolve are absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchResponse {
    pub rows: HashMap<u64, Vec<Value>>,
}

// ==================
// Collaborator traits
// ==================

/// Shard routing and index metadata
pub trait ShardRouting: Send + Sync {
    /// Shard owning a document of `index` with the given routing key
    fn resolve(&self, index: &str, routing_key: &str) -> Option<ShardTarget>;

    /// Node holding the primary of `shard`
    fn node_for_shard(&self, shard: &ShardId) -> Option<NodeId>;

    fn index_exists(&self, index: &str) -> bool;
}

/// Transport to shards
pub trait BulkTransport: Send + Sync {
    fn execute_bulk<'a>(
        &'a self,
        node: &'a NodeId,
        request: ShardBulkRequest,
    ) -> BoxFuture<'a, ExecResult<ShardBulkResponse>>;
}

/// Index administration
pub trait IndexAdmin: Send + Sync {
    /// Creates `name`; creating an index that already exists is not an error
    fn create_index_if_absent<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecResult<()>>;
}

/// Transport for fetch-join requests
pub trait FetchTransport: Send + Sync {
    fn execute_fetch<'a>(
        &'a self,
        node: &'a NodeId,
        request: FetchRequest,
    ) -> BoxFuture<'a, ExecResult<FetchResponse>>;
}

/// Writes assignments into one row of an in-memory system table
pub trait SysRowUpdater: Send + Sync {
    /// Returns false when no row has the given key
    fn update_row(&self, key: &Value, assignments: &[(String, Value)]) -> ExecResult<bool>;
}

/// System-table updaters by relation name
#[derive(Default, Clone)]
pub struct SysUpdaters {
    updaters: HashMap<String, Arc<dyn SysRowUpdater>>,
}

impl SysUpdaters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, relation: impl Into<String>, updater: Arc<dyn SysRowUpdater>) {
        self.updaters.insert(relation.into(), updater);
    }

    pub fn get(&self, relation: &str) -> Option<Arc<dyn SysRowUpdater>> {
        self.updaters.get(relation).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_id_parse() {
        assert_eq!(ShardId::parse("users:3"), Some(ShardId::new("users", 3)));
        assert_eq!(ShardId::parse(".partitioned.t.x:0"), Some(ShardId::new(".partitioned.t.x", 0)));
        assert_eq!(ShardId::parse("users"), None);
        assert_eq!(ShardId::parse(":1"), None);
        assert_eq!(ShardId::parse("users:x"), None);
    }

    #[test]
    fn test_shard_id_display() {
        assert_eq!(ShardId::new("users", 2).to_string(), "[users][2]");
    }
}
