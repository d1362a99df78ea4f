//! Node-wide collaborators shared by all compiled stages

use std::sync::Arc;

use crate::cluster::local::LocalCluster;
use crate::cluster::{
    BulkTransport, FetchTransport, IndexAdmin, NodeId, NodeJobsCounter, ShardRouting, SysUpdaters,
};
use crate::indexing::IndexCreationTracker;
use crate::observability::MetricsRegistry;

/// Handles to routing, transports and shared node-level state
#[derive(Clone)]
pub struct ClusterServices {
    pub local_node: NodeId,
    pub routing: Arc<dyn ShardRouting>,
    pub bulk: Arc<dyn BulkTransport>,
    pub index_admin: Arc<dyn IndexAdmin>,
    pub fetch: Arc<dyn FetchTransport>,
    /// In-flight bulk requests per node, shared by every writing stage
    pub node_jobs: Arc<NodeJobsCounter>,
    pub index_creation: Arc<IndexCreationTracker>,
    pub sys_updaters: SysUpdaters,
    pub metrics: Arc<MetricsRegistry>,
}

impl ClusterServices {
    /// Services backed by an in-memory cluster, running as its first node
    pub fn local(cluster: Arc<LocalCluster>) -> Self {
        let local_node = cluster
            .nodes()
            .first()
            .cloned()
            .unwrap_or_else(|| "node-0".to_string());
        Self {
            local_node,
            routing: cluster.clone(),
            bulk: cluster.clone(),
            index_admin: cluster.clone(),
            fetch: cluster,
            node_jobs: Arc::new(NodeJobsCounter::new()),
            index_creation: Arc::new(IndexCreationTracker::new()),
            sys_updaters: SysUpdaters::new(),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_sys_updaters(mut self, sys_updaters: SysUpdaters) -> Self {
        self.sys_updaters = sys_updaters;
        self
    }
}
