//! Deduplicated index creation
//!
//! Any number of stages may discover the same missing index at once. The
//! first caller issues the create request; the others await its outcome.
//! A failed creation is not cached, so a later caller tries again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::cluster::IndexAdmin;
use crate::engine::ExecResult;
use crate::observability::{log_event, Event, MetricsRegistry};

#[derive(Debug, Default)]
pub struct IndexCreationTracker {
    created: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl IndexCreationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, name: &str) -> Arc<OnceCell<()>> {
        let mut created = match self.created.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        created
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Makes sure `name` exists, creating it at most once
    pub async fn ensure(
        &self,
        name: &str,
        admin: &dyn IndexAdmin,
        metrics: &MetricsRegistry,
    ) -> ExecResult<()> {
        let cell = self.cell(name);
        cell.get_or_try_init(|| async {
            admin.create_index_if_absent(name).await?;
            metrics.increment_indices_created();
            log_event(Event::IndexCreated, &[("index", name)]);
            Ok::<(), crate::engine::ExecutionError>(())
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::local::LocalCluster;
    use crate::cluster::ShardRouting;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_creation_is_deduplicated() {
        let cluster = Arc::new(LocalCluster::new(1, 1).with_latency(Duration::from_millis(20)));
        let tracker = Arc::new(IndexCreationTracker::new());
        let metrics = Arc::new(MetricsRegistry::new());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (cluster, tracker, metrics) = (cluster.clone(), tracker.clone(), metrics.clone());
            tasks.push(tokio::spawn(async move {
                tracker.ensure("t", cluster.as_ref(), &metrics).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(cluster.create_index_calls(), 1);
        assert_eq!(metrics.snapshot().indices_created, 1);
        assert!(cluster.index_exists("t"));
    }
}
