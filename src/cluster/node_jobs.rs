//! Per-node admission control
//!
//! Counts in-flight requests per node. Dispatchers acquire a permit before
//! sending a request and hold it until the response arrives; when a node
//! is at its limit the dispatcher suspends until a permit is returned.
//! The counter is shared by every writing stage on this node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::NodeId;
use crate::observability::{Event, Logger};

#[derive(Debug, Default)]
struct NodeSlot {
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    released: Notify,
}

impl NodeSlot {
    fn try_acquire(&self, limit: usize) -> bool {
        let acquired = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < limit {
                    Some(n + 1)
                } else {
                    None
                }
            });
        match acquired {
            Ok(previous) => {
                self.high_water.fetch_max(previous + 1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }
}

/// Shared in-flight request counter keyed by node
#[derive(Debug, Default)]
pub struct NodeJobsCounter {
    nodes: Mutex<HashMap<NodeId, Arc<NodeSlot>>>,
}

impl NodeJobsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, node: &NodeId) -> Arc<NodeSlot> {
        let mut nodes = match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        nodes.entry(node.clone()).or_default().clone()
    }

    /// Waits until `node` has fewer than `limit` requests in flight and
    /// takes one slot. The slot is returned when the permit drops.
    ///
    /// A limit of zero is treated as one so a dispatcher can never deadlock.
    pub async fn acquire(&self, node: &NodeId, limit: usize) -> NodePermit {
        let slot = self.slot(node);
        let limit = limit.max(1);
        let mut waited = false;
        loop {
            let released = slot.released.notified();
            tokio::pin!(released);
            // register before re-checking so a release in between is not lost
            released.as_mut().enable();

            if slot.try_acquire(limit) {
                return NodePermit { slot: slot.clone() };
            }
            if !waited {
                waited = true;
                Logger::trace(
                    Event::AdmissionWait.as_str(),
                    &[("limit", limit.to_string().as_str()), ("node", node.as_str())],
                );
            }
            released.await;
        }
    }

    /// Requests currently in flight to `node`
    pub fn in_flight(&self, node: &NodeId) -> usize {
        self.slot(node).in_flight.load(Ordering::Acquire)
    }

    /// Highest concurrent in-flight count ever observed for `node`
    pub fn high_water(&self, node: &NodeId) -> usize {
        self.slot(node).high_water.load(Ordering::Relaxed)
    }
}

/// One in-flight request slot
#[derive(Debug)]
pub struct NodePermit {
    slot: Arc<NodeSlot>,
}

impl Drop for NodePermit {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.slot.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let counter = NodeJobsCounter::new();
        let node = "n1".to_string();
        let a = counter.acquire(&node, 2).await;
        let _b = counter.acquire(&node, 2).await;
        assert_eq!(counter.in_flight(&node), 2);
        drop(a);
        assert_eq!(counter.in_flight(&node), 1);
        assert_eq!(counter.high_water(&node), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let counter = Arc::new(NodeJobsCounter::new());
        let node = "n1".to_string();
        let held = counter.acquire(&node, 1).await;

        let waiter = {
            let counter = counter.clone();
            let node = node.clone();
            tokio::spawn(async move {
                let _permit = counter.acquire(&node, 1).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(counter.in_flight(&node), 1);

        drop(held);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.in_flight(&node), 0);
        assert_eq!(counter.high_water(&node), 1);
    }

    /// Many concurrent waiters never push a node past its limit.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_contended_acquire_respects_limit() {
        let counter = Arc::new(NodeJobsCounter::new());
        let node = "n1".to_string();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let counter = counter.clone();
            let node = node.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = counter.acquire(&node, 3).await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }));
        }
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(counter.in_flight(&node), 0);
        assert!(counter.high_water(&node) <= 3);
    }

    #[tokio::test]
    async fn test_nodes_are_independent() {
        let counter = NodeJobsCounter::new();
        let _a = counter.acquire(&"n1".to_string(), 1).await;
        let _b = counter.acquire(&"n2".to_string(), 1).await;
        assert_eq!(counter.in_flight(&"n1".to_string()), 1);
        assert_eq!(counter.in_flight(&"n2".to_string()), 1);
    }
}
