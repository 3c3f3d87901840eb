//! Socket pool: the set of live peer routers
//!
//! The pool is the single owner of every [`PeerRouter`]. Mutations take the
//! write lock; enumeration and broadcast work on a snapshot taken under the
//! read lock, so a connect or disconnect arriving mid-broadcast never
//! invalidates the iteration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::PeerMessage;
use crate::router::{ConnectionId, PeerRouter};
use crate::transport::PeerLink;

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Routers the message reached
    pub delivered: usize,
    /// Routers whose send failed
    pub failed: usize,
}

/// Ordered collection of peer routers
pub struct SocketPool {
    routers: RwLock<Vec<Arc<PeerRouter>>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl SocketPool {
    /// Create an empty pool; `send_timeout` bounds every per-router send
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            routers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    /// Register a connection and return its router
    ///
    /// Adding the same link twice returns the existing router.
    pub fn add(&self, link: Arc<dyn PeerLink>) -> Arc<PeerRouter> {
        let mut routers = self.routers.write();
        if let Some(existing) = routers.iter().find(|r| same_link(r.link(), &link)) {
            debug!(connection = existing.id(), "Link already registered");
            return existing.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let router = Arc::new(PeerRouter::new(id, link, self.send_timeout));
        routers.push(router.clone());
        info!(connection = id, link = %router.label(), peers = routers.len(), "Peer connected");
        router
    }

    /// Remove a router and retire it; returns it if it was present
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<PeerRouter>> {
        let removed = {
            let mut routers = self.routers.write();
            let pos = routers.iter().position(|r| r.id() == id)?;
            routers.remove(pos)
        };
        removed.retire();
        info!(connection = id, peers = self.len(), "Peer removed");
        Some(removed)
    }

    /// Look up a router by connection id
    pub fn get(&self, id: ConnectionId) -> Option<Arc<PeerRouter>> {
        self.routers.read().iter().find(|r| r.id() == id).cloned()
    }

    /// First identified router whose remote name matches
    pub fn find_by_name(&self, name: &str) -> Option<Arc<PeerRouter>> {
        self.routers
            .read()
            .iter()
            .find(|r| r.remote_name().as_deref() == Some(name))
            .cloned()
    }

    /// Snapshot of the live routers in insertion order
    pub fn routers(&self) -> Vec<Arc<PeerRouter>> {
        self.routers.read().clone()
    }

    /// Number of live routers
    pub fn len(&self) -> usize {
        self.routers.read().len()
    }

    /// Whether the pool has no routers
    pub fn is_empty(&self) -> bool {
        self.routers.read().is_empty()
    }

    /// Send a message to every router present at call time
    ///
    /// A failing router is logged and skipped; it does not stop delivery to
    /// the others.
    pub async fn broadcast(&self, message: PeerMessage) -> BroadcastReport {
        let snapshot = self.routers();
        let name = message.name();

        let results = join_all(snapshot.iter().map(|router| {
            let message = message.clone();
            async move { (router, router.send(message).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (router, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(connection = router.id(), link = %router.label(), message = name, error = %e, "Broadcast send failed");
                }
            }
        }
        debug!(message = name, delivered = report.delivered, failed = report.failed, "Broadcast complete");
        report
    }

    /// Close every connection and clear membership; idempotent
    pub async fn close(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.routers.write());
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Closing socket pool");
        join_all(drained.iter().map(|router| router.close())).await;
    }
}

fn same_link(a: &Arc<dyn PeerLink>, b: &Arc<dyn PeerLink>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::RecordingLink;

    fn pool() -> SocketPool {
        SocketPool::new(Duration::from_secs(1))
    }

    #[test]
    fn test_add_preserves_insertion_order() {
        let pool = pool();
        let a = pool.add(RecordingLink::new(false));
        let b = pool.add(RecordingLink::new(false));
        let c = pool.add(RecordingLink::new(false));

        let ids: Vec<_> = pool.routers().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), c.id()]);
    }

    #[test]
    fn test_same_link_is_not_added_twice() {
        let pool = pool();
        let link: Arc<dyn PeerLink> = RecordingLink::new(false);
        let first = pool.add(link.clone());
        let second = pool.add(link);

        assert_eq!(first.id(), second.id());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_remove_retires_router() {
        let pool = pool();
        let router = pool.add(RecordingLink::new(false));

        let removed = pool.remove(router.id()).unwrap();
        assert!(removed.is_closed());
        assert!(pool.is_empty());
        assert!(pool.remove(router.id()).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_broken_router() {
        let pool = pool();
        let first = RecordingLink::new(false);
        let broken = RecordingLink::new(true);
        let third = RecordingLink::new(false);
        pool.add(first.clone());
        pool.add(broken.clone());
        pool.add(third.clone());

        let report = pool.broadcast(PeerMessage::Clear).await;

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });
        assert_eq!(first.sent.lock().len(), 1);
        assert_eq!(third.sent.lock().len(), 1);
        assert!(broken.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_not_live() {
        let pool = pool();
        pool.add(RecordingLink::new(false));
        let snapshot = pool.routers();
        pool.add(RecordingLink::new(false));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = pool();
        let link = RecordingLink::new(false);
        let router = pool.add(link.clone());

        pool.close().await;
        pool.close().await;

        assert!(pool.is_empty());
        assert!(router.is_closed());
        assert!(link.closed.is_cancelled());
    }
}
