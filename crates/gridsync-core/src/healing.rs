//! Self-healing re-discovery loop
//!
//! Once a node is ready it checks its peer count every period. A node with no
//! peers restarts discovery. A restart still in flight makes later ticks skip
//! rather than start a second one. The loop ends once the watched node is gone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GridResult;

/// What the loop needs from the node it watches
#[async_trait]
pub(crate) trait WatchedNode: Send + Sync + 'static {
    /// Number of live peer connections; `None` once the node has been dropped
    fn peer_count(&self) -> Option<usize>;

    /// Tear down the current discovery session and start a new one
    async fn restart_discovery(&self, attempt: u64) -> GridResult<()>;
}

/// Restart bookkeeping shared between the loop and in-flight restarts
#[derive(Debug, Default)]
pub(crate) struct HealthMonitor {
    in_flight: AtomicBool,
    restarts: AtomicU64,
}

impl HealthMonitor {
    /// Number of restarts started so far
    pub(crate) fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Acquire)
    }

    /// Claim the restart slot; `None` while another restart runs
    fn try_begin(self: &Arc<Self>) -> Option<RestartGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let attempt = self.restarts.fetch_add(1, Ordering::AcqRel) + 1;
        Some(RestartGuard {
            monitor: self.clone(),
            attempt,
        })
    }
}

/// Releases the restart slot when dropped
struct RestartGuard {
    monitor: Arc<HealthMonitor>,
    attempt: u64,
}

impl Drop for RestartGuard {
    fn drop(&mut self) {
        self.monitor.in_flight.store(false, Ordering::Release);
    }
}

/// Run the isolation check every `period` until `cancel` fires
pub(crate) fn spawn_health_loop<N: WatchedNode>(
    node: Arc<N>,
    monitor: Arc<HealthMonitor>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_ms = period.as_millis() as u64, "Health check started");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(peers) = node.peer_count() else {
                debug!("Node dropped");
                break;
            };
            if peers > 0 {
                debug!(peers, "Health check ok");
                continue;
            }

            let Some(guard) = monitor.try_begin() else {
                debug!("Isolated, restart already in flight");
                continue;
            };

            warn!(attempt = guard.attempt, "No peers connected, restarting discovery");
            let node = node.clone();
            let restart_cancel = cancel.clone();
            tokio::spawn(async move {
                let attempt = guard.attempt;
                tokio::select! {
                    _ = restart_cancel.cancelled() => {}
                    res = node.restart_discovery(attempt) => {
                        if let Err(e) = res {
                            warn!(attempt, error = %e, "Discovery restart failed");
                        }
                    }
                }
                drop(guard);
            });
        }
        debug!("Health check stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const PERIOD: Duration = Duration::from_secs(10);

    struct FakeNode {
        dropped: AtomicBool,
        peers: AtomicUsize,
        restart_takes: Duration,
        running: AtomicUsize,
        max_running: AtomicUsize,
        restarts: AtomicU64,
    }

    impl FakeNode {
        fn new(peers: usize, restart_takes: Duration) -> Arc<Self> {
            Arc::new(Self {
                dropped: AtomicBool::new(false),
                peers: AtomicUsize::new(peers),
                restart_takes,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                restarts: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl WatchedNode for FakeNode {
        fn peer_count(&self) -> Option<usize> {
            if self.dropped.load(Ordering::SeqCst) {
                return None;
            }
            Some(self.peers.load(Ordering::SeqCst))
        }

        async fn restart_discovery(&self, _attempt: u64) -> GridResult<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.restarts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.restart_takes).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_node_restarts_once_per_period() {
        let node = FakeNode::new(0, Duration::ZERO);
        let monitor = Arc::new(HealthMonitor::default());
        let cancel = CancellationToken::new();
        spawn_health_loop(node.clone(), monitor.clone(), PERIOD, cancel.clone());

        tokio::time::sleep(PERIOD / 2).await;
        assert_eq!(node.restarts.load(Ordering::SeqCst), 0, "no restart before a full period");

        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(node.restarts.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.restarts(), 3);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_node_never_restarts() {
        let node = FakeNode::new(1, Duration::ZERO);
        let monitor = Arc::new(HealthMonitor::default());
        let cancel = CancellationToken::new();
        spawn_health_loop(node.clone(), monitor.clone(), PERIOD, cancel.clone());

        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(node.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.restarts(), 0);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_restart_is_not_overlapped() {
        let node = FakeNode::new(0, PERIOD * 5 / 2);
        let monitor = Arc::new(HealthMonitor::default());
        let cancel = CancellationToken::new();
        spawn_health_loop(node.clone(), monitor.clone(), PERIOD, cancel.clone());

        // Restarts begin at 1p and 4p; ticks at 2p, 3p, 5p and 6p find one in flight
        tokio::time::sleep(PERIOD * 62 / 10).await;
        assert_eq!(node.restarts.load(Ordering::SeqCst), 2);
        assert_eq!(node.max_running.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop() {
        let node = FakeNode::new(0, Duration::ZERO);
        let monitor = Arc::new(HealthMonitor::default());
        let cancel = CancellationToken::new();
        let handle = spawn_health_loop(node.clone(), monitor, PERIOD, cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(node.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ends_when_node_dropped() {
        let node = FakeNode::new(0, Duration::ZERO);
        let monitor = Arc::new(HealthMonitor::default());
        let cancel = CancellationToken::new();
        let handle = spawn_health_loop(node.clone(), monitor.clone(), PERIOD, cancel.clone());

        tokio::time::sleep(PERIOD + PERIOD / 2).await;
        assert_eq!(node.restarts.load(Ordering::SeqCst), 1);

        node.dropped.store(true, Ordering::SeqCst);
        handle.await.unwrap();
        assert!(!cancel.is_cancelled());
        assert_eq!(monitor.restarts(), 1);
    }
}
