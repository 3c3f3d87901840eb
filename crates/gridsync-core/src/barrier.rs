//! Readiness barrier
//!
//! Joins the three independent startup signals and fires a single "ready"
//! transition once all of them have arrived, in any order. Re-emitted signals
//! and signals arriving after the barrier fired are no-ops.

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

/// One-shot startup signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signal {
    /// Network address resolved
    Ip,
    /// Discovery listener bound and topic joined
    Discovery,
    /// Local API bound
    Api,
}

impl Signal {
    /// Every signal the barrier waits for
    pub const ALL: [Signal; 3] = [Signal::Ip, Signal::Discovery, Signal::Api];
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Ip => write!(f, "ip"),
            Signal::Discovery => write!(f, "discovery"),
            Signal::Api => write!(f, "api"),
        }
    }
}

struct BarrierState {
    received: BTreeSet<Signal>,
    fired: bool,
}

/// Write-once-per-signal join collapsing into a terminal ready state
pub struct ReadinessBarrier {
    state: Mutex<BarrierState>,
    ready_tx: watch::Sender<bool>,
}

impl Default for ReadinessBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessBarrier {
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(BarrierState {
                received: BTreeSet::new(),
                fired: false,
            }),
            ready_tx,
        }
    }

    /// Record a signal
    ///
    /// Returns `true` for exactly one call: the one that completed the set.
    pub fn signal(&self, signal: Signal) -> bool {
        let mut state = self.state.lock();
        if state.fired {
            debug!(%signal, "Signal after ready, ignoring");
            return false;
        }
        if !state.received.insert(signal) {
            debug!(%signal, "Signal re-emitted, ignoring");
            return false;
        }
        debug!(%signal, received = state.received.len(), "Readiness signal");

        if state.received.len() < Signal::ALL.len() {
            return false;
        }
        state.fired = true;
        drop(state);

        info!("All readiness signals received");
        self.ready_tx.send_replace(true);
        true
    }

    /// Whether the barrier has fired
    pub fn is_ready(&self) -> bool {
        self.state.lock().fired
    }

    /// Signals received so far
    pub fn received(&self) -> Vec<Signal> {
        self.state.lock().received.iter().copied().collect()
    }

    /// Signals still missing
    pub fn missing(&self) -> Vec<Signal> {
        let state = self.state.lock();
        Signal::ALL
            .iter()
            .copied()
            .filter(|s| !state.received.contains(s))
            .collect()
    }

    /// Resolve once the barrier fires; immediately if it already has
    pub async fn wait(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fires_once_in_any_order() {
        let orders = [
            [Signal::Ip, Signal::Discovery, Signal::Api],
            [Signal::Api, Signal::Ip, Signal::Discovery],
            [Signal::Discovery, Signal::Api, Signal::Ip],
        ];
        for order in orders {
            let barrier = ReadinessBarrier::new();
            let fired: Vec<bool> = order.iter().map(|s| barrier.signal(*s)).collect();
            assert_eq!(fired, vec![false, false, true], "order {:?}", order);
            assert!(barrier.is_ready());
        }
    }

    #[test]
    fn test_reemitted_signal_does_not_count_twice() {
        let barrier = ReadinessBarrier::new();
        assert!(!barrier.signal(Signal::Ip));
        assert!(!barrier.signal(Signal::Ip));
        assert!(!barrier.signal(Signal::Api));
        assert!(!barrier.is_ready());
        assert_eq!(barrier.missing(), vec![Signal::Discovery]);
    }

    #[test]
    fn test_signal_after_ready_is_noop() {
        let barrier = ReadinessBarrier::new();
        for signal in Signal::ALL {
            barrier.signal(signal);
        }
        assert!(!barrier.signal(Signal::Discovery));
        assert!(barrier.is_ready());
    }

    #[tokio::test]
    async fn test_wait_resolves_after_last_signal() {
        let barrier = Arc::new(ReadinessBarrier::new());
        let waiter = tokio::spawn({
            let barrier = barrier.clone();
            async move { barrier.wait().await }
        });

        barrier.signal(Signal::Api);
        barrier.signal(Signal::Ip);
        assert!(!waiter.is_finished());
        barrier.signal(Signal::Discovery);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_resolves_with_missing_signal() {
        let barrier = ReadinessBarrier::new();
        barrier.signal(Signal::Ip);
        barrier.signal(Signal::Api);

        let res = tokio::time::timeout(Duration::from_secs(60), barrier.wait()).await;
        assert!(res.is_err());
        assert_eq!(barrier.received(), vec![Signal::Ip, Signal::Api]);
    }
}
