//! Per-connection router
//!
//! A [`PeerRouter`] wraps one [`PeerLink`] and tracks what the engine knows
//! about the remote end: its identity once exchanged, where it stands in the
//! replication state machine, and the trigger calls awaiting a reply.
//!
//! ```text
//! Handshaking ──identity──▶ Connected ──offer──▶ SyncOffered ──sync:done(match)──▶ Synced
//!                              ▲                                                    │
//!                              └──────────────── reset (ask all peers) ─────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{GridError, GridResult};
use crate::identity::NodeIdentity;
use crate::protocol::{Frame, PeerMessage};
use crate::transport::PeerLink;

/// Identifier of a connection within one node's socket pool
pub type ConnectionId = u64;

/// Replication state of one peer, from this node's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSyncState {
    /// Connected, identity not yet received
    Handshaking,
    /// Identity exchanged
    Connected,
    /// A sync offer was sent and no matching `sync:done` arrived yet
    SyncOffered,
    /// The peer reported the current fingerprint
    Synced,
}

impl Default for PeerSyncState {
    fn default() -> Self {
        PeerSyncState::Handshaking
    }
}

impl fmt::Display for PeerSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerSyncState::Handshaking => write!(f, "Handshaking"),
            PeerSyncState::Connected => write!(f, "Connected"),
            PeerSyncState::SyncOffered => write!(f, "Sync offered"),
            PeerSyncState::Synced => write!(f, "Synced"),
        }
    }
}

type PendingReply = oneshot::Sender<GridResult<serde_json::Value>>;

/// One peer connection plus everything known about the remote
pub struct PeerRouter {
    id: ConnectionId,
    link: Arc<dyn PeerLink>,
    remote_identity: RwLock<Option<NodeIdentity>>,
    state: RwLock<PeerSyncState>,
    /// Cancelled when the router leaves the pool; scheduled work watches it
    lifetime: CancellationToken,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_request: AtomicU64,
    send_timeout: Duration,
}

impl fmt::Debug for PeerRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRouter")
            .field("id", &self.id)
            .field("link", &self.link.label())
            .field("remote", &self.remote_name())
            .field("state", &self.state())
            .finish()
    }
}

impl PeerRouter {
    /// Wrap a link; the router starts in [`PeerSyncState::Handshaking`]
    pub fn new(id: ConnectionId, link: Arc<dyn PeerLink>, send_timeout: Duration) -> Self {
        Self {
            id,
            link,
            remote_identity: RwLock::new(None),
            state: RwLock::new(PeerSyncState::Handshaking),
            lifetime: CancellationToken::new(),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            send_timeout,
        }
    }

    /// Connection id within the pool
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Transport description of the remote end
    pub fn label(&self) -> String {
        self.link.label()
    }

    pub(crate) fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// The remote's identity, once exchanged
    pub fn remote_identity(&self) -> Option<NodeIdentity> {
        self.remote_identity.read().clone()
    }

    /// The remote's display name, once exchanged
    pub fn remote_name(&self) -> Option<String> {
        self.remote_identity.read().as_ref().map(|i| i.name.clone())
    }

    /// Whether the identity exchange has completed
    pub fn is_identified(&self) -> bool {
        self.remote_identity.read().is_some()
    }

    /// Current replication state
    pub fn state(&self) -> PeerSyncState {
        *self.state.read()
    }

    /// Whether the remote reported the current fingerprint
    pub fn is_synchronized(&self) -> bool {
        self.state() == PeerSyncState::Synced
    }

    /// Record the remote identity; leaves `Handshaking` on first call
    pub fn set_remote_identity(&self, identity: NodeIdentity) {
        *self.remote_identity.write() = Some(identity);
        let mut state = self.state.write();
        if *state == PeerSyncState::Handshaking {
            *state = PeerSyncState::Connected;
        }
    }

    /// Record that a sync offer went out
    pub fn mark_offered(&self) {
        *self.state.write() = PeerSyncState::SyncOffered;
    }

    /// Record a matching `sync:done`
    pub fn mark_synced(&self) {
        *self.state.write() = PeerSyncState::Synced;
    }

    /// Drop any replication progress back to `Connected`
    pub fn reset_sync(&self) {
        let mut state = self.state.write();
        if matches!(*state, PeerSyncState::SyncOffered | PeerSyncState::Synced) {
            *state = PeerSyncState::Connected;
        }
    }

    /// Send a message without attachment
    pub async fn send(&self, message: PeerMessage) -> GridResult<()> {
        self.send_frame(Frame::new(message)).await
    }

    /// Send a message with a raw byte attachment
    pub async fn send_with_attachment(&self, message: PeerMessage, attachment: Bytes) -> GridResult<()> {
        self.send_frame(Frame::with_attachment(message, attachment)).await
    }

    async fn send_frame(&self, frame: Frame) -> GridResult<()> {
        if self.lifetime.is_cancelled() {
            return Err(GridError::Delivery(format!("{} is closed", self.label())));
        }
        match tokio::time::timeout(self.send_timeout, self.link.send(frame)).await {
            Ok(res) => res,
            Err(_) => Err(GridError::Delivery(format!(
                "send to {} timed out after {:?}",
                self.label(),
                self.send_timeout
            ))),
        }
    }

    /// Token cancelled when this router leaves the pool
    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    /// Whether the router has left the pool
    pub fn is_closed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Allocate a request id and the receiver its reply will resolve
    pub(crate) fn register_request(&self) -> (u64, oneshot::Receiver<GridResult<serde_json::Value>>) {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        (request_id, rx)
    }

    /// Resolve a pending request; false when nobody is waiting on it
    pub(crate) fn resolve_request(&self, request_id: u64, result: GridResult<serde_json::Value>) -> bool {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Forget a pending request (timed out on the caller's side)
    pub(crate) fn abandon_request(&self, request_id: u64) {
        self.pending.lock().remove(&request_id);
    }

    /// Number of trigger calls awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Detach from the pool: cancel scheduled work and fail pending calls
    pub(crate) fn retire(&self) {
        self.lifetime.cancel();
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            debug!(connection = self.id, count = pending.len(), "Failing pending requests");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(GridError::ConnectionClosed(self.label())));
        }
    }

    /// Retire and close the underlying connection
    pub async fn close(&self) {
        self.retire();
        self.link.close().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::config::GridConfig;

    /// Link that records frames and can be told to fail
    pub(crate) struct RecordingLink {
        pub sent: Mutex<Vec<Frame>>,
        pub fail: bool,
        pub closed: CancellationToken,
    }

    impl RecordingLink {
        pub(crate) fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail,
                closed: CancellationToken::new(),
            })
        }
    }

    #[async_trait]
    impl PeerLink for RecordingLink {
        async fn send(&self, frame: Frame) -> GridResult<()> {
            if self.fail {
                return Err(GridError::Delivery("broken link".to_string()));
            }
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn close(&self) {
            self.closed.cancel();
        }

        async fn closed(&self) {
            self.closed.cancelled().await
        }

        fn label(&self) -> String {
            "recording".to_string()
        }
    }

    /// Link whose sends never complete
    struct StalledLink;

    #[async_trait]
    impl PeerLink for StalledLink {
        async fn send(&self, _frame: Frame) -> GridResult<()> {
            std::future::pending().await
        }

        async fn close(&self) {}

        async fn closed(&self) {
            std::future::pending().await
        }

        fn label(&self) -> String {
            "stalled".to_string()
        }
    }

    fn identity(name: &str) -> NodeIdentity {
        NodeIdentity::from_config(&GridConfig::new("ns").with_name(name))
    }

    #[test]
    fn test_state_transitions() {
        let router = PeerRouter::new(1, RecordingLink::new(false), Duration::from_secs(1));
        assert_eq!(router.state(), PeerSyncState::Handshaking);
        assert!(!router.is_identified());

        router.set_remote_identity(identity("b"));
        assert_eq!(router.state(), PeerSyncState::Connected);
        assert_eq!(router.remote_name().as_deref(), Some("b"));

        router.mark_offered();
        router.mark_synced();
        assert!(router.is_synchronized());

        router.set_remote_identity(identity("b"));
        assert!(router.is_synchronized(), "re-sent identity must not reset sync state");

        router.reset_sync();
        assert_eq!(router.state(), PeerSyncState::Connected);
    }

    #[test]
    fn test_reset_keeps_handshaking() {
        let router = PeerRouter::new(1, RecordingLink::new(false), Duration::from_secs(1));
        router.reset_sync();
        assert_eq!(router.state(), PeerSyncState::Handshaking);
    }

    #[tokio::test]
    async fn test_send_records_frame() {
        let link = RecordingLink::new(false);
        let router = PeerRouter::new(1, link.clone(), Duration::from_secs(1));
        router.send(PeerMessage::Clear).await.unwrap();
        assert_eq!(link.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_is_delivery_error() {
        let router = PeerRouter::new(1, Arc::new(StalledLink), Duration::from_millis(50));
        let err = router.send(PeerMessage::Clear).await.unwrap_err();
        assert!(matches!(err, GridError::Delivery(_)));
    }

    #[tokio::test]
    async fn test_retire_fails_pending_requests() {
        let router = PeerRouter::new(1, RecordingLink::new(false), Duration::from_secs(1));
        let (_id, rx) = router.register_request();
        assert_eq!(router.pending_requests(), 1);

        router.retire();
        assert!(matches!(rx.await.unwrap(), Err(GridError::ConnectionClosed(_))));
        assert!(router.is_closed());
        assert!(router.send(PeerMessage::Clear).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_unknown_request_is_false() {
        let router = PeerRouter::new(1, RecordingLink::new(false), Duration::from_secs(1));
        assert!(!router.resolve_request(99, Ok(serde_json::Value::Null)));
    }
}
