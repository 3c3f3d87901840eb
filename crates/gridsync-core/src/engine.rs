//! GridNode - the peer coordination engine
//!
//! A node joins the rendezvous topic of its namespace, registers every peer
//! connection in the [`SocketPool`], exchanges identities, replicates the
//! file master's payload, and answers remote task triggers.
//!
//! ## Lifecycle
//!
//! ```text
//! start()
//!   ├── resolve addresses ───────────┐
//!   ├── start discovery ── Listening ─┼──▶ ReadinessBarrier ──▶ Ready ──▶ health loop
//!   └── start local API ─────────────┘
//!
//! connection ──▶ pool.add ──▶ send identity ──▶ reader (one per connection, FIFO)
//!                                                 ├── identity   → schedule offer (master)
//!                                                 ├── sync       → persist, init tasks, broadcast sync:done
//!                                                 ├── sync:done  → mark synced on fingerprint match
//!                                                 ├── trigger    → executor, reply
//!                                                 └── clear      → discard payload
//! ```
//!
//! # Example
//!
//! ```ignore
//! use gridsync_core::{Collaborators, GridConfig, GridNode, MemoryNetwork};
//!
//! let network = MemoryNetwork::new();
//! let config = GridConfig::new("render-farm").with_test_mode(true);
//! let collab = Collaborators::defaults(&config, Arc::new(network.discovery()))?;
//! let node = GridNode::new(config, collab)?;
//! node.start().await?;
//! node.wait_ready().await;
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::barrier::{ReadinessBarrier, Signal};
use crate::collab::{Collaborators, StatusProvider};
use crate::config::GridConfig;
use crate::error::{GridError, GridResult};
use crate::events::{GridEvent, PeerSummary};
use crate::healing::{spawn_health_loop, HealthMonitor, WatchedNode};
use crate::identity::NodeIdentity;
use crate::namespace::NamespaceKey;
use crate::pool::{BroadcastReport, SocketPool};
use crate::protocol::{PeerMessage, SyncOffer, TriggerRequest};
use crate::router::{ConnectionId, PeerRouter};
use crate::transport::{DiscoveryEvent, PeerConnection};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared state behind every [`GridNode`] handle
struct NodeInner {
    config: GridConfig,
    key: NamespaceKey,
    identity: RwLock<NodeIdentity>,
    started_at: Instant,
    pool: SocketPool,
    barrier: ReadinessBarrier,
    collab: Collaborators,
    health: Arc<HealthMonitor>,
    event_tx: broadcast::Sender<GridEvent>,
    /// Cancelled on shutdown; parent of every session token
    shutdown: CancellationToken,
    /// Token of the running discovery session
    session: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
}

/// Handle to a grid node; cheap to clone
#[derive(Clone)]
pub struct GridNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for GridNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridNode")
            .field("name", &self.inner.config.name)
            .field("namespace", &self.inner.key)
            .field("peers", &self.inner.pool.len())
            .field("ready", &self.inner.barrier.is_ready())
            .finish()
    }
}

impl GridNode {
    /// Create a node; nothing touches the network until [`start`](Self::start)
    ///
    /// # Errors
    ///
    /// Returns `GridError::Config` if the configuration is unusable.
    pub fn new(config: GridConfig, collab: Collaborators) -> GridResult<Self> {
        config.validate()?;
        let key = NamespaceKey::derive(&config.namespace);
        let identity = NodeIdentity::from_config(&config);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(name = %config.name, namespace = %config.namespace, key = %key, "Initializing GridNode");

        collab.tasks.set_task_meta(crate::protocol::TaskMeta {
            instance_count: config.tasks.instances,
            json_conf: config.tasks.json_conf.clone(),
            task_folder: config.tasks.task_folder.clone(),
            env: config.tasks.env.clone(),
            base_folder: config.files.dest_folder.clone(),
        });

        Ok(Self {
            inner: Arc::new(NodeInner {
                pool: SocketPool::new(config.timing.send_timeout),
                config,
                key,
                identity: RwLock::new(identity),
                started_at: Instant::now(),
                barrier: ReadinessBarrier::new(),
                collab,
                health: Arc::new(HealthMonitor::default()),
                event_tx,
                shutdown: CancellationToken::new(),
                session: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Kick off address resolution, discovery and the local API
    ///
    /// Returns once discovery was asked to start; readiness arrives later
    /// through [`wait_ready`](Self::wait_ready) or [`GridEvent::Ready`].
    pub async fn start(&self) -> GridResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(GridError::InvalidOperation("node already started".to_string()));
        }
        let inner = &self.inner;
        info!(name = %inner.config.name, "Starting node");

        let this = self.clone();
        tokio::spawn(async move {
            match this.inner.collab.resolver.resolve().await {
                Ok(addrs) => {
                    {
                        let mut identity = this.inner.identity.write();
                        identity.public_ip = Some(addrs.public_ip);
                        identity.private_ip = Some(addrs.private_ip);
                    }
                    this.signal(Signal::Ip);
                }
                Err(e) => error!(error = %e, "Address resolution failed"),
            }
        });

        let this = self.clone();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            match this.inner.collab.api.start(status_provider(weak)).await {
                Ok(()) => this.signal(Signal::Api),
                Err(e) => error!(error = %e, "Local API failed to start"),
            }
        });

        if let Err(e) = self.start_discovery().await {
            // The barrier stays open; the operator sees a node that never gets ready
            error!(error = %e, "Discovery failed to start");
        }
        Ok(())
    }

    /// Resolve once the readiness barrier fired
    pub async fn wait_ready(&self) {
        self.inner.barrier.wait().await
    }

    /// Whether the readiness barrier fired
    pub fn is_ready(&self) -> bool {
        self.inner.barrier.is_ready()
    }

    /// Stop discovery, close every connection, the API and running tasks
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(name = %self.inner.config.name, "Shutting down node");
        self.inner.shutdown.cancel();
        self.stop_discovery().await;
        self.inner.collab.api.close().await;
        self.inner.collab.tasks.terminate().await;
    }

    /// Subscribe to node events
    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.inner.event_tx.subscribe()
    }

    /// This node's identity as it would be sent now
    pub fn identity(&self) -> NodeIdentity {
        let mut identity = self.inner.identity.read().clone();
        identity.uptime = self.inner.started_at.elapsed().as_secs();
        identity
    }

    /// Rendezvous key derived from the namespace
    pub fn namespace_key(&self) -> NamespaceKey {
        self.inner.key
    }

    /// Snapshot of every peer connection
    pub fn peers(&self) -> Vec<PeerSummary> {
        self.inner
            .pool
            .routers()
            .iter()
            .map(|router| PeerSummary {
                connection: router.id(),
                name: router.remote_name(),
                state: router.state(),
            })
            .collect()
    }

    /// Router of a live connection
    pub fn router(&self, connection: ConnectionId) -> Option<Arc<PeerRouter>> {
        self.inner.pool.get(connection)
    }

    /// Router of the first identified peer with the given name
    pub fn router_by_name(&self, name: &str) -> Option<Arc<PeerRouter>> {
        self.inner.pool.find_by_name(name)
    }

    /// Number of discovery restarts issued by the health check
    pub fn discovery_restarts(&self) -> u64 {
        self.inner.health.restarts()
    }

    fn emit(&self, event: GridEvent) {
        // No subscribers is fine
        let _ = self.inner.event_tx.send(event);
    }

    fn signal(&self, signal: Signal) {
        if !self.inner.barrier.signal(signal) {
            return;
        }
        info!(name = %self.inner.config.name, "Node ready");
        self.emit(GridEvent::Ready);
        spawn_health_loop(
            Arc::new(WeakNode(Arc::downgrade(&self.inner))),
            self.inner.health.clone(),
            self.inner.config.timing.health_check_period,
            self.inner.shutdown.child_token(),
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Discovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Join the rendezvous topic and start accepting peer connections
    ///
    /// A running session is replaced. The transport reports `Listening` or an
    /// error exactly once per session.
    pub async fn start_discovery(&self) -> GridResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(GridError::InvalidOperation("node is shut down".to_string()));
        }
        let session = self.inner.shutdown.child_token();
        if let Some(previous) = self.inner.session.lock().replace(session.clone()) {
            previous.cancel();
        }

        let mut events = match self.inner.collab.discovery.start(self.inner.key).await {
            Ok(events) => events,
            Err(e) => {
                self.emit(GridEvent::DiscoveryFailed { error: e.to_string() });
                return Err(e);
            }
        };
        info!(namespace = %self.inner.key, "Discovery started");

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = session.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(DiscoveryEvent::Listening) => {
                        info!("Discovery listening");
                        this.signal(Signal::Discovery);
                    }
                    Some(DiscoveryEvent::Error(e)) => {
                        warn!(error = %e, "Discovery transport error");
                        this.emit(GridEvent::DiscoveryFailed { error: e });
                    }
                    Some(DiscoveryEvent::Connection(conn)) => this.accept_connection(conn),
                    None => break,
                }
            }
            debug!("Discovery session ended");
        });
        Ok(())
    }

    /// Leave the rendezvous topic and close every peer connection
    ///
    /// Safe to call when discovery never started.
    pub async fn stop_discovery(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.cancel();
        }
        self.inner.collab.discovery.stop().await;
        self.inner.pool.close().await;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Connections
    // ═══════════════════════════════════════════════════════════════════════

    fn accept_connection(&self, conn: PeerConnection) {
        let PeerConnection { link, mut inbound } = conn;
        let router = self.inner.pool.add(link);
        self.emit(GridEvent::PeerConnected { connection: router.id() });

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = router.send(PeerMessage::Identity(this.identity())).await {
                warn!(connection = router.id(), error = %e, "Failed to send identity");
            }

            let lifetime = router.lifetime();
            loop {
                let frame = tokio::select! {
                    _ = lifetime.cancelled() => break,
                    _ = router.link().closed() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let (message, attachment) = frame.into_parts();
                this.dispatch(&router, message, attachment).await;
            }

            this.inner.pool.remove(router.id());
            router.link().close().await;
            info!(connection = router.id(), peer = ?router.remote_name(), "Peer disconnected");
            this.emit(GridEvent::PeerDisconnected { connection: router.id() });
        });
    }

    async fn dispatch(&self, router: &Arc<PeerRouter>, message: PeerMessage, attachment: Option<Bytes>) {
        debug!(connection = router.id(), message = message.name(), "Received");
        match message {
            PeerMessage::Identity(identity) => self.on_identity(router, identity),
            PeerMessage::Clear => self.on_clear().await,
            PeerMessage::Trigger {
                request_id,
                task_id,
                task_data,
                task_opts,
            } => {
                // Task runs may be long; keep reading this connection meanwhile
                let this = self.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    this.on_trigger(&router, request_id, task_id, &task_data, &task_opts)
                        .await
                });
            }
            PeerMessage::TriggerReply {
                request_id,
                error,
                result,
            } => on_trigger_reply(router, request_id, error, result),
            PeerMessage::Sync(offer) => self.on_sync(router, offer, attachment).await,
            PeerMessage::SyncDone { fingerprint } => self.on_sync_done(router, fingerprint),
        }
    }

    fn on_identity(&self, router: &Arc<PeerRouter>, identity: NodeIdentity) {
        let first = !router.is_identified();
        let name = identity.name.clone();
        info!(connection = router.id(), peer = %identity, "Peer identified");
        router.set_remote_identity(identity);
        self.emit(GridEvent::PeerIdentified {
            connection: router.id(),
            name,
        });

        let payload = &self.inner.collab.payload;
        if first && payload.is_file_master() && payload.has_file_to_sync() {
            self.schedule_offer(router.clone());
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Synchronization
    // ═══════════════════════════════════════════════════════════════════════

    /// Offer the payload to `router` after the propagation delay
    ///
    /// The offer is dropped if the router leaves the pool first.
    fn schedule_offer(&self, router: Arc<PeerRouter>) {
        let delay = self.inner.config.timing.propagation_delay;
        let lifetime = router.lifetime();
        let this = self.clone();
        debug!(connection = router.id(), delay_ms = delay.as_millis() as u64, "Sync offer scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {
                    debug!(connection = router.id(), "Router gone, offer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = this.ask_peer_to_sync(&router).await {
                        warn!(connection = router.id(), error = %e, "Sync offer failed");
                    }
                }
            }
        });
    }

    /// Send the current payload and task metadata to one peer
    ///
    /// # Errors
    ///
    /// `GridError::InvalidOperation` if the peer is not identified yet or there
    /// is no payload; `GridError::Delivery` if the send fails.
    pub async fn ask_peer_to_sync(&self, router: &PeerRouter) -> GridResult<()> {
        if !router.is_identified() {
            return Err(GridError::InvalidOperation(format!(
                "connection {} has not sent its identity",
                router.id()
            )));
        }
        let payload = &self.inner.collab.payload;
        let (Some(fingerprint), Some(bytes)) = (payload.current_fingerprint(), payload.payload_bytes())
        else {
            return Err(GridError::InvalidOperation("no payload to offer".to_string()));
        };

        let identity = self.identity();
        let offer = SyncOffer {
            public_ip: identity.public_ip,
            private_ip: identity.private_ip,
            task_meta: self.inner.collab.tasks.task_meta(),
            fingerprint: fingerprint.clone(),
        };

        // Mark before sending: the ack may be handled before send returns
        router.mark_offered();
        if let Err(e) = router
            .send_with_attachment(PeerMessage::Sync(offer), bytes.clone())
            .await
        {
            router.reset_sync();
            return Err(e);
        }

        info!(connection = router.id(), peer = ?router.remote_name(), %fingerprint, size = bytes.len(), "Sync offered");
        self.emit(GridEvent::SyncOffered {
            connection: router.id(),
            fingerprint,
        });
        Ok(())
    }

    /// Reset every peer's sync state, then offer the payload to each of them
    ///
    /// Peers that have not sent their identity yet are reset but not offered
    /// to; their offer follows the identity exchange.
    pub async fn ask_all_peers_to_sync(&self) -> BroadcastReport {
        let routers = self.inner.pool.routers();
        for router in &routers {
            router.reset_sync();
        }

        let results = join_all(
            routers
                .iter()
                .filter(|r| r.is_identified())
                .map(|router| async move { (router, self.ask_peer_to_sync(router).await) }),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (router, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(connection = router.id(), error = %e, "Re-offer failed");
                }
            }
        }
        info!(offered = report.delivered, failed = report.failed, "Asked all peers to sync");
        report
    }

    /// Publish a new payload (file master only) and start a fresh replication wave
    pub async fn synchronize_from(&self, source: impl AsRef<Path>) -> GridResult<String> {
        let fingerprint = self.inner.collab.payload.publish(source.as_ref()).await?;
        self.ask_all_peers_to_sync().await;
        Ok(fingerprint)
    }

    async fn on_sync(&self, router: &PeerRouter, offer: SyncOffer, attachment: Option<Bytes>) {
        info!(
            connection = router.id(),
            from = ?router.remote_name(),
            fingerprint = %offer.fingerprint,
            size = attachment.as_ref().map(Bytes::len).unwrap_or(0),
            "Sync offer received"
        );

        let outcome = match self.inner.collab.payload.synchronize(&offer, attachment).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(fingerprint = %offer.fingerprint, error = %e, "Replication failed");
                self.emit(GridEvent::SyncFailed { error: e.to_string() });
                return;
            }
        };

        let mut meta = offer.task_meta;
        meta.base_folder = outcome.base_folder.clone();
        let tasks = &self.inner.collab.tasks;
        tasks.set_task_meta(meta.clone());
        if let Err(e) = tasks.init_task_group(&meta).await {
            error!(error = %e, "Task group initialisation failed");
            self.emit(GridEvent::SyncFailed { error: e.to_string() });
            return;
        }

        let fingerprint = self
            .inner
            .collab
            .payload
            .current_fingerprint()
            .unwrap_or(outcome.fingerprint);
        self.emit(GridEvent::SyncApplied {
            fingerprint: fingerprint.clone(),
        });
        self.inner
            .pool
            .broadcast(PeerMessage::SyncDone { fingerprint })
            .await;
    }

    fn on_sync_done(&self, router: &PeerRouter, fingerprint: String) {
        let current = self.inner.collab.payload.current_fingerprint();
        if current.as_deref() != Some(fingerprint.as_str()) {
            debug!(connection = router.id(), reported = %fingerprint, current = ?current, "Stale sync:done ignored");
            return;
        }
        router.mark_synced();
        info!(connection = router.id(), peer = ?router.remote_name(), %fingerprint, "Peer synchronized");
        self.emit(GridEvent::PeerSynchronized {
            connection: router.id(),
            fingerprint,
        });
    }

    async fn on_clear(&self) {
        info!("Clearing local payload");
        if let Err(e) = self.inner.collab.payload.clear().await {
            warn!(error = %e, "Failed to clear payload");
        }
        self.inner.collab.tasks.terminate().await;
        self.emit(GridEvent::Cleared);
    }

    /// Ask a peer to discard its payload
    pub async fn clear_peer(&self, connection: ConnectionId) -> GridResult<()> {
        self.live_router(connection)?.send(PeerMessage::Clear).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Task triggers
    // ═══════════════════════════════════════════════════════════════════════

    /// Run a task on a peer and wait for its result
    ///
    /// # Errors
    ///
    /// `GridError::Task` carries the remote executor's error verbatim;
    /// `GridError::Timeout` after `timing.request_timeout`;
    /// `GridError::ConnectionClosed` if the connection drops first.
    pub async fn trigger(&self, connection: ConnectionId, request: TriggerRequest) -> GridResult<Value> {
        let router = self.live_router(connection)?;
        self.trigger_on(&router, request).await
    }

    /// [`trigger`](Self::trigger) addressed by peer name
    pub async fn trigger_peer(&self, name: &str, request: TriggerRequest) -> GridResult<Value> {
        let router = self
            .inner
            .pool
            .find_by_name(name)
            .ok_or_else(|| GridError::InvalidOperation(format!("no peer named {}", name)))?;
        self.trigger_on(&router, request).await
    }

    async fn trigger_on(&self, router: &PeerRouter, request: TriggerRequest) -> GridResult<Value> {
        let (request_id, reply) = router.register_request();
        let message = match request.to_message(request_id) {
            Ok(message) => message,
            Err(e) => {
                router.abandon_request(request_id);
                return Err(e);
            }
        };
        debug!(connection = router.id(), request_id, task_id = %request.task_id, "Sending trigger");
        if let Err(e) = router.send(message).await {
            router.abandon_request(request_id);
            return Err(e);
        }

        let timeout = self.inner.config.timing.request_timeout;
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GridError::ConnectionClosed(router.label())),
            Err(_) => {
                router.abandon_request(request_id);
                Err(GridError::Timeout(format!(
                    "trigger {} on {} after {:?}",
                    request.task_id,
                    router.label(),
                    timeout
                )))
            }
        }
    }

    async fn on_trigger(
        &self,
        router: &PeerRouter,
        request_id: u64,
        task_id: String,
        task_data: &str,
        task_opts: &str,
    ) {
        let outcome = match TriggerRequest::from_wire(task_id, task_data, task_opts) {
            Ok(request) => {
                debug!(connection = router.id(), request_id, task_id = %request.task_id, "Running triggered task");
                self.inner.collab.tasks.trigger_task(request).await
            }
            Err(e) => Err(e),
        };

        let (error, result) = match outcome {
            Ok(value) => (None, Some(value.to_string())),
            Err(GridError::Task(message)) => (Some(message), None),
            Err(e) => (Some(e.to_string()), None),
        };
        if let Err(e) = router
            .send(PeerMessage::TriggerReply {
                request_id,
                error,
                result,
            })
            .await
        {
            warn!(connection = router.id(), request_id, error = %e, "Failed to send trigger reply");
        }
    }

    fn live_router(&self, connection: ConnectionId) -> GridResult<Arc<PeerRouter>> {
        self.inner
            .pool
            .get(connection)
            .ok_or_else(|| GridError::ConnectionClosed(format!("connection {}", connection)))
    }

    /// Status document served by the local API
    pub fn status(&self) -> Value {
        status_document(&self.inner)
    }
}

fn on_trigger_reply(router: &PeerRouter, request_id: u64, error: Option<String>, result: Option<String>) {
    let outcome = match (error, result) {
        (Some(error), _) => Err(GridError::Task(error)),
        (None, Some(text)) => serde_json::from_str(&text).map_err(GridError::from),
        (None, None) => Ok(Value::Null),
    };
    if !router.resolve_request(request_id, outcome) {
        debug!(connection = router.id(), request_id, "Reply for unknown or expired request");
    }
}

fn status_document(inner: &NodeInner) -> Value {
    let peers: Vec<Value> = inner
        .pool
        .routers()
        .iter()
        .map(|r| json!({ "name": r.remote_name(), "state": r.state().to_string() }))
        .collect();
    json!({
        "identity": &*inner.identity.read(),
        "peers": peers,
        "ready": inner.barrier.is_ready(),
    })
}

fn status_provider(inner: Weak<NodeInner>) -> StatusProvider {
    Arc::new(move || match inner.upgrade() {
        Some(inner) => status_document(&inner),
        None => json!({ "ready": false }),
    })
}

/// Health-check handle that does not keep the node alive
struct WeakNode(Weak<NodeInner>);

#[async_trait]
impl WatchedNode for WeakNode {
    fn peer_count(&self) -> Option<usize> {
        self.0.upgrade().map(|inner| inner.pool.len())
    }

    async fn restart_discovery(&self, attempt: u64) -> GridResult<()> {
        let Some(inner) = self.0.upgrade() else {
            return Err(GridError::InvalidOperation("node dropped".to_string()));
        };
        let node = GridNode { inner };
        info!(attempt, namespace = %node.inner.key, "Restarting discovery");
        node.stop_discovery().await;
        node.start_discovery().await?;
        node.emit(GridEvent::DiscoveryRestarted { attempt });
        Ok(())
    }
}
