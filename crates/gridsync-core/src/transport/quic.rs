//! iroh-backed rendezvous transport
//!
//! Each discovery session binds a fresh iroh endpoint, joins the gossip topic
//! derived from the namespace, and opens one `/gridsync/peer/1` bi-stream per
//! neighbour. Frames are length-delimited on the stream.
//!
//! ## Connection Setup
//!
//! ```text
//! Node A (lower id)                     Node B
//!   |=== gossip topic join (NamespaceKey) ===|
//!   |        NeighborUp(B)                   |
//!   |--- connect(B, GRID_ALPN) ------------->|  GridProtocolHandler::accept
//!   |--- open_bi --------------------------->|  accept_bi
//!   |<========== framed PeerMessages =======>|
//! ```
//!
//! Only the endpoint with the lower id dials, so a pair shares one connection.
//! A neighbour that flaps in gossip is dialed again only after its previous
//! connection has closed.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointId, SecretKey};
use iroh_gossip::api::Event as GossipEvent;
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    Discovery, DiscoveryEvent, PeerConnection, PeerLink, DISCOVERY_CHANNEL_CAPACITY,
    INBOUND_CHANNEL_CAPACITY,
};
use crate::config::GridConfig;
use crate::error::{GridError, GridResult};
use crate::namespace::NamespaceKey;
use crate::protocol::Frame;

/// ALPN protocol identifier for grid peer connections
pub const GRID_ALPN: &[u8] = b"/gridsync/peer/1";

/// Largest frame accepted on a peer stream (the payload rides in one frame)
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Gossip only carries membership, so the default message size is plenty
const GOSSIP_MAX_MESSAGE_SIZE: usize = 4096;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Neighbours a session has dialed and not yet lost
#[derive(Debug, Default, Clone)]
struct DialSet(Arc<parking_lot::Mutex<HashSet<EndpointId>>>);

impl DialSet {
    /// Claim `peer`; `false` while a dial or connection to it is live
    fn claim(&self, peer: EndpointId) -> bool {
        self.0.lock().insert(peer)
    }

    fn release(&self, peer: EndpointId) {
        self.0.lock().remove(&peer);
    }
}

/// Running discovery session
struct IrohSession {
    router: Router,
    cancel: CancellationToken,
}

/// Discovery over iroh endpoints and iroh-gossip topics
pub struct IrohDiscovery {
    secret_key: SecretKey,
    bootstrap: Vec<EndpointId>,
    session: Mutex<Option<IrohSession>>,
}

impl std::fmt::Debug for IrohDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohDiscovery")
            .field("endpoint_id", &self.endpoint_id())
            .field("bootstrap", &self.bootstrap.len())
            .finish()
    }
}

impl IrohDiscovery {
    /// Create a discovery handle with a persistent identity
    pub fn new(secret_key: Option<SecretKey>, bootstrap: Vec<EndpointId>) -> Self {
        Self {
            secret_key: secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng())),
            bootstrap,
            session: Mutex::new(None),
        }
    }

    /// Create a discovery handle from the config's bootstrap list
    pub fn from_config(config: &GridConfig) -> GridResult<Self> {
        let bootstrap = config
            .bootstrap
            .iter()
            .map(|id| {
                id.trim()
                    .parse::<EndpointId>()
                    .map_err(|e| GridError::Config(format!("Invalid bootstrap peer {}: {}", id, e)))
            })
            .collect::<GridResult<Vec<_>>>()?;
        Ok(Self::new(None, bootstrap))
    }

    /// Id other peers use to reach this node
    pub fn endpoint_id(&self) -> EndpointId {
        self.secret_key.public()
    }

    async fn bind_session(
        &self,
        key: NamespaceKey,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> GridResult<IrohSession> {
        let endpoint = Endpoint::builder()
            .secret_key(self.secret_key.clone())
            .alpns(vec![GRID_ALPN.to_vec(), GOSSIP_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| GridError::Transport(format!("Failed to bind endpoint: {}", e)))?;
        info!(endpoint_id = %endpoint.id(), "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(GOSSIP_MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let router = Router::builder(endpoint.clone())
            .accept(GRID_ALPN, GridProtocolHandler::new(events.clone()))
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        let topic = match gossip.subscribe(key.topic_id(), self.bootstrap.clone()).await {
            Ok(topic) => topic,
            Err(e) => {
                if let Err(e) = router.shutdown().await {
                    debug!(error = ?e, "Router shutdown after failed subscribe");
                }
                return Err(GridError::Transport(format!(
                    "Failed to join rendezvous topic: {}",
                    e
                )));
            }
        };
        info!(namespace = %key, bootstrap = self.bootstrap.len(), "Joined rendezvous topic");

        let cancel = CancellationToken::new();
        let (sender, mut receiver) = topic.split();
        let membership_cancel = cancel.clone();
        let dialed = DialSet::default();
        tokio::spawn(async move {
            // Dropping both halves leaves the topic
            let _sender = sender;
            loop {
                let event = tokio::select! {
                    _ = membership_cancel.cancelled() => break,
                    event = n0_future::StreamExt::try_next(&mut receiver) => event,
                };
                match event {
                    Ok(Some(GossipEvent::NeighborUp(peer))) => {
                        if endpoint.id().as_bytes() < peer.as_bytes() {
                            if !dialed.claim(peer) {
                                debug!(%peer, "Neighbour up again, already dialed");
                                continue;
                            }
                            let endpoint = endpoint.clone();
                            let events = events.clone();
                            let dialed = dialed.clone();
                            let cancel = membership_cancel.clone();
                            tokio::spawn(async move {
                                match dial(&endpoint, peer, &events).await {
                                    Ok(connection) => {
                                        tokio::select! {
                                            _ = cancel.cancelled() => {}
                                            _ = connection.closed() => {
                                                debug!(%peer, "Dialed connection closed");
                                            }
                                        }
                                        dialed.release(peer);
                                    }
                                    Err(e) => {
                                        dialed.release(peer);
                                        warn!(%peer, error = %e, "Failed to dial neighbour");
                                        let _ = events.send(DiscoveryEvent::Error(e.to_string())).await;
                                    }
                                }
                            });
                        } else {
                            debug!(%peer, "Neighbour up, waiting for it to dial");
                        }
                    }
                    Ok(Some(GossipEvent::NeighborDown(peer))) => {
                        debug!(%peer, "Neighbour down");
                    }
                    Ok(Some(_)) => {}
                    Err(e) => {
                        warn!(error = ?e, "Rendezvous topic error");
                        let _ = events.send(DiscoveryEvent::Error(e.to_string())).await;
                        break;
                    }
                    Ok(None) => {
                        debug!("Rendezvous topic closed");
                        break;
                    }
                }
            }
        });

        Ok(IrohSession { router, cancel })
    }
}

#[async_trait]
impl Discovery for IrohDiscovery {
    async fn start(&self, key: NamespaceKey) -> GridResult<mpsc::Receiver<DiscoveryEvent>> {
        self.stop().await;

        let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        match self.bind_session(key, tx.clone()).await {
            Ok(session) => {
                *self.session.lock().await = Some(session);
                let _ = tx.send(DiscoveryEvent::Listening).await;
            }
            Err(e) => {
                error!(error = %e, "Discovery session failed to start");
                let _ = tx.send(DiscoveryEvent::Error(e.to_string())).await;
            }
        }
        Ok(rx)
    }

    async fn stop(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            info!("Stopping discovery session");
            session.cancel.cancel();
            if let Err(e) = session.router.shutdown().await {
                warn!(error = ?e, "Router shutdown failed");
            }
        }
    }
}

/// Connect to `peer` and hand the link to the node; returns the connection
async fn dial(
    endpoint: &Endpoint,
    peer: EndpointId,
    events: &mpsc::Sender<DiscoveryEvent>,
) -> GridResult<Connection> {
    debug!(%peer, "Dialing neighbour");
    let connection = endpoint
        .connect(peer, GRID_ALPN)
        .await
        .map_err(|e| GridError::Transport(format!("Failed to connect to {}: {}", peer, e)))?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| GridError::Transport(format!("Failed to open bi stream: {}", e)))?;

    events
        .send(DiscoveryEvent::Connection(iroh_connection(connection.clone(), send, recv)))
        .await
        .map_err(|_| GridError::Transport("Discovery session ended".to_string()))?;
    Ok(connection)
}

/// Wrap an established stream pair as a [`PeerConnection`]
fn iroh_connection(connection: Connection, send: SendStream, recv: RecvStream) -> PeerConnection {
    let remote = connection.remote_id().to_string();
    let label = format!("iroh:{}", &remote[..remote.len().min(10)]);
    let (inbound_tx, inbound) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

    let reader_label = label.clone();
    tokio::spawn(async move {
        let mut reader = FramedRead::new(recv, frame_codec());
        while let Some(chunk) = reader.next().await {
            let frame = match chunk {
                Ok(bytes) => match Frame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(link = %reader_label, error = %e, "Dropping undecodable frame");
                        continue;
                    }
                },
                Err(e) => {
                    debug!(link = %reader_label, error = %e, "Peer stream ended");
                    break;
                }
            };
            if inbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    PeerConnection {
        link: Arc::new(IrohLink {
            connection,
            writer: Mutex::new(FramedWrite::new(send, frame_codec())),
            label,
        }),
        inbound,
    }
}

/// One QUIC connection to a grid peer
struct IrohLink {
    connection: Connection,
    writer: Mutex<FramedWrite<SendStream, LengthDelimitedCodec>>,
    label: String,
}

#[async_trait]
impl PeerLink for IrohLink {
    async fn send(&self, frame: Frame) -> GridResult<()> {
        let bytes = frame.encode()?;
        self.writer
            .lock()
            .await
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| GridError::Delivery(format!("{}: {}", self.label, e)))
    }

    async fn close(&self) {
        self.connection.close(0u32.into(), b"closing");
    }

    async fn closed(&self) {
        let reason = self.connection.closed().await;
        debug!(link = %self.label, ?reason, "Connection closed");
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

/// Accepts inbound `/gridsync/peer/1` connections for the router
#[derive(Debug, Clone)]
struct GridProtocolHandler {
    events: mpsc::Sender<DiscoveryEvent>,
}

impl GridProtocolHandler {
    fn new(events: mpsc::Sender<DiscoveryEvent>) -> Self {
        Self { events }
    }
}

impl ProtocolHandler for GridProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let events = self.events.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting grid connection");

            let (send, recv) = conn.accept_bi().await.map_err(|e| {
                AcceptError::from_err(GridError::Transport(format!(
                    "Failed to accept bi stream: {}",
                    e
                )))
            })?;

            if events
                .send(DiscoveryEvent::Connection(iroh_connection(conn, send, recv)))
                .await
                .is_err()
            {
                warn!("Discovery session gone, dropping inbound connection");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_id() -> EndpointId {
        SecretKey::generate(&mut rand::rng()).public()
    }

    #[test]
    fn test_neighbour_is_dialed_once_until_released() {
        let dialed = DialSet::default();
        let peer = endpoint_id();
        let other = endpoint_id();

        assert!(dialed.claim(peer));
        assert!(!dialed.claim(peer), "flapping neighbour must not be dialed twice");
        assert!(dialed.claim(other));

        dialed.release(peer);
        assert!(dialed.claim(peer), "released neighbour can be dialed again");
    }

    #[test]
    fn test_dial_set_is_shared_between_clones() {
        let dialed = DialSet::default();
        let peer = endpoint_id();
        let in_dial_task = dialed.clone();

        assert!(dialed.claim(peer));
        assert!(!in_dial_task.claim(peer));
        in_dial_task.release(peer);
        assert!(dialed.claim(peer));
    }
}
