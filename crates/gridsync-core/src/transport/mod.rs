//! Rendezvous transports
//!
//! The coordination engine talks to the network through two seams:
//!
//! - [`Discovery`] joins the rendezvous topic for a namespace and reports a
//!   one-time `Listening` signal, transport errors, and inbound connections.
//! - [`PeerLink`] is one physical connection to one remote peer. Frames sent
//!   by the remote arrive, in order, on the [`PeerConnection::inbound`] channel.
//!
//! ## Implementations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MemoryNetwork / MemoryDiscovery                                │
//! │  └── in-process hub keyed by NamespaceKey (tests, test mode)    │
//! │                                                                 │
//! │  IrohDiscovery                                                  │
//! │  ├── Endpoint (QUIC, fresh per discovery session)              │
//! │  ├── Gossip topic = NamespaceKey (membership)                   │
//! │  └── /gridsync/peer/1 ALPN (one bi-stream per peer pair)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod quic;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GridResult;
use crate::namespace::NamespaceKey;
use crate::protocol::Frame;

pub use memory::{MemoryDiscovery, MemoryNetwork};
pub use quic::{IrohDiscovery, GRID_ALPN};

/// Capacity of per-connection inbound frame channels
pub const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// Capacity of discovery event channels
pub const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// One physical connection to one remote peer
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Transmit a frame to the remote peer
    async fn send(&self, frame: Frame) -> GridResult<()>;

    /// Close the connection; idempotent
    async fn close(&self);

    /// Resolves once the connection is closed from either side
    async fn closed(&self);

    /// Short transport-level description of the remote end, for logs
    fn label(&self) -> String;
}

/// A freshly established connection: the link plus its ordered inbound frames
pub struct PeerConnection {
    pub link: Arc<dyn PeerLink>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("link", &self.link.label())
            .finish()
    }
}

/// Event reported by a discovery session
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// The listener is bound and the topic joined (sent once per session)
    Listening,
    /// Transport failure
    Error(String),
    /// A peer connection was accepted or established
    Connection(PeerConnection),
}

/// Rendezvous transport: topic membership plus connection establishment
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Join the topic for `key` and start listening
    ///
    /// Returns the event stream for this session. Starting while a session is
    /// active tears the old one down first.
    async fn start(&self, key: NamespaceKey) -> GridResult<mpsc::Receiver<DiscoveryEvent>>;

    /// Leave the topic and release the listener; a no-op when not started
    async fn stop(&self);
}
