//! Gridsync Core Library
//!
//! Peer coordination engine for self-organizing grids of worker nodes.
//!
//! ## Overview
//!
//! Nodes configured with the same namespace find each other through a shared
//! rendezvous topic and connect pairwise. One node, the file master, holds a
//! payload (plus task metadata) and replicates it to every other node; any
//! node can trigger tasks on any peer.
//!
//! ## Core Pieces
//!
//! - **Discovery**: rendezvous on a topic derived from the namespace
//!   ([`NamespaceKey`]), over iroh gossip or an in-process hub
//! - **Socket pool**: one [`PeerRouter`] per connection, snapshot broadcast
//! - **Replication**: `sync` offers from the master, `sync:done` fan-out from
//!   replicas, fingerprint-checked acknowledgement
//! - **Readiness**: a one-shot barrier over address, discovery and API signals
//! - **Self-healing**: isolated nodes restart discovery periodically
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gridsync_core::{Collaborators, GridConfig, GridNode, IrohDiscovery};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GridConfig::new("render-farm").apply_env();
//!     let discovery = Arc::new(IrohDiscovery::from_config(&config)?);
//!     let node = GridNode::new(config.clone(), Collaborators::defaults(&config, discovery)?)?;
//!
//!     node.start().await?;
//!     node.wait_ready().await;
//!     for peer in node.peers() {
//!         println!("{:?}: {}", peer.name, peer.state);
//!     }
//!     Ok(())
//! }
//! ```

pub mod barrier;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
mod healing;
pub mod identity;
pub mod logging;
pub mod namespace;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod transport;

// Re-exports
pub use barrier::{ReadinessBarrier, Signal};
pub use collab::{
    AddressResolver, Collaborators, FilePayloadStore, LocalAddressResolver, LocalApi,
    PayloadStore, ProcessTaskExecutor, ResolvedAddresses, StatusApi, StatusProvider, SyncOutcome,
    TaskExecutor,
};
pub use config::{FileOptions, GridConfig, TaskOptions, Timing};
pub use engine::GridNode;
pub use error::{GridError, GridResult};
pub use events::{GridEvent, PeerSummary};
pub use identity::NodeIdentity;
pub use namespace::NamespaceKey;
pub use pool::{BroadcastReport, SocketPool};
pub use protocol::{Frame, PeerMessage, SyncOffer, TaskMeta, TriggerRequest, WireMessage};
pub use router::{ConnectionId, PeerRouter, PeerSyncState};
pub use transport::{
    Discovery, DiscoveryEvent, IrohDiscovery, MemoryDiscovery, MemoryNetwork, PeerConnection,
    PeerLink,
};
