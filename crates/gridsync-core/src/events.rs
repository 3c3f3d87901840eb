//! Node events and peer summaries
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  GridEvent: notifications from a running node                   │
//! │  ├── Ready: readiness barrier fired                             │
//! │  ├── PeerConnected / PeerIdentified / PeerDisconnected          │
//! │  ├── SyncOffered / PeerSynchronized: master side                │
//! │  ├── SyncApplied / SyncFailed / Cleared: replica side           │
//! │  └── DiscoveryRestarted / DiscoveryFailed: membership           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;

use crate::router::{ConnectionId, PeerSyncState};

/// Point-in-time view of one peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    /// Connection id within the pool
    pub connection: ConnectionId,
    /// Remote display name, once identity was exchanged
    pub name: Option<String>,
    /// Replication state
    #[serde(serialize_with = "serialize_state")]
    pub state: PeerSyncState,
}

fn serialize_state<S: serde::Serializer>(state: &PeerSyncState, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(state)
}

/// Events emitted by a [`GridNode`](crate::GridNode)
#[derive(Debug, Clone, PartialEq)]
pub enum GridEvent {
    /// All readiness signals arrived
    Ready,
    /// A connection was registered in the pool
    PeerConnected { connection: ConnectionId },
    /// The remote identity arrived
    PeerIdentified { connection: ConnectionId, name: String },
    /// A connection left the pool
    PeerDisconnected { connection: ConnectionId },
    /// A sync offer went out to a peer
    SyncOffered { connection: ConnectionId, fingerprint: String },
    /// A peer reported the current fingerprint
    PeerSynchronized { connection: ConnectionId, fingerprint: String },
    /// This node persisted an offered payload
    SyncApplied { fingerprint: String },
    /// This node failed to persist an offered payload (not retried)
    SyncFailed { error: String },
    /// This node discarded its payload on request
    Cleared,
    /// The isolation check restarted discovery
    DiscoveryRestarted { attempt: u64 },
    /// The discovery transport reported an error
    DiscoveryFailed { error: String },
}

impl GridEvent {
    /// Connection the event concerns, if any
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            GridEvent::PeerConnected { connection }
            | GridEvent::PeerIdentified { connection, .. }
            | GridEvent::PeerDisconnected { connection }
            | GridEvent::SyncOffered { connection, .. }
            | GridEvent::PeerSynchronized { connection, .. } => Some(*connection),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_connection() {
        let event = GridEvent::PeerSynchronized {
            connection: 4,
            fingerprint: "abc123".to_string(),
        };
        assert_eq!(event.connection(), Some(4));
        assert_eq!(GridEvent::Ready.connection(), None);
    }

    #[test]
    fn test_summary_serializes_state_as_text() {
        let summary = PeerSummary {
            connection: 1,
            name: Some("calm-harbor-01".to_string()),
            state: PeerSyncState::SyncOffered,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["state"], "Sync offered");
        assert_eq!(json["name"], "calm-harbor-01");
    }
}
