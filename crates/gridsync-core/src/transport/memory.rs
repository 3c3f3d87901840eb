//! In-process rendezvous hub
//!
//! Nodes that join the same [`NamespaceKey`] on a shared [`MemoryNetwork`] are
//! connected pairwise with in-memory duplex links, mirroring what a DHT swarm
//! does over the wire. Used by the test suite and by nodes in test mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    Discovery, DiscoveryEvent, PeerConnection, PeerLink, DISCOVERY_CHANNEL_CAPACITY,
    INBOUND_CHANNEL_CAPACITY,
};
use crate::error::{GridError, GridResult};
use crate::namespace::NamespaceKey;
use crate::protocol::Frame;

struct Member {
    node_id: u64,
    events: mpsc::Sender<DiscoveryEvent>,
    /// Close tokens of every link pair this member is part of
    pairs: Vec<CancellationToken>,
}

#[derive(Default)]
struct Hub {
    topics: HashMap<NamespaceKey, Vec<Member>>,
    /// Pending transport failure to report on a node's next start
    failures: HashMap<u64, String>,
}

/// Shared in-memory rendezvous network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
    next_node: Arc<AtomicU64>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a discovery handle for a new node on this network
    pub fn discovery(&self) -> MemoryDiscovery {
        let node_id = self.next_node.fetch_add(1, Ordering::Relaxed);
        MemoryDiscovery {
            network: self.clone(),
            node_id,
            active: Mutex::new(None),
        }
    }

    /// Number of nodes currently joined on `key`
    pub fn members(&self, key: &NamespaceKey) -> usize {
        self.hub.lock().topics.get(key).map(Vec::len).unwrap_or(0)
    }

    /// Close every link of a node without removing it from its topic
    pub fn sever(&self, node_id: u64) {
        let hub = self.hub.lock();
        for member in hub.topics.values().flatten() {
            if member.node_id == node_id {
                info!(node_id, links = member.pairs.len(), "Severing memory links");
                for pair in &member.pairs {
                    pair.cancel();
                }
            }
        }
    }

    /// Make the next `start` of `node_id` report a transport error
    pub fn fail_next_start(&self, node_id: u64, message: impl Into<String>) {
        self.hub.lock().failures.insert(node_id, message.into());
    }

    fn leave(&self, key: &NamespaceKey, node_id: u64) {
        let mut hub = self.hub.lock();
        if let Some(members) = hub.topics.get_mut(key) {
            members.retain(|m| m.node_id != node_id);
            if members.is_empty() {
                hub.topics.remove(key);
            }
        }
    }
}

/// Discovery handle of one node on a [`MemoryNetwork`]
pub struct MemoryDiscovery {
    network: MemoryNetwork,
    node_id: u64,
    active: Mutex<Option<NamespaceKey>>,
}

impl MemoryDiscovery {
    /// Identifier of this node on the network
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// The network this handle belongs to
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn start(&self, key: NamespaceKey) -> GridResult<mpsc::Receiver<DiscoveryEvent>> {
        self.stop().await;

        let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);

        let mut hub = self.network.hub.lock();
        if let Some(message) = hub.failures.remove(&self.node_id) {
            debug!(node_id = self.node_id, %message, "Reporting injected transport failure");
            let _ = tx.try_send(DiscoveryEvent::Error(message));
            return Ok(rx);
        }

        let _ = tx.try_send(DiscoveryEvent::Listening);

        let members = hub.topics.entry(key).or_default();
        let mut own_pairs = Vec::with_capacity(members.len());
        for member in members.iter_mut() {
            let (ours, theirs, token) = memory_pair(self.node_id, member.node_id);
            if member
                .events
                .try_send(DiscoveryEvent::Connection(theirs))
                .is_err()
            {
                debug!(peer = member.node_id, "Member not accepting connections, skipping");
                continue;
            }
            member.pairs.retain(|pair| !pair.is_cancelled());
            member.pairs.push(token.clone());
            own_pairs.push(token);
            let _ = tx.try_send(DiscoveryEvent::Connection(ours));
        }

        info!(node_id = self.node_id, namespace = %key, peers = own_pairs.len(), "Joined memory topic");
        members.push(Member {
            node_id: self.node_id,
            events: tx,
            pairs: own_pairs,
        });
        drop(hub);

        *self.active.lock() = Some(key);
        Ok(rx)
    }

    async fn stop(&self) {
        let key = self.active.lock().take();
        if let Some(key) = key {
            debug!(node_id = self.node_id, namespace = %key, "Leaving memory topic");
            self.network.leave(&key, self.node_id);
        }
    }
}

/// One end of an in-memory duplex connection
struct MemoryLink {
    tx: mpsc::Sender<Frame>,
    closed: CancellationToken,
    label: String,
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn send(&self, frame: Frame) -> GridResult<()> {
        if self.closed.is_cancelled() {
            return Err(GridError::Delivery(format!("{} is closed", self.label)));
        }
        tokio::select! {
            res = self.tx.send(frame) => res
                .map_err(|_| GridError::Delivery(format!("{} dropped its receiver", self.label))),
            _ = self.closed.cancelled() => Err(GridError::Delivery(format!("{} closed during send", self.label))),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

fn memory_pair(local: u64, remote: u64) -> (PeerConnection, PeerConnection, CancellationToken) {
    let token = CancellationToken::new();
    let (to_remote, remote_inbound) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let (to_local, local_inbound) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

    let ours = PeerConnection {
        link: Arc::new(MemoryLink {
            tx: to_remote,
            closed: token.clone(),
            label: format!("mem:{}->{}", local, remote),
        }),
        inbound: local_inbound,
    };
    let theirs = PeerConnection {
        link: Arc::new(MemoryLink {
            tx: to_local,
            closed: token.clone(),
            label: format!("mem:{}->{}", remote, local),
        }),
        inbound: remote_inbound,
    };
    (ours, theirs, token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerMessage;

    async fn next_connection(rx: &mut mpsc::Receiver<DiscoveryEvent>) -> PeerConnection {
        loop {
            match rx.recv().await.expect("event stream ended") {
                DiscoveryEvent::Connection(conn) => return conn,
                DiscoveryEvent::Listening => continue,
                DiscoveryEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_first_event_is_listening() {
        let network = MemoryNetwork::new();
        let discovery = network.discovery();
        let mut rx = discovery.start(NamespaceKey::derive("ns")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(DiscoveryEvent::Listening)));
    }

    #[tokio::test]
    async fn test_joiners_are_connected_pairwise() {
        let network = MemoryNetwork::new();
        let key = NamespaceKey::derive("ns");
        let a = network.discovery();
        let b = network.discovery();

        let mut a_rx = a.start(key).await.unwrap();
        let mut b_rx = b.start(key).await.unwrap();
        assert_eq!(network.members(&key), 2);

        let a_conn = next_connection(&mut a_rx).await;
        let mut b_conn = next_connection(&mut b_rx).await;

        a_conn.link.send(Frame::new(PeerMessage::Clear)).await.unwrap();
        let frame = b_conn.inbound.recv().await.unwrap();
        assert_eq!(frame.into_parts().0, PeerMessage::Clear);
    }

    #[tokio::test]
    async fn test_close_is_seen_by_both_ends() {
        let network = MemoryNetwork::new();
        let key = NamespaceKey::derive("ns");
        let a = network.discovery();
        let b = network.discovery();

        let mut a_rx = a.start(key).await.unwrap();
        let mut b_rx = b.start(key).await.unwrap();
        let a_conn = next_connection(&mut a_rx).await;
        let b_conn = next_connection(&mut b_rx).await;

        a_conn.link.close().await;
        b_conn.link.closed().await;
        assert!(b_conn.link.send(Frame::new(PeerMessage::Clear)).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let network = MemoryNetwork::new();
        let discovery = network.discovery();
        discovery.stop().await;
        discovery.stop().await;
    }

    #[tokio::test]
    async fn test_restart_rejoins_cleanly() {
        let network = MemoryNetwork::new();
        let key = NamespaceKey::derive("ns");
        let a = network.discovery();

        let _rx1 = a.start(key).await.unwrap();
        let _rx2 = a.start(key).await.unwrap();
        assert_eq!(network.members(&key), 1);

        a.stop().await;
        assert_eq!(network.members(&key), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_reported_once() {
        let network = MemoryNetwork::new();
        let a = network.discovery();
        network.fail_next_start(a.node_id(), "dht unreachable");

        let mut rx = a.start(NamespaceKey::derive("ns")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(DiscoveryEvent::Error(_))));

        let mut rx = a.start(NamespaceKey::derive("ns")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(DiscoveryEvent::Listening)));
    }

    fn pair_count(network: &MemoryNetwork, key: &NamespaceKey, node_id: u64) -> usize {
        network.hub.lock().topics[key]
            .iter()
            .find(|m| m.node_id == node_id)
            .map(|m| m.pairs.len())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_severed_pairs_are_pruned_on_rejoin() {
        let network = MemoryNetwork::new();
        let key = NamespaceKey::derive("ns");
        let a = network.discovery();
        let b = network.discovery();

        let mut a_rx = a.start(key).await.unwrap();
        for _ in 0..10 {
            let _b_rx = b.start(key).await.unwrap();
            network.sever(b.node_id());
            while a_rx.try_recv().is_ok() {}
        }

        let _b_rx = b.start(key).await.unwrap();
        assert_eq!(pair_count(&network, &key, a.node_id()), 1);
        assert_eq!(pair_count(&network, &key, b.node_id()), 1);
    }
}
