//! Rendezvous topic derivation
//!
//! Every node in a grid joins the same rendezvous topic, derived from the
//! namespace string with BLAKE3 and a fixed domain-separation tag:
//!
//! ```text
//! key = BLAKE3(namespace || ":gridsync-rendezvous-v1")
//! ```

use std::fmt;

use iroh_gossip::proto::TopicId;

/// Domain separation suffix appended to the namespace before hashing
const NAMESPACE_TAG: &[u8] = b":gridsync-rendezvous-v1";

/// Rendezvous topic key for one namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceKey([u8; 32]);

impl NamespaceKey {
    /// Derive the key for a namespace
    pub fn derive(namespace: &str) -> Self {
        let mut input = Vec::with_capacity(namespace.len() + NAMESPACE_TAG.len());
        input.extend_from_slice(namespace.as_bytes());
        input.extend_from_slice(NAMESPACE_TAG);

        Self(*blake3::hash(&input).as_bytes())
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex form, as handed to the rendezvous transport
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Gossip topic for this namespace
    pub fn topic_id(&self) -> TopicId {
        TopicId::from_bytes(self.0)
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns_{}", hex::encode(&self.0[..6]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(NamespaceKey::derive("grid-a"), NamespaceKey::derive("grid-a"));
    }

    #[test]
    fn test_hex_is_64_chars() {
        let key = NamespaceKey::derive("grid-a");
        assert_eq!(key.to_hex().len(), 64);
        assert_eq!(key.topic_id().as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_tag_separates_from_plain_hash() {
        let key = NamespaceKey::derive("grid-a");
        assert_ne!(key.as_bytes(), blake3::hash(b"grid-a").as_bytes());
    }

    proptest! {
        #[test]
        fn prop_same_namespace_same_key(ns in ".{0,64}") {
            prop_assert_eq!(NamespaceKey::derive(&ns), NamespaceKey::derive(&ns));
        }

        #[test]
        fn prop_different_namespaces_never_collide(a in "[a-z0-9-]{1,32}", b in "[a-z0-9-]{1,32}") {
            prop_assume!(a != b);
            prop_assert_ne!(NamespaceKey::derive(&a), NamespaceKey::derive(&b));
        }
    }
}
