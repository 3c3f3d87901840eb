//! Node identity exchanged with every newly connected peer

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::config::GridConfig;

/// Immutable per-node facts, sent verbatim as the `identity` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Publicly reachable address (set once resolution completes)
    pub public_ip: Option<IpAddr>,
    /// Address on the local network
    pub private_ip: Option<IpAddr>,
    /// Local API port
    pub api_port: u16,
    /// Peer display name
    pub name: String,
    /// Host name of the machine
    pub hostname: String,
    /// Operating system (`linux`, `macos`, ...)
    pub platform: String,
    /// Grid namespace
    pub namespace: String,
    /// Whether this node is the file master
    pub is_files_master: bool,
    /// User running the node process
    pub user: String,
    /// Gridsync version
    pub version: String,
    /// Seconds since the node started, at the time the identity was sent
    pub uptime: u64,
}

impl NodeIdentity {
    /// Assemble the identity from configuration and local facts
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            public_ip: None,
            private_ip: None,
            api_port: config.api_port,
            name: config.name.clone(),
            hostname: local_hostname(),
            platform: std::env::consts::OS.to_string(),
            namespace: config.namespace.clone(),
            is_files_master: config.files.is_file_master,
            user: local_user(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: 0,
        }
    }

    /// Record the resolved network addresses
    pub fn with_addresses(mut self, public_ip: IpAddr, private_ip: IpAddr) -> Self {
        self.public_ip = Some(public_ip);
        self.private_ip = Some(private_ip);
        self
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.hostname)?;
        if let Some(ip) = self.public_ip {
            write!(f, " ({})", ip)?;
        }
        Ok(())
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_config() {
        let config = GridConfig::new("ns-a").with_name("calm-harbor-01");
        let identity = NodeIdentity::from_config(&config);

        assert_eq!(identity.name, "calm-harbor-01");
        assert_eq!(identity.namespace, "ns-a");
        assert_eq!(identity.api_port, 10000);
        assert!(!identity.is_files_master);
        assert!(identity.public_ip.is_none());
        assert!(!identity.hostname.is_empty());
    }

    #[test]
    fn test_display_includes_address_once_resolved() {
        let config = GridConfig::new("ns").with_name("node");
        let identity = NodeIdentity::from_config(&config);
        assert!(!identity.to_string().contains('('));

        let resolved = identity.with_addresses("203.0.113.7".parse().unwrap(), "10.0.0.2".parse().unwrap());
        assert!(resolved.to_string().ends_with("(203.0.113.7)"));
    }
}
