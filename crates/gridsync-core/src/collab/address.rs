//! Address resolution for the node identity
//!
//! The private address is the source address the OS would use for outbound
//! traffic (a connected UDP socket, no packet sent). The public address is
//! pinned by `GRID_PUBLIC_IP`, discovered through STUN, or falls back to the
//! private one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{AddressResolver, ResolvedAddresses};
use crate::config::ENV_PUBLIC_IP;
use crate::error::{GridError, GridResult};

/// Public STUN servers queried for the reflexive address
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun.l.google.com:19302", "stun.cloudflare.com:3478"];

const STUN_TIMEOUT: Duration = Duration::from_secs(2);
const STUN_MAGIC: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Route lookup target; never contacted, only used to pick a source address
const ROUTE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Default [`AddressResolver`]
#[derive(Debug, Clone)]
pub struct LocalAddressResolver {
    pinned_public: Option<IpAddr>,
    stun_servers: Vec<String>,
    loopback_only: bool,
}

impl LocalAddressResolver {
    /// Resolver honouring `GRID_PUBLIC_IP`; test mode stays on loopback
    pub fn from_env(test_mode: bool) -> Self {
        let pinned_public = std::env::var(ENV_PUBLIC_IP)
            .ok()
            .and_then(|raw| match raw.trim().parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(value = %raw, "Ignoring unparsable {}", ENV_PUBLIC_IP);
                    None
                }
            });
        Self {
            pinned_public,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            loopback_only: test_mode,
        }
    }

    /// Pin the public address
    pub fn with_public_ip(mut self, ip: IpAddr) -> Self {
        self.pinned_public = Some(ip);
        self
    }

    /// Replace the STUN server list; empty disables STUN
    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    async fn private_ip(&self) -> IpAddr {
        if self.loopback_only {
            return IpAddr::V4(Ipv4Addr::LOCALHOST);
        }
        match route_source_address().await {
            Ok(ip) => ip,
            Err(e) => {
                debug!(error = %e, "No outbound route, using loopback");
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        }
    }
}

#[async_trait]
impl AddressResolver for LocalAddressResolver {
    async fn resolve(&self) -> GridResult<ResolvedAddresses> {
        let private_ip = self.private_ip().await;

        let public_ip = match self.pinned_public {
            Some(ip) => ip,
            None if self.loopback_only => private_ip,
            None => match stun_public_ip(&self.stun_servers).await {
                Some(ip) => ip,
                None => {
                    debug!("STUN unavailable, reporting private address as public");
                    private_ip
                }
            },
        };

        info!(%public_ip, %private_ip, "Addresses resolved");
        Ok(ResolvedAddresses {
            public_ip,
            private_ip,
        })
    }
}

async fn route_source_address() -> GridResult<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(ROUTE_TARGET).await?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(GridError::Transport("route lookup gave no source address".to_string()));
    }
    Ok(ip)
}

async fn stun_public_ip(servers: &[String]) -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;

    for server in servers {
        let mut request = [0u8; 20];
        request[1] = 0x01; // binding request
        request[4..8].copy_from_slice(&STUN_MAGIC);
        rand::fill(&mut request[8..20]);

        let Some(dest) = tokio::net::lookup_host(server.as_str()).await.ok().and_then(|mut a| a.next()) else {
            continue;
        };
        if socket.send_to(&request, dest).await.is_err() {
            continue;
        }

        let mut buf = [0u8; 512];
        let len = match tokio::time::timeout(STUN_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => len,
            _ => {
                debug!(%server, "No STUN response");
                continue;
            }
        };
        if let Some(ip) = parse_binding_response(&buf[..len], &request[8..20]) {
            debug!(%server, %ip, "STUN reflexive address");
            return Some(ip);
        }
    }
    None
}

/// Extract the IPv4 mapped address from a STUN binding success response
fn parse_binding_response(packet: &[u8], transaction: &[u8]) -> Option<IpAddr> {
    if packet.len() < 20 || packet[4..8] != STUN_MAGIC || &packet[8..20] != transaction {
        return None;
    }

    let mut i = 20;
    while i + 4 <= packet.len() {
        let attr_type = u16::from_be_bytes([packet[i], packet[i + 1]]);
        let attr_len = u16::from_be_bytes([packet[i + 2], packet[i + 3]]) as usize;
        let Some(value) = packet.get(i + 4..i + 4 + attr_len) else {
            break;
        };

        // family 0x01 is IPv4
        if attr_len >= 8 && value[1] == 0x01 {
            let raw = [value[4], value[5], value[6], value[7]];
            match attr_type {
                ATTR_XOR_MAPPED_ADDRESS => {
                    let ip: [u8; 4] = std::array::from_fn(|k| raw[k] ^ STUN_MAGIC[k]);
                    return Some(IpAddr::V4(Ipv4Addr::from(ip)));
                }
                ATTR_MAPPED_ADDRESS => return Some(IpAddr::V4(Ipv4Addr::from(raw))),
                _ => {}
            }
        }
        // attributes are padded to 4 bytes
        i += 4 + ((attr_len + 3) & !3);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(transaction: &[u8; 12], attr_type: u16, ip: [u8; 4]) -> Vec<u8> {
        let mut packet = vec![0x01, 0x01, 0x00, 0x0c];
        packet.extend_from_slice(&STUN_MAGIC);
        packet.extend_from_slice(transaction);
        packet.extend_from_slice(&attr_type.to_be_bytes());
        packet.extend_from_slice(&8u16.to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x01, 0x12, 0x34]);
        packet.extend_from_slice(&ip);
        packet
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let txn = [9u8; 12];
        let xored = [203 ^ 0x21, 0x12, 113 ^ 0xA4, 7 ^ 0x42];
        let packet = response(&txn, ATTR_XOR_MAPPED_ADDRESS, xored);
        assert_eq!(
            parse_binding_response(&packet, &txn),
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_transaction() {
        let packet = response(&[1u8; 12], ATTR_MAPPED_ADDRESS, [198, 51, 100, 1]);
        assert_eq!(parse_binding_response(&packet, &[2u8; 12]), None);
        assert_eq!(
            parse_binding_response(&packet, &[1u8; 12]),
            Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)))
        );
    }

    #[tokio::test]
    async fn test_test_mode_resolves_loopback() {
        let resolver = LocalAddressResolver::from_env(true).with_stun_servers(Vec::new());
        let addrs = resolver.resolve().await.unwrap();
        assert_eq!(addrs.private_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_pinned_public_ip_wins() {
        let pinned: IpAddr = "203.0.113.9".parse().unwrap();
        let resolver = LocalAddressResolver::from_env(true).with_public_ip(pinned);
        assert_eq!(resolver.resolve().await.unwrap().public_ip, pinned);
    }
}
