//! Multicast endpoint decoding

use std::net::Ipv4Addr;

use rand::Rng;
use tracing::warn;

use super::ports::{PortPair, DEFAULT_RTP_PORT};

/// Time-to-live for multicast packets unless configured otherwise
pub const DEFAULT_TTL: u8 = 5;

/// Group address and first port pair for multicast delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastEndpoint {
    pub group: Ipv4Addr,
    pub ports: PortPair,
}

impl MulticastEndpoint {
    /// Decode `<ipv4-address>:<rtp-port>`. A missing or malformed address
    /// gives a random source-specific group; a missing or malformed port
    /// gives 20000. RTCP is always the RTP port plus one.
    pub fn decode(endpoint: Option<&str>) -> Self {
        let (addr, port) = match endpoint {
            Some(endpoint) => match endpoint.split_once(':') {
                Some((addr, port)) => (addr.trim(), port.trim()),
                None => (endpoint.trim(), ""),
            },
            None => ("", ""),
        };

        let group = match addr.parse::<Ipv4Addr>() {
            Ok(group) => group,
            Err(_) => {
                if !addr.is_empty() {
                    warn!("Invalid multicast address {}, using a random one", addr);
                }
                random_ssm_address()
            }
        };

        let ports = port
            .split(':')
            .next()
            .filter(|p| !p.is_empty())
            .and_then(|p| p.parse::<u16>().ok())
            .and_then(PortPair::at)
            .unwrap_or_else(|| {
                if !port.is_empty() {
                    warn!("Invalid multicast port {}, using {}", port, DEFAULT_RTP_PORT);
                }
                PortPair {
                    rtp: DEFAULT_RTP_PORT,
                    rtcp: DEFAULT_RTP_PORT + 1,
                }
            });

        Self { group, ports }
    }
}

/// Random address in the source-specific multicast block, 232.0.1.0 and up
pub fn random_ssm_address() -> Ipv4Addr {
    let mut rng = rand::rng();
    let low: u32 = rng.random_range(0x0000_0100..=0x00ff_ffff);
    Ipv4Addr::from(0xe800_0000 | low)
}
