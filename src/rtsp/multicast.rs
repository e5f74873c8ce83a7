//! Multicast legs push RTP to their group whether or not anyone listens

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pump::TrackPump;
use crate::error::Result;
use crate::session::PortPair;
use crate::stream::StreamReplicator;
use crate::utils::{bind_multicast_sender, LogThrottler};

/// Spawn the sender of one multicast leg. RTCP is not sent; its port is
/// only reserved and advertised.
pub fn spawn_multicast_sender(
    stream: &Arc<StreamReplicator>,
    index: usize,
    group: Ipv4Addr,
    ports: PortPair,
    ttl: u8,
    packet_budget: usize,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let socket = UdpSocket::from_std(bind_multicast_sender(ttl)?)?;
    let destination = SocketAddr::V4(SocketAddrV4::new(group, ports.rtp));
    let mut pump = TrackPump::new(stream, index, packet_budget);
    let name = stream.info().rtp_mime.clone();

    info!("Multicasting {} to {} (ttl {})", name, destination, ttl);
    Ok(tokio::spawn(async move {
        let throttler = LogThrottler::with_secs(5);
        loop {
            let packets = tokio::select! {
                _ = cancel.cancelled() => break,
                packets = pump.next_packets() => packets,
            };
            let Some(packets) = packets else {
                warn!("{} stream ended, stopping multicast to {}", name, destination);
                break;
            };
            for packet in packets {
                if let Err(e) = socket.send_to(&packet, destination).await {
                    if throttler.should_log("send") {
                        warn!("Multicast send to {} failed: {}", destination, e);
                    }
                }
            }
        }
        debug!("Multicast sender for {} stopped", destination);
    }))
}
