//! Delivery legs and sessions

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use super::ports::PortPair;
use crate::stream::{MediaKind, StreamReplicator};

/// Delivery mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    Unicast,
    Multicast,
    Segmented,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Unicast => write!(f, "unicast"),
            DeliveryMode::Multicast => write!(f, "multicast"),
            DeliveryMode::Segmented => write!(f, "segmented"),
        }
    }
}

/// One network-facing subscription to a replicated stream
#[derive(Clone)]
pub enum DeliveryLeg {
    /// Transport is negotiated per client
    Unicast { stream: Arc<StreamReplicator> },
    /// Pushed to a group regardless of clients
    Multicast {
        stream: Arc<StreamReplicator>,
        group: Ipv4Addr,
        ports: PortPair,
        ttl: u8,
    },
    /// Video and optional audio muxed into segments
    Segmented {
        video: Arc<StreamReplicator>,
        audio: Option<Arc<StreamReplicator>>,
        segment: Duration,
    },
}

impl DeliveryLeg {
    pub fn mode(&self) -> DeliveryMode {
        match self {
            DeliveryLeg::Unicast { .. } => DeliveryMode::Unicast,
            DeliveryLeg::Multicast { .. } => DeliveryMode::Multicast,
            DeliveryLeg::Segmented { .. } => DeliveryMode::Segmented,
        }
    }

    /// The stream the leg is built around (video for segmented legs)
    pub fn stream(&self) -> &Arc<StreamReplicator> {
        match self {
            DeliveryLeg::Unicast { stream } | DeliveryLeg::Multicast { stream, .. } => stream,
            DeliveryLeg::Segmented { video, .. } => video,
        }
    }

    pub fn media(&self) -> MediaKind {
        self.stream().info().media
    }

    pub fn rtp_mime(&self) -> &str {
        &self.stream().info().rtp_mime
    }
}

impl fmt::Debug for DeliveryLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryLeg::Unicast { stream } => f
                .debug_struct("Unicast")
                .field("mime", &stream.info().rtp_mime)
                .finish(),
            DeliveryLeg::Multicast {
                stream,
                group,
                ports,
                ttl,
            } => f
                .debug_struct("Multicast")
                .field("mime", &stream.info().rtp_mime)
                .field("group", group)
                .field("ports", ports)
                .field("ttl", ttl)
                .finish(),
            DeliveryLeg::Segmented {
                video,
                audio,
                segment,
            } => f
                .debug_struct("Segmented")
                .field("video", &video.info().rtp_mime)
                .field("audio", &audio.as_ref().map(|a| a.info().rtp_mime.clone()))
                .field("segment", segment)
                .finish(),
        }
    }
}

/// Named group of legs sharing a lookup path
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub mode: DeliveryMode,
    pub legs: Vec<DeliveryLeg>,
}

impl Session {
    pub fn new(name: impl Into<String>, mode: DeliveryMode, legs: Vec<DeliveryLeg>) -> Self {
        Self {
            name: name.into(),
            mode,
            legs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }
}
