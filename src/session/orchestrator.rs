//! Turns the captured streams into registered sessions

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::leg::{DeliveryLeg, DeliveryMode, Session};
use super::multicast::{MulticastEndpoint, DEFAULT_TTL};
use super::ports::PortAllocator;
use super::server::SessionServer;
use crate::config::DeliveryConfig;
use crate::error::{AppError, Result};
use crate::stream::StreamReplicator;

/// Which sessions to build and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub unicast_path: String,
    pub multicast_path: String,
    pub segmented_path: String,
    pub multicast: bool,
    pub multicast_endpoint: Option<String>,
    pub multicast_ttl: u8,
    /// `None` disables segmented delivery
    pub segment: Option<Duration>,
}

impl Default for DeliveryPlan {
    fn default() -> Self {
        Self {
            unicast_path: "unicast".to_string(),
            multicast_path: "multicast".to_string(),
            segmented_path: "ts".to_string(),
            multicast: true,
            multicast_endpoint: None,
            multicast_ttl: DEFAULT_TTL,
            segment: None,
        }
    }
}

impl From<&DeliveryConfig> for DeliveryPlan {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            unicast_path: config.unicast_path.clone(),
            multicast_path: config.multicast_path.clone(),
            segmented_path: config.segmented_path.clone(),
            multicast: config.multicast_enabled,
            multicast_endpoint: config.multicast_endpoint.clone(),
            multicast_ttl: config.multicast_ttl,
            segment: (config.segment_secs > 0).then(|| Duration::from_secs(config.segment_secs)),
        }
    }
}

/// Owns the replicated streams of one run and registers their sessions
pub struct SessionOrchestrator {
    plan: DeliveryPlan,
    video: Option<Arc<StreamReplicator>>,
    audio: Option<Arc<StreamReplicator>>,
}

impl SessionOrchestrator {
    pub fn new(
        plan: DeliveryPlan,
        video: Option<Arc<StreamReplicator>>,
        audio: Option<Arc<StreamReplicator>>,
    ) -> Self {
        Self { plan, video, audio }
    }

    fn sources(&self) -> impl Iterator<Item = &Arc<StreamReplicator>> {
        self.video.iter().chain(self.audio.iter())
    }

    pub fn has_sources(&self) -> bool {
        self.sources().next().is_some()
    }

    /// Sessions for every enabled mode, in unicast, multicast, segmented
    /// order. Sessions without legs are kept so callers can see them skipped.
    pub fn build_sessions(&self) -> Vec<Session> {
        let mut sessions = Vec::with_capacity(3);

        let unicast = self
            .sources()
            .map(|stream| DeliveryLeg::Unicast {
                stream: stream.clone(),
            })
            .collect();
        sessions.push(Session::new(
            &self.plan.unicast_path,
            DeliveryMode::Unicast,
            unicast,
        ));

        if self.plan.multicast {
            let endpoint = MulticastEndpoint::decode(self.plan.multicast_endpoint.as_deref());
            let mut ports = PortAllocator::new(endpoint.ports.rtp);
            let mut legs = Vec::new();
            for stream in self.sources() {
                let Some(pair) = ports.next_pair() else {
                    warn!("No multicast ports left for {}", stream.info().rtp_mime);
                    break;
                };
                info!("RTP  address {}:{}", endpoint.group, pair.rtp);
                info!("RTCP address {}:{}", endpoint.group, pair.rtcp);
                legs.push(DeliveryLeg::Multicast {
                    stream: stream.clone(),
                    group: endpoint.group,
                    ports: pair,
                    ttl: self.plan.multicast_ttl,
                });
            }
            sessions.push(Session::new(
                &self.plan.multicast_path,
                DeliveryMode::Multicast,
                legs,
            ));
        }

        if let Some(segment) = self.plan.segment {
            let legs = self
                .video
                .iter()
                .map(|video| DeliveryLeg::Segmented {
                    video: video.clone(),
                    audio: self.audio.clone(),
                    segment,
                })
                .collect();
            sessions.push(Session::new(
                &self.plan.segmented_path,
                DeliveryMode::Segmented,
                legs,
            ));
        }

        sessions
    }

    /// Register every non-empty session. Returns the number of legs the
    /// server accepted; a session the server refuses counts as zero.
    pub fn register<S: SessionServer + ?Sized>(&self, server: &S) -> usize {
        let mut total = 0;
        for session in self.build_sessions() {
            if session.is_empty() {
                continue;
            }
            let name = session.name.clone();
            let mode = session.mode;
            let legs = session.legs.len();
            match server.add_session(session) {
                Ok(url) => {
                    info!("Play this stream using the URL \"{}\"", url);
                    if mode == DeliveryMode::Segmented {
                        if let Some(base) = server.http_base_url() {
                            info!("HLS       {}/{}.m3u8", base, name);
                            info!("MPEG-DASH {}/{}.mpd", base, name);
                        }
                    }
                    total += legs;
                }
                Err(e) => error!("Failed to register {} session {}: {}", mode, name, e),
            }
        }
        total
    }

    /// Register sessions, start capture and serve until cancelled.
    /// Nothing is served when no leg could be registered.
    pub async fn run<S: SessionServer + ?Sized>(
        &self,
        server: &S,
        cancel: CancellationToken,
    ) -> Result<usize> {
        let legs = self.register(server);
        if legs == 0 {
            return Err(AppError::SessionRegistration(
                "no delivery leg registered".to_string(),
            ));
        }

        for stream in self.sources() {
            stream.start(&cancel);
        }

        info!("Serving {} delivery legs", legs);
        server.serve(cancel).await?;
        info!("Exiting...");
        Ok(legs)
    }
}
