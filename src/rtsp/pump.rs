//! Turns one replicated stream into RTP packets for a single destination

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, warn};

use super::payload::RtpTrack;
use crate::stream::{MediaFrame, StreamReplicator};
use crate::utils::LogThrottler;
use crate::video::format::CodecFamily;

pub struct TrackPump {
    name: String,
    rx: Receiver<MediaFrame>,
    track: RtpTrack,
    /// Hold frames back until decoding can start
    awaiting_key_frame: bool,
    packet_budget: usize,
    throttler: LogThrottler,
}

impl TrackPump {
    /// Subscribe now; packets are produced from the next captured frame
    pub fn new(stream: &Arc<StreamReplicator>, index: usize, packet_budget: usize) -> Self {
        Self {
            name: stream.info().rtp_mime.clone(),
            rx: stream.subscribe(),
            track: RtpTrack::new(stream.info(), index),
            awaiting_key_frame: stream.family() != CodecFamily::Generic,
            packet_budget,
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn track(&self) -> &RtpTrack {
        &self.track
    }

    /// Packets for the next sendable frame; `None` once the stream ended
    pub async fn next_packets(&mut self) -> Option<Vec<Bytes>> {
        loop {
            let frame = match self.rx.recv().await {
                Ok(frame) => frame,
                Err(RecvError::Lagged(skipped)) => {
                    if self.throttler.should_log("lagged") {
                        warn!("{}: receiver lagged, skipped {} frames", self.name, skipped);
                    }
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };

            if self.awaiting_key_frame {
                if !frame.key_frame {
                    continue;
                }
                self.awaiting_key_frame = false;
            }

            if frame.len() > self.packet_budget {
                if self.throttler.should_log("oversize") {
                    warn!(
                        "{}: dropping frame of {} bytes, larger than the {} byte budget",
                        self.name,
                        frame.len(),
                        self.packet_budget
                    );
                }
                continue;
            }

            match self.track.packets(&frame) {
                Ok(packets) if packets.is_empty() => continue,
                Ok(packets) => return Some(packets),
                Err(e) => {
                    debug!("{}: {}", self.name, e);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::reader::testing::ScriptedReader;
    use crate::stream::CaptureSourceFactory;
    use crate::video::format::FourCc;
    use crate::video::negotiate::NegotiatedFormat;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn replicator(frames: &[&'static [u8]]) -> Arc<StreamReplicator> {
        let format = NegotiatedFormat {
            fourcc: FourCc::new(b"YUYV"),
            width: 4,
            height: 2,
            buffer_size: 16,
        };
        let source = CaptureSourceFactory::default()
            .create_video_source(&format, ScriptedReader::frames(frames))
            .unwrap();
        StreamReplicator::new(source)
    }

    #[tokio::test]
    async fn oversized_frames_are_dropped() {
        let stream = replicator(&[&[1u8; 64], &[2u8; 8]]);
        let mut pump = TrackPump::new(&stream, 0, 16);
        let cancel = CancellationToken::new();
        stream.start(&cancel);

        let packets = tokio::time::timeout(Duration::from_secs(2), pump.next_packets())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packets.len(), 1);
        // 12-byte RTP header + the small frame
        assert_eq!(packets[0].len(), 12 + 8);
        cancel.cancel();
    }
}
