//! Fan-out of one source to any number of delivery legs

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{MediaFrame, StreamInfo};
use super::framing::ParameterSets;
use super::source::ElementaryStreamSource;
use crate::video::format::CodecFamily;

/// Frames buffered per subscriber before it starts lagging
const FANOUT_CAPACITY: usize = 32;

/// Shared by every leg built from the same source. The device is read once;
/// each subscriber gets its own copy of the frame handle.
pub struct StreamReplicator {
    info: StreamInfo,
    family: CodecFamily,
    tx: broadcast::Sender<MediaFrame>,
    params: Arc<RwLock<ParameterSets>>,
    source: Mutex<Option<ElementaryStreamSource>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamReplicator {
    /// Take ownership of a source. Frames flow once `start` is called, so
    /// legs can subscribe before the first frame is captured.
    pub fn new(source: ElementaryStreamSource) -> Arc<Self> {
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Arc::new(Self {
            info: source.info().clone(),
            family: source.family(),
            tx,
            params: Arc::new(RwLock::new(ParameterSets::default())),
            source: Mutex::new(Some(source)),
            task: Mutex::new(None),
        })
    }

    /// Start capture and the pump task. Must be called from within a tokio
    /// runtime; later calls are no-ops.
    pub fn start(&self, cancel: &CancellationToken) {
        let Some(mut source) = self.source.lock().take() else {
            return;
        };

        source.start(cancel);
        let cancel = cancel.clone();
        let tx = self.tx.clone();
        let params = self.params.clone();
        let mime = self.info.rtp_mime.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = source.next_frame() => {
                        let Some(frame) = frame else {
                            warn!("{} source ended", mime);
                            break;
                        };
                        if let Some(latest) = source.parameter_sets() {
                            if *params.read() != *latest {
                                *params.write() = latest.clone();
                            }
                        }
                        // No subscribers is not an error
                        let _ = tx.send(frame);
                    }
                }
            }
            if let Some(exit) = source.join().await {
                debug!("{} capture exited: {:?}", mime, exit);
            }
        });
        *self.task.lock() = Some(handle);

        info!("Replicating {} stream", self.info.rtp_mime);
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn family(&self) -> CodecFamily {
        self.family
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of the latest parameter sets (empty for non-NAL streams)
    pub fn parameter_sets(&self) -> ParameterSets {
        self.params.read().clone()
    }

    /// Whether the pump task is still running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for StreamReplicator {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::reader::testing::ScriptedReader;
    use crate::stream::source::CaptureSourceFactory;
    use crate::video::format::FourCc;
    use crate::video::negotiate::NegotiatedFormat;
    use std::time::Duration;

    const STREAM: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x42, 0xe0, 0x1f, 0, 0, 0, 1, 0x68, 0xce, 0x06, 0xe2, 0, 0, 0, 1, 0x65,
        0x88,
    ];

    fn h264() -> NegotiatedFormat {
        NegotiatedFormat {
            fourcc: FourCc::new(b"H264"),
            width: 640,
            height: 480,
            buffer_size: 460_800,
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_frame() {
        let source = CaptureSourceFactory::default()
            .create_video_source(&h264(), ScriptedReader::frames(&[STREAM]))
            .unwrap();
        let cancel = CancellationToken::new();
        let replicator = StreamReplicator::new(source);
        let mut a = replicator.subscribe();
        let mut b = replicator.subscribe();
        assert_eq!(replicator.subscriber_count(), 2);
        replicator.start(&cancel);

        let fa = tokio::time::timeout(Duration::from_secs(2), a.recv())
            .await
            .unwrap()
            .unwrap();
        let fb = tokio::time::timeout(Duration::from_secs(2), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fa.data, fb.data);
        assert!(fa.key_frame);

        let params = replicator.parameter_sets();
        assert_eq!(params.sps.as_deref(), Some(&[0x67, 0x42, 0xe0, 0x1f][..]));
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump() {
        let source = CaptureSourceFactory::default()
            .create_video_source(&h264(), ScriptedReader::frames(&[]))
            .unwrap();
        let cancel = CancellationToken::new();
        let replicator = StreamReplicator::new(source);
        assert!(!replicator.is_running());
        replicator.start(&cancel);
        assert!(replicator.is_running());

        cancel.cancel();
        for _ in 0..100 {
            if !replicator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!replicator.is_running());
    }
}
