//! Per-player audio sink
//!
//! The engine submits Opus packets once; each session's sink subscribes to
//! the broadcast and writes them to its own track while the peer is
//! connected.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::signalling::PlayerId;

pub const OPUS_CLOCK_RATE: u32 = 48_000;
/// Packets buffered per sink before the slowest one starts lagging
pub const AUDIO_QUEUE_DEPTH: usize = 64;

/// One encoded Opus packet
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub duration: Duration,
}

impl AudioFrame {
    pub fn opus(data: impl Into<Bytes>, duration_ms: u32) -> Self {
        Self {
            data: data.into(),
            duration: Duration::from_millis(duration_ms as u64),
        }
    }
}

pub struct AudioSink {
    player_id: PlayerId,
    track: Arc<TrackLocalStaticSample>,
    task: Mutex<Option<JoinHandle<()>>>,
    packets_sent: Arc<AtomicU64>,
}

impl AudioSink {
    pub fn new(player_id: &PlayerId, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", player_id),
            stream_id.to_string(),
        ));
        Self {
            player_id: player_id.clone(),
            track,
            task: Mutex::new(None),
            packets_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Forward packets from `frames`; dropped while `connected` is false
    pub fn start<F>(&self, mut frames: broadcast::Receiver<AudioFrame>, connected: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        let track = self.track.clone();
        let packets_sent = self.packets_sent.clone();
        let player_id = self.player_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        if !connected() {
                            continue;
                        }
                        let sample = Sample {
                            data: frame.data,
                            duration: frame.duration,
                            ..Default::default()
                        };
                        match track.write_sample(&sample).await {
                            Ok(()) => {
                                packets_sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => trace!("Audio write for player {} failed: {}", player_id, e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Player {} audio lagged by {} packets", player_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Audio sink for player {} finished", player_id);
        });

        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        info!("Audio sink started for player {}", self.player_id);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_drops_packets_until_connected() {
        let (tx, rx) = broadcast::channel(AUDIO_QUEUE_DEPTH);
        let sink = AudioSink::new(&PlayerId::from("p"), "stream");
        sink.start(rx, || false);
        assert!(sink.is_running());

        tx.send(AudioFrame::opus(vec![0xfc, 0xff, 0xfe], 20)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.packets_sent(), 0);

        sink.stop();
        assert!(!sink.is_running());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tx.receiver_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "sink kept its receiver");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_sink_ends_when_audio_source_closes() {
        let (tx, rx) = broadcast::channel::<AudioFrame>(AUDIO_QUEUE_DEPTH);
        let sink = AudioSink::new(&PlayerId::from(3u64), "stream");
        sink.start(rx, || true);
        drop(tx);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sink.is_running() {
            assert!(tokio::time::Instant::now() < deadline, "sink still running");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
