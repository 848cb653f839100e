//! Video encoding
//!
//! ```text
//! PeerVideoEncoder (one per peer)  --encode-->  EncoderContext
//!                                                 | adapters (RHI thread)
//!                                                 v
//!                                         SimulcastEncoderAdapter
//!                                           (encode worker thread)
//!                                                 |
//!            <-- every live PeerVideoEncoder <----+ one encode, N deliveries
//! ```

pub mod context;
pub mod factory;
pub mod h264_bitstream;
#[cfg(feature = "openh264")]
pub mod openh264;
pub mod peer_encoder;
pub mod rate_allocator;
pub mod simulcast;
#[cfg(test)]
pub(crate) mod testing;
pub mod traits;

use std::sync::Arc;

pub use context::{EncodeObserver, EncoderContext, RatesOutcome};
pub use factory::VideoEncoderFactory;
pub use peer_encoder::{EncodedImageCallback, PeerVideoEncoder};
pub use rate_allocator::{SimulcastRateAllocator, StreamAllocation};
pub use simulcast::SimulcastEncoderAdapter;
pub use traits::{
    EncodedImage, EncodedPacket, EncoderConfig, EncoderCreator, EncoderInputKind,
    RateControlParameters, VideoCodecSettings, VideoEncoder,
};

use crate::config::CodecKind;
use crate::error::EncoderError;

/// Encoder backends compiled into this build
pub fn available_backends() -> Vec<&'static str> {
    let mut backends = Vec::new();
    #[cfg(feature = "openh264")]
    backends.push("openh264");
    backends
}

/// Creator for the backends compiled into this build
pub fn default_encoder_creator() -> EncoderCreator {
    Arc::new(|codec: CodecKind| -> Result<Box<dyn VideoEncoder>, EncoderError> {
        match codec {
            #[cfg(feature = "openh264")]
            CodecKind::H264 => Ok(Box::new(openh264::OpenH264Encoder::new())),
            other => Err(EncoderError::Failed(format!(
                "no {} encoder backend in this build",
                other
            ))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::testing::{mock_creator, MockLog};
    use super::*;
    use crate::capture::{FrameSource, PendingFrame};
    use crate::config::{CaptureConfig, EncoderSettings, SimulcastConfig};
    use crate::error::{CODEC_OK, CODEC_UNINITIALIZED};
    use crate::pump::VideoFrame;
    use crate::rhi::{Rhi, SoftwareRhi, Texture, TextureDesc};
    use crate::signalling::PlayerId;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    struct Harness {
        source: FrameSource,
        factory: VideoEncoderFactory,
        log: MockLog,
    }

    fn harness() -> Harness {
        let rhi: Arc<dyn Rhi> = SoftwareRhi::start().unwrap();
        let log = MockLog::default();
        let context = EncoderContext::new(
            rhi.clone(),
            mock_creator(log.clone()),
            EncoderSettings::default(),
            SimulcastConfig::default().layers,
        )
        .unwrap();
        let source = FrameSource::new(rhi, vec![1.0], &CaptureConfig::default());
        source.on_backbuffer_ready(&Arc::new(Texture::with_data(
            TextureDesc::rgba(16, 16),
            vec![128; 16 * 16 * 4],
        )));
        let deadline = Instant::now() + Duration::from_secs(10);
        while !source.is_available() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        Harness {
            source,
            factory: VideoEncoderFactory::new(context),
            log,
        }
    }

    fn settings() -> VideoCodecSettings {
        VideoCodecSettings {
            codec: CodecKind::H264,
            width: 16,
            height: 16,
            max_framerate: 30,
            start_bitrate_bps: 1_000_000,
            max_bitrate_bps: 20_000_000,
        }
    }

    fn collector(shim: &PeerVideoEncoder) -> Arc<Mutex<Vec<u64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        shim.register_encode_complete_callback(Box::new(move |image: &EncodedImage| {
            s.lock().push(image.frame_id)
        }));
        seen
    }

    fn pending(h: &Harness) -> PendingFrame {
        h.source.request_frame().unwrap()
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_one_encode_many_deliveries() {
        let h = harness();
        let a = h.factory.create_video_encoder();
        let b = h.factory.create_video_encoder();
        assert_eq!(a.init_encode(&settings()), CODEC_OK);
        assert_eq!(b.init_encode(&settings()), CODEC_OK);
        let seen_a = collector(&a);
        let seen_b = collector(&b);

        let pa = PlayerId::from("A");
        let pb = PlayerId::from("B");
        a.encode(VideoFrame::Probe { player_id: pa.clone(), width: 16, height: 16 });
        b.encode(VideoFrame::Probe { player_id: pb, width: 16, height: 16 });
        assert_eq!(a.player_id(), Some(pa.clone()));
        h.factory.context().set_controller(Some(pa));

        // Non-controller frames are ignored
        assert_eq!(b.encode(VideoFrame::Frame(pending(&h))), CODEC_OK);
        h.factory.context().drain_worker();

        assert_eq!(a.encode(VideoFrame::Frame(pending(&h))), CODEC_OK);
        wait_for(|| seen_a.lock().len() == 1 && seen_b.lock().len() == 1);
        assert_eq!(*seen_a.lock(), *seen_b.lock());
        assert_eq!(h.log.encoded().len(), 1);
        // The first encode after a controller change is a keyframe
        assert!(h.log.encoded()[0].1);

        // A dropped shim stops receiving, the other keeps going
        drop(b);
        assert_eq!(h.factory.context().sink_count(), 1);
        a.encode(VideoFrame::Frame(pending(&h)));
        wait_for(|| seen_a.lock().len() == 2);
        assert_eq!(seen_b.lock().len(), 1);
    }

    #[test]
    fn test_empty_encode_is_not_counted() {
        let h = harness();
        let a = h.factory.create_video_encoder();
        a.init_encode(&settings());
        let seen = collector(&a);
        let pa = PlayerId::from("A");
        a.encode(VideoFrame::Probe { player_id: pa.clone(), width: 16, height: 16 });
        h.factory.context().set_controller(Some(pa));

        h.log.set_silent(true);
        a.encode(VideoFrame::Frame(pending(&h)));
        wait_for(|| h.log.encoded().len() == 1);
        h.factory.context().drain_worker();
        assert_eq!(h.factory.context().frames_encoded(), 0);
        assert!(seen.lock().is_empty());

        // The swallowed keyframe request carries over to the next encode
        h.log.set_silent(false);
        a.encode(VideoFrame::Frame(pending(&h)));
        wait_for(|| seen.lock().len() == 1);
        h.factory.context().drain_worker();
        assert_eq!(h.factory.context().frames_encoded(), 1);
        let encoded = h.log.encoded();
        assert!(encoded[0].1 && encoded[1].1);
    }

    #[test]
    fn test_encode_before_init_is_uninitialized() {
        let h = harness();
        let shim = h.factory.create_video_encoder();
        assert_eq!(
            shim.encode(VideoFrame::Frame(pending(&h))),
            CODEC_UNINITIALIZED
        );
    }

    #[test]
    fn test_last_release_drops_shared_encoder() {
        let h = harness();
        let a = h.factory.create_video_encoder();
        let b = h.factory.create_video_encoder();
        a.init_encode(&settings());
        b.init_encode(&settings());
        assert!(h.factory.context().is_encoder_initialized());

        a.release();
        assert!(h.factory.context().is_encoder_initialized());
        b.release();
        assert!(!h.factory.context().is_encoder_initialized());

        // A released shim can be initialised again
        assert_eq!(a.init_encode(&settings()), CODEC_OK);
        assert_eq!(h.factory.context().sink_count(), 1);
    }

    #[test]
    fn test_failed_init_releases_and_returns_code() {
        let rhi: Arc<dyn Rhi> = SoftwareRhi::start().unwrap();
        let context = EncoderContext::new(
            rhi,
            testing::failing_creator(),
            EncoderSettings::default(),
            SimulcastConfig::default().layers,
        )
        .unwrap();
        let factory = VideoEncoderFactory::new(context);
        let shim = factory.create_video_encoder();
        assert!(shim.init_encode(&settings()) < 0);
        assert!(!shim.is_initialized());
        assert_eq!(factory.context().sink_count(), 0);
    }

    #[test]
    fn test_unbound_rates_forwarded_on_probe() {
        let h = harness();
        let a = h.factory.create_video_encoder();
        a.init_encode(&settings());
        let player = PlayerId::from("A");
        h.factory.context().set_controller(Some(player.clone()));

        a.set_rates(RateControlParameters {
            bitrate_bps: 750_000,
            framerate_fps: 30.0,
        });
        assert_ne!(h.log.rates().last(), Some(&(750_000, 30.0)));

        a.encode(VideoFrame::Probe { player_id: player, width: 16, height: 16 });
        assert_eq!(h.log.rates().last(), Some(&(750_000, 30.0)));
    }

    #[cfg(feature = "openh264")]
    #[test]
    fn test_default_creator_encodes_h264() {
        assert_eq!(available_backends(), vec!["openh264"]);
        let creator = default_encoder_creator();
        let encoder = creator(CodecKind::H264).unwrap();
        assert_eq!(encoder.name(), "openh264");
        assert!(creator(CodecKind::Vp8).is_err());
    }

    #[cfg(not(feature = "openh264"))]
    #[test]
    fn test_default_creator_without_backends() {
        assert!(available_backends().is_empty());
        assert!(default_encoder_creator()(CodecKind::H264).is_err());
    }
}
