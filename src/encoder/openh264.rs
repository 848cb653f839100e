//! Software H.264 backend built on OpenH264

use bytes::Bytes;
use openh264::encoder::{
    BitRate, Complexity, Encoder, EncoderConfig as OpenH264Config, FrameRate, FrameType,
    RateControlMode as OpenH264RateControl, SpsPpsStrategy, UsageType,
};
use openh264::formats::YUVSource;
use openh264::OpenH264API;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use super::h264_bitstream::SliceQpReader;
use super::traits::{EncodedPacket, EncoderConfig, EncoderInputKind, VideoEncoder};
use crate::adapter::{AdaptedBuffer, AdaptedFrame, I420Buffer};
use crate::config::RateControlMode;
use crate::error::EncoderError;

struct I420Source<'a>(&'a I420Buffer);

impl YUVSource for I420Source<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.0.width() as usize, self.0.height() as usize)
    }

    fn strides(&self) -> (usize, usize, usize) {
        let cw = self.0.chroma_width();
        (self.0.width() as usize, cw, cw)
    }

    fn y(&self) -> &[u8] {
        self.0.y_plane()
    }

    fn u(&self) -> &[u8] {
        self.0.u_plane()
    }

    fn v(&self) -> &[u8] {
        self.0.v_plane()
    }
}

/// Relative bitrate change that justifies rebuilding the encoder
const REBUILD_BITRATE_DELTA: f64 = 0.25;
/// Minimum time between rate-driven rebuilds
const REBUILD_MIN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
struct Rates {
    bitrate_bps: u32,
    framerate_fps: f64,
}

impl Rates {
    fn differs_enough(&self, target: &Rates) -> bool {
        let base = self.bitrate_bps.max(1) as f64;
        let delta = (target.bitrate_bps as f64 - base).abs() / base;
        delta >= REBUILD_BITRATE_DELTA || (target.framerate_fps - self.framerate_fps).abs() >= 1.0
    }
}

/// OpenH264 cannot retarget rates in place and every rebuild starts with
/// an IDR, so only large changes rebuild, and not too often
fn rebuild_due(applied: Rates, built_at: Instant, target: Rates, now: Instant) -> bool {
    now.saturating_duration_since(built_at) >= REBUILD_MIN_INTERVAL
        && applied.differs_enough(&target)
}

pub struct OpenH264Encoder {
    encoder: Option<Encoder>,
    config: Option<EncoderConfig>,
    target: Rates,
    /// Rates the current encoder was built with
    built: Option<(Rates, Instant)>,
    qp_reader: SliceQpReader,
    frame_count: u64,
}

impl OpenH264Encoder {
    pub fn new() -> Self {
        Self {
            encoder: None,
            config: None,
            target: Rates {
                bitrate_bps: 0,
                framerate_fps: 0.0,
            },
            built: None,
            qp_reader: SliceQpReader::new(),
            frame_count: 0,
        }
    }

    fn needs_build(&self) -> bool {
        match (&self.encoder, self.built) {
            (Some(_), Some((applied, at))) => rebuild_due(applied, at, self.target, Instant::now()),
            _ => true,
        }
    }

    fn build(&mut self) -> Result<(), EncoderError> {
        let config = self.config.as_ref().ok_or(EncoderError::Uninitialized)?;
        let rate_control = match config.rate_control {
            RateControlMode::Cbr => OpenH264RateControl::Bitrate,
            RateControlMode::Vbr => OpenH264RateControl::Quality,
            RateControlMode::ConstQp => OpenH264RateControl::Off,
        };
        let rates = self.target;
        let api_config = OpenH264Config::new()
            .bitrate(BitRate::from_bps(rates.bitrate_bps.max(1)))
            .max_frame_rate(FrameRate::from_hz(rates.framerate_fps as f32))
            .usage_type(UsageType::ScreenContentRealTime)
            .rate_control_mode(rate_control)
            .complexity(Complexity::Low)
            .skip_frames(false)
            .sps_pps_strategy(SpsPpsStrategy::ConstantId);

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), api_config)
            .map_err(|e| EncoderError::Failed(format!("OpenH264 init: {}", e)))?;
        info!(
            "OpenH264 encoder built: {}x{} @ {} bps, {:.1} fps",
            config.width, config.height, rates.bitrate_bps, rates.framerate_fps
        );
        self.encoder = Some(encoder);
        self.built = Some((rates, Instant::now()));
        Ok(())
    }
}

impl Default for OpenH264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for OpenH264Encoder {
    fn name(&self) -> &str {
        "openh264"
    }

    fn input_kind(&self) -> EncoderInputKind {
        EncoderInputKind::I420
    }

    fn configure(&mut self, config: &EncoderConfig) -> Result<(), EncoderError> {
        config.validate()?;
        if config.width % 2 != 0 || config.height % 2 != 0 {
            return Err(EncoderError::InvalidParameter(format!(
                "OpenH264 needs even dimensions, got {}x{}",
                config.width, config.height
            )));
        }
        self.target = Rates {
            bitrate_bps: config.target_bitrate_bps,
            framerate_fps: config.max_framerate as f64,
        };
        self.config = Some(config.clone());
        self.encoder = None;
        self.built = None;
        Ok(())
    }

    fn encode(
        &mut self,
        frame: &AdaptedFrame,
        force_keyframe: bool,
    ) -> Result<Option<EncodedPacket>, EncoderError> {
        let AdaptedBuffer::I420(buffer) = &frame.buffer else {
            return Err(EncoderError::InvalidParameter(
                "OpenH264 takes I420 input".to_string(),
            ));
        };
        if self.needs_build() {
            self.build()?;
        }
        let encoder = self.encoder.as_mut().ok_or(EncoderError::Uninitialized)?;
        if force_keyframe {
            encoder.force_intra_frame();
        }

        let bitstream = encoder
            .encode(&I420Source(buffer))
            .map_err(|e| EncoderError::Failed(format!("OpenH264 encode: {}", e)))?;
        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip) {
            return Ok(None);
        }
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(None);
        }

        self.frame_count += 1;
        let is_keyframe = matches!(frame_type, FrameType::IDR | FrameType::I);
        if is_keyframe {
            debug!(
                "OpenH264 keyframe #{}: {} bytes",
                self.frame_count,
                data.len()
            );
        }
        let qp = self.qp_reader.frame_qp(&data);
        if qp.is_none() {
            trace!("No slice QP in frame #{}", self.frame_count);
        }
        Ok(Some(EncodedPacket {
            data: Bytes::from(data),
            is_keyframe,
            qp,
        }))
    }

    fn set_rates(&mut self, bitrate_bps: u32, framerate_fps: f64) -> Result<(), EncoderError> {
        // Picked up by the next encode if `rebuild_due` allows it
        self.target = Rates {
            bitrate_bps,
            framerate_fps,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdaptedFrame;
    use crate::config::EncoderSettings;

    fn rates(bitrate_bps: u32, framerate_fps: f64) -> Rates {
        Rates {
            bitrate_bps,
            framerate_fps,
        }
    }

    #[test]
    fn test_rebuild_policy() {
        let built_at = Instant::now();
        let applied = rates(4_000_000, 60.0);
        let soon = built_at + Duration::from_secs(1);
        let later = built_at + REBUILD_MIN_INTERVAL;

        // Bandwidth estimate jitter never rebuilds
        assert!(!rebuild_due(applied, built_at, rates(4_400_000, 60.0), later));
        assert!(!rebuild_due(applied, built_at, rates(3_300_000, 60.3), later));
        // Large changes wait out the interval
        assert!(!rebuild_due(applied, built_at, rates(1_000_000, 60.0), soon));
        assert!(rebuild_due(applied, built_at, rates(1_000_000, 60.0), later));
        assert!(rebuild_due(applied, built_at, rates(4_000_000, 30.0), later));
    }

    fn gray_frame(frame_id: u64) -> AdaptedFrame {
        let (width, height) = (64u32, 64u32);
        let mut buffer = I420Buffer::new(width, height);
        let (y, u, v) = buffer.planes_mut();
        // Vary content so P frames carry residual
        for (i, px) in y.iter_mut().enumerate() {
            *px = ((i as u64 + frame_id * 7) % 200) as u8 + 16;
        }
        u.fill(128);
        v.fill(128);
        AdaptedFrame {
            buffer: AdaptedBuffer::I420(buffer),
            width,
            height,
            frame_id,
            timestamp_us: frame_id as i64 * 16_666,
        }
    }

    fn configured() -> OpenH264Encoder {
        let settings = EncoderSettings::default();
        let mut encoder = OpenH264Encoder::new();
        encoder
            .configure(&EncoderConfig::from_settings(&settings, 64, 64, 60))
            .unwrap();
        encoder
    }

    #[test]
    fn test_encoded_frames_report_qp() {
        let mut encoder = configured();
        let first = encoder.encode(&gray_frame(0), false).unwrap().unwrap();
        assert!(first.is_keyframe);
        let qp = first.qp.expect("keyframe QP");
        assert!(qp <= 51);

        let next = encoder.encode(&gray_frame(1), false).unwrap().unwrap();
        assert!(!next.is_keyframe);
        assert!(next.qp.is_some());
    }

    #[test]
    fn test_rate_updates_do_not_force_keyframes() {
        let mut encoder = configured();
        assert!(encoder.encode(&gray_frame(0), false).unwrap().unwrap().is_keyframe);

        let mut keyframes = 0;
        for i in 1..20u64 {
            // REMB-style estimates wandering around the start rate
            let bitrate = 2_000_000 + ((i % 5) as u32) * 80_000;
            encoder.set_rates(bitrate, 60.0).unwrap();
            if let Some(packet) = encoder.encode(&gray_frame(i), false).unwrap() {
                keyframes += packet.is_keyframe as u32;
            }
        }
        assert_eq!(keyframes, 0);
    }
}
