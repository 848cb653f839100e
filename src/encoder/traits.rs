//! Encoder traits and common types

use bytes::Bytes;
use std::sync::Arc;

use crate::adapter::AdaptedFrame;
use crate::config::{CodecKind, EncoderSettings, H264Profile, RateControlMode};
use crate::error::EncoderError;

/// Input format a backend consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderInputKind {
    /// Planar 4:2:0 in CPU memory
    I420,
    /// The captured texture itself
    Native,
}

/// Configuration of a single encoder instance
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub codec: CodecKind,
    pub width: u32,
    pub height: u32,
    pub max_framerate: u32,
    pub target_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub rate_control: RateControlMode,
    pub min_qp: i32,
    pub max_qp: i32,
    pub h264_profile: H264Profile,
    /// Frames between forced keyframes, 0 disables
    pub keyframe_interval: u32,
}

impl EncoderConfig {
    pub fn from_settings(settings: &EncoderSettings, width: u32, height: u32, fps: u32) -> Self {
        Self {
            codec: settings.codec,
            width,
            height,
            max_framerate: fps.max(1),
            target_bitrate_bps: settings.target_bitrate_bps,
            max_bitrate_bps: settings.max_bitrate_bps,
            rate_control: settings.rate_control,
            min_qp: settings.min_qp,
            max_qp: settings.max_qp,
            h264_profile: settings.h264_profile,
            keyframe_interval: settings.keyframe_interval,
        }
    }

    pub fn validate(&self) -> Result<(), EncoderError> {
        if self.width == 0 || self.height == 0 {
            return Err(EncoderError::InvalidParameter(format!(
                "resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.max_framerate == 0 {
            return Err(EncoderError::InvalidParameter("framerate 0".to_string()));
        }
        if self.min_qp >= 0 && self.max_qp >= 0 && self.min_qp > self.max_qp {
            return Err(EncoderError::InvalidParameter(format!(
                "min_qp {} > max_qp {}",
                self.min_qp, self.max_qp
            )));
        }
        Ok(())
    }
}

/// Settings handed to a peer encoder by the peer connection
#[derive(Debug, Clone, PartialEq)]
pub struct VideoCodecSettings {
    pub codec: CodecKind,
    pub width: u32,
    pub height: u32,
    pub max_framerate: u32,
    pub start_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
}

/// Rate parameters requested by a peer's bandwidth estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateControlParameters {
    pub bitrate_bps: u32,
    pub framerate_fps: f64,
}

/// Bitstream produced by one backend call
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub is_keyframe: bool,
    pub qp: Option<u32>,
}

/// An encoded frame of one simulcast stream, as delivered to every peer
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Bytes,
    pub simulcast_index: usize,
    pub frame_id: u64,
    pub timestamp_us: i64,
    pub is_keyframe: bool,
    pub qp: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub codec: CodecKind,
}

impl EncodedImage {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A real encoder backend
///
/// Not `Sync`: one instance is only ever driven from the encode worker.
pub trait VideoEncoder: Send {
    fn name(&self) -> &str;

    fn input_kind(&self) -> EncoderInputKind;

    /// (Re)configure for the given size and rates
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), EncoderError>;

    /// Encode one frame. `Ok(None)` means the backend skipped it.
    fn encode(
        &mut self,
        frame: &AdaptedFrame,
        force_keyframe: bool,
    ) -> Result<Option<EncodedPacket>, EncoderError>;

    fn set_rates(&mut self, bitrate_bps: u32, framerate_fps: f64) -> Result<(), EncoderError>;
}

/// Creates backend instances, one per simulcast stream
pub type EncoderCreator =
    Arc<dyn Fn(CodecKind) -> Result<Box<dyn VideoEncoder>, EncoderError> + Send + Sync>;
