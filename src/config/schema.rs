use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Main streamer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StreamerConfig {
    /// Signalling server connection settings
    pub signalling: SignallingConfig,
    /// Frame capture settings
    pub capture: CaptureConfig,
    /// Video encoder settings
    pub encoder: EncoderSettings,
    /// Simulcast layer layout
    pub simulcast: SimulcastConfig,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
    /// Input handling settings
    pub input: InputConfig,
    /// Statistics and HUD settings
    pub stats: StatsConfig,
}

/// Signalling server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignallingConfig {
    /// WebSocket URL of the signalling server
    pub url: String,
    /// Identifier announced in `endpointId` (generated when empty)
    pub streamer_id: String,
    /// Emit player ids as JSON integers instead of strings
    pub send_player_id_as_integer: bool,
    /// Keep-alive ping interval
    pub keep_alive_interval_secs: u64,
    /// Reconnect after the socket drops
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts
    pub reconnect_interval_secs: u64,
    /// Offer to players on `playerConnected` rather than waiting for theirs
    pub offer_to_players: bool,
}

impl Default for SignallingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8888".to_string(),
            streamer_id: String::new(),
            send_player_id_as_integer: false,
            keep_alive_interval_secs: 60,
            auto_reconnect: true,
            reconnect_interval_secs: 2,
            offer_to_players: false,
        }
    }
}

/// Fixed capture size, overriding back-buffer tracking
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureSize {
    pub width: u32,
    pub height: u32,
}

/// Frame capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Target frame rate of the pump
    pub fps: u32,
    /// Ignore back-buffer resolution changes once streaming
    pub disable_resolution_change: bool,
    /// Capture at this size instead of following the back-buffer
    pub capture_size: Option<CaptureSize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            disable_resolution_change: false,
            capture_size: None,
        }
    }
}

/// Encoder codec
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    H264,
    Vp8,
}

impl CodecKind {
    /// Whether an encoder backend exists for this codec
    ///
    /// VP8 is negotiated by players but nothing encodes it.
    pub fn has_backend(self) -> bool {
        matches!(self, CodecKind::H264)
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecKind::H264 => write!(f, "H.264"),
            CodecKind::Vp8 => write!(f, "VP8"),
        }
    }
}

/// Encoder rate control mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RateControlMode {
    #[default]
    #[serde(rename = "CBR")]
    Cbr,
    #[serde(rename = "VBR")]
    Vbr,
    #[serde(rename = "ConstQP")]
    ConstQp,
}

/// H.264 profile
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum H264Profile {
    #[default]
    Auto,
    Baseline,
    Main,
    High,
}

/// Video encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderSettings {
    pub codec: CodecKind,
    pub rate_control: RateControlMode,
    /// Lower QP bound, -1 leaves it to the encoder
    pub min_qp: i32,
    /// Upper QP bound, -1 leaves it to the encoder
    pub max_qp: i32,
    pub target_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub h264_profile: H264Profile,
    /// Convert to I420 with the compute path instead of CPU readback
    pub use_compute_shader: bool,
    /// Frames between forced keyframes, 0 disables
    pub keyframe_interval: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: CodecKind::H264,
            rate_control: RateControlMode::Cbr,
            min_qp: -1,
            max_qp: -1,
            target_bitrate_bps: 10_000_000,
            max_bitrate_bps: 20_000_000,
            h264_profile: H264Profile::Auto,
            use_compute_shader: false,
            keyframe_interval: 300,
        }
    }
}

impl StreamerConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        if self.capture.fps == 0 {
            return Err(AppError::Config("capture.fps must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl EncoderSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.codec.has_backend() {
            return Err(AppError::Config(format!(
                "encoder.codec = {} has no encoder backend",
                self.codec
            )));
        }
        if self.min_qp >= 0 && self.max_qp >= 0 && self.min_qp > self.max_qp {
            return Err(AppError::Config(format!(
                "encoder.min_qp {} is above encoder.max_qp {}",
                self.min_qp, self.max_qp
            )));
        }
        Ok(())
    }

    /// Clamp a QP value into the configured bounds
    pub fn clamp_qp(&self, qp: u32) -> u32 {
        let mut qp = qp as i32;
        if self.min_qp >= 0 {
            qp = qp.max(self.min_qp);
        }
        if self.max_qp >= 0 {
            qp = qp.min(self.max_qp);
        }
        qp.max(0) as u32
    }
}

/// One simulcast rendition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SimulcastLayerConfig {
    /// Scale relative to the capture size (1.0 = full size)
    pub scale: f32,
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
}

/// Simulcast layout, highest quality first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulcastConfig {
    pub layers: Vec<SimulcastLayerConfig>,
}

impl Default for SimulcastConfig {
    fn default() -> Self {
        Self {
            layers: vec![SimulcastLayerConfig {
                scale: 1.0,
                min_bitrate_bps: 100_000,
                max_bitrate_bps: 20_000_000,
            }],
        }
    }
}

impl SimulcastConfig {
    /// Whether more than one rendition is encoded
    pub fn is_enabled(&self) -> bool {
        self.layers.len() > 1
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Degradation preference when bandwidth drops
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPreference {
    #[default]
    MaintainFramerate,
    MaintainResolution,
    Balanced,
}

/// Peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WebRtcConfig {
    pub degradation_preference: DegradationPreference,
    /// STUN servers, merged with the list the signalling server sends
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

/// Input configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct InputConfig {
    /// Key codes never forwarded to the application
    pub filtered_keys: Vec<u8>,
}

/// Stats configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    pub hud_enabled: bool,
    pub hud_interval_secs: u64,
    pub qp_report_interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            hud_enabled: false,
            hud_interval_secs: 5,
            qp_report_interval_ms: 1000,
        }
    }
}
