//! Stats collected for the overlay and for player feedback

pub mod store;

pub use store::{PeerStatCallback, PixelStreamingStats, StatEntry, SMOOTHING_FACTOR};

/// Well-known stat names
pub mod names {
    pub const ENCODER_QP: &str = "encoder.qp";
    pub const ENCODE_TIME_MS: &str = "encoder.time_ms";
    pub const FRAMES_ENCODED: &str = "encoder.frames";
    pub const FRAMES_SENT: &str = "video.frames_sent";
    pub const BYTES_SENT: &str = "video.bytes_sent";
    pub const PUMP_FPS: &str = "pump.fps";
    pub const CONNECTED_PLAYERS: &str = "players";
}
