//! Frame pump and per-player video sources

pub mod frame_pump;
pub mod video_source;

pub use frame_pump::{join_pump, ControllerListener, FramePump, PumpStats, MAX_FPS, MIN_FPS};
pub use video_source::{PlayerVideoSource, VideoFrame, VideoSink};
