//! Back-buffer capture
//!
//! [`FrameSource`] receives every rendered back-buffer and copies it into
//! one [`CapturerContext`] per simulcast layer. The frame pump later asks
//! for a [`PendingFrame`], which the encoder resolves into the newest
//! completed copies.

pub mod capturer_context;
pub mod frame;
pub mod frame_source;

pub use capturer_context::{CapturerContext, TextureObtainer};
pub use frame::{CapturedFrame, Layer, LayeredFrame};
pub use frame_source::{FrameSource, LayerFrameSource, PendingFrame};
