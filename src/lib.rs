//! pixel-streamer - render-frame streaming to browsers
//!
//! Captures rendered back-buffers, encodes them once with a shared encoder
//! and fans the result out to every connected player over WebRTC. Players
//! are brokered by a signalling server over WebSocket.

pub mod adapter;
pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod latency;
pub mod pump;
pub mod rhi;
pub mod session;
pub mod signalling;
pub mod stats;
pub mod streamer;
pub mod utils;

pub use error::{AppError, Result};
pub use streamer::Streamer;
