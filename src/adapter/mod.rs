//! Frame adapters
//!
//! An adapter turns a captured texture into what the encoder consumes:
//! an I420 buffer for software encoders, or the texture itself for
//! encoders that read GPU memory directly. Work is issued on the RHI and
//! the completion callback runs on the RHI thread. Each in-flight
//! operation holds an `Arc` of its adapter, so dropping the last external
//! handle cannot free an adapter while its commands are still queued.

pub mod compute;
pub mod convert;
pub mod cpu;
pub mod native;

use std::sync::Arc;

pub use compute::RhiToI420Compute;
pub use convert::{bgra_to_i420, I420Buffer};
pub use cpu::RhiToI420Cpu;
pub use native::RhiToH264;

use crate::capture::CapturedFrame;
use crate::encoder::EncoderInputKind;
use crate::error::Result;
use crate::rhi::{Rhi, TextureRef};

/// Frame payload in the encoder's input format
#[derive(Debug, Clone)]
pub enum AdaptedBuffer {
    I420(I420Buffer),
    Native(TextureRef),
}

/// Output of an adapter
#[derive(Debug, Clone)]
pub struct AdaptedFrame {
    pub buffer: AdaptedBuffer,
    pub width: u32,
    pub height: u32,
    pub frame_id: u64,
    pub timestamp_us: i64,
}

impl AdaptedFrame {
    fn from_input(input: &CapturedFrame, buffer: AdaptedBuffer) -> Self {
        Self {
            buffer,
            width: input.width(),
            height: input.height(),
            frame_id: input.frame_id,
            timestamp_us: input.timestamp_us,
        }
    }

    pub fn as_i420(&self) -> Option<&I420Buffer> {
        match &self.buffer {
            AdaptedBuffer::I420(buf) => Some(buf),
            AdaptedBuffer::Native(_) => None,
        }
    }
}

/// Invoked on the RHI thread once adaptation finishes
pub type AdaptCallback = Box<dyn FnOnce(Result<AdaptedFrame>) + Send + 'static>;

pub trait FrameAdapterProcess: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate staging resources for the given output size
    fn initialize(&self, width: u32, height: u32) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Issue the conversion of `input`; `on_complete` runs on the RHI thread
    fn begin_process(self: Arc<Self>, input: CapturedFrame, on_complete: AdaptCallback);
}

/// Pick the adapter matching an encoder's input format
pub fn create_adapter(
    rhi: Arc<dyn Rhi>,
    input: EncoderInputKind,
    use_compute_shader: bool,
) -> Arc<dyn FrameAdapterProcess> {
    match input {
        EncoderInputKind::Native => Arc::new(RhiToH264::new(rhi)),
        EncoderInputKind::I420 if use_compute_shader => Arc::new(RhiToI420Compute::new(rhi)),
        EncoderInputKind::I420 => Arc::new(RhiToI420Cpu::new(rhi)),
    }
}
