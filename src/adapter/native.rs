use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{AdaptCallback, AdaptedBuffer, AdaptedFrame, FrameAdapterProcess};
use crate::capture::CapturedFrame;
use crate::error::Result;
use crate::rhi::Rhi;

/// Pass-through for encoders that read the texture directly
pub struct RhiToH264 {
    rhi: Arc<dyn Rhi>,
    initialized: AtomicBool,
}

impl RhiToH264 {
    pub fn new(rhi: Arc<dyn Rhi>) -> Self {
        Self {
            rhi,
            initialized: AtomicBool::new(false),
        }
    }
}

impl FrameAdapterProcess for RhiToH264 {
    fn name(&self) -> &'static str {
        "RHIToH264"
    }

    fn initialize(&self, _width: u32, _height: u32) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn begin_process(self: Arc<Self>, input: CapturedFrame, on_complete: AdaptCallback) {
        self.initialized.store(true, Ordering::Release);
        // Completion still goes through the RHI queue so it is ordered
        // after the copy that produced `input`
        self.rhi.enqueue(Box::new(move || {
            let texture = input.texture.clone();
            on_complete(Ok(AdaptedFrame::from_input(&input, AdaptedBuffer::Native(texture))));
        }));
    }
}
