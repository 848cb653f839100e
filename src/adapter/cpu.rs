use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::convert::bgra_to_i420;
use super::{AdaptCallback, AdaptedBuffer, AdaptedFrame, FrameAdapterProcess};
use crate::capture::CapturedFrame;
use crate::error::{AppError, Result};
use crate::rhi::{Rhi, TextureDesc, TextureFormat, TextureRef};

/// Copies the texture into a BGRA staging texture, reads it back and
/// converts on the CPU
pub struct RhiToI420Cpu {
    rhi: Arc<dyn Rhi>,
    staging: Mutex<Option<TextureRef>>,
}

impl RhiToI420Cpu {
    pub fn new(rhi: Arc<dyn Rhi>) -> Self {
        Self {
            rhi,
            staging: Mutex::new(None),
        }
    }

    fn staging_for(&self, width: u32, height: u32) -> Option<TextureRef> {
        self.staging
            .lock()
            .as_ref()
            .filter(|t| t.width() == width && t.height() == height)
            .cloned()
    }
}

impl FrameAdapterProcess for RhiToI420Cpu {
    fn name(&self) -> &'static str {
        "RHIToI420CPU"
    }

    fn initialize(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(AppError::CaptureError(format!(
                "invalid adapter size {}x{}, I420 needs even dimensions",
                width, height
            )));
        }
        let staging = self
            .rhi
            .create_texture(TextureDesc::new(width, height, TextureFormat::Bgra8));
        *self.staging.lock() = Some(staging);
        debug!("{} initialized for {}x{}", self.name(), width, height);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.staging.lock().is_some()
    }

    fn begin_process(self: Arc<Self>, input: CapturedFrame, on_complete: AdaptCallback) {
        let (width, height) = (input.width(), input.height());
        let staging = match self.staging_for(width, height) {
            Some(staging) => staging,
            None => {
                if let Err(e) = self.initialize(width, height) {
                    on_complete(Err(e));
                    return;
                }
                match self.staging_for(width, height) {
                    Some(staging) => staging,
                    None => {
                        on_complete(Err(AppError::CaptureError(
                            "staging texture missing after initialize".to_string(),
                        )));
                        return;
                    }
                }
            }
        };

        // Same queue, so the readback sees the finished copy
        self.rhi.copy_texture(&input.texture, &staging);
        let this = self.clone();
        self.rhi.enqueue(Box::new(move || {
            let pixels = this.rhi.read_texture(&staging);
            let result = bgra_to_i420(&pixels, width, height)
                .map(|i420| AdaptedFrame::from_input(&input, AdaptedBuffer::I420(i420)));
            on_complete(result);
        }));
    }
}
