use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use super::convert::I420Buffer;
use super::{AdaptCallback, AdaptedBuffer, AdaptedFrame, FrameAdapterProcess};
use crate::capture::CapturedFrame;
use crate::error::{AppError, Result};
use crate::rhi::{Rhi, TextureDesc, TextureFormat, TextureRef};

struct Planes {
    width: u32,
    height: u32,
    y: TextureRef,
    u: TextureRef,
    v: TextureRef,
}

/// Converts on the GPU into three R8 planes, then reads each plane back
///
/// The plane textures are allocated once per size and reused. RHI commands
/// execute in order, so a conversion never overlaps the previous readback.
pub struct RhiToI420Compute {
    rhi: Arc<dyn Rhi>,
    planes: Mutex<Option<Planes>>,
}

impl RhiToI420Compute {
    pub fn new(rhi: Arc<dyn Rhi>) -> Self {
        Self {
            rhi,
            planes: Mutex::new(None),
        }
    }
}

impl FrameAdapterProcess for RhiToI420Compute {
    fn name(&self) -> &'static str {
        "RHIToI420Compute"
    }

    fn initialize(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(AppError::CaptureError(format!(
                "invalid adapter size {}x{}",
                width, height
            )));
        }
        let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
        *self.planes.lock() = Some(Planes {
            width,
            height,
            y: self
                .rhi
                .create_texture(TextureDesc::new(width, height, TextureFormat::R8)),
            u: self
                .rhi
                .create_texture(TextureDesc::new(cw, ch, TextureFormat::R8)),
            v: self
                .rhi
                .create_texture(TextureDesc::new(cw, ch, TextureFormat::R8)),
        });
        debug!("{} planes allocated for {}x{}", self.name(), width, height);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.planes.lock().is_some()
    }

    fn begin_process(self: Arc<Self>, input: CapturedFrame, on_complete: AdaptCallback) {
        let (width, height) = (input.width(), input.height());
        let current = self.planes.lock().as_ref().map(|p| (p.width, p.height));
        if current != Some((width, height)) {
            if let Err(e) = self.initialize(width, height) {
                on_complete(Err(e));
                return;
            }
        }

        let (y, u, v) = match self.planes.lock().as_ref() {
            Some(p) => (p.y.clone(), p.u.clone(), p.v.clone()),
            None => {
                on_complete(Err(AppError::CaptureError(
                    "compute planes missing".to_string(),
                )));
                return;
            }
        };

        let fence = self.rhi.convert_to_i420(&input.texture, &y, &u, &v);
        let this = self.clone();
        self.rhi.enqueue(Box::new(move || {
            if !fence.poll() {
                warn!("I420 readback ran before its conversion completed");
            }
            let y = this.rhi.read_texture(&y);
            let u = this.rhi.read_texture(&u);
            let v = this.rhi.read_texture(&v);
            let result = I420Buffer::from_planes(width, height, &y, &u, &v)
                .map(|buf| AdaptedFrame::from_input(&input, AdaptedBuffer::I420(buf)))
                .ok_or_else(|| AppError::CaptureError("short I420 plane readback".to_string()));
            on_complete(result);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{frame, run};
    use super::super::RhiToI420Cpu;
    use super::*;
    use crate::rhi::SoftwareRhi;

    #[test]
    fn test_compute_matches_cpu_path() {
        let rhi: Arc<dyn Rhi> = SoftwareRhi::start().unwrap();
        let compute = Arc::new(RhiToI420Compute::new(rhi.clone()));
        let cpu = Arc::new(RhiToI420Cpu::new(rhi));

        let input = frame(6, 4, [12, 200, 90, 255], 1);
        let a = run(compute, input.clone()).unwrap();
        let b = run(cpu, input).unwrap();
        assert_eq!(a.as_i420().unwrap().as_bytes(), b.as_i420().unwrap().as_bytes());
    }

    #[test]
    fn test_planes_reallocated_on_size_change() {
        let rhi = SoftwareRhi::start().unwrap();
        let compute = Arc::new(RhiToI420Compute::new(rhi));

        run(compute.clone(), frame(4, 4, [0, 0, 0, 255], 1)).unwrap();
        let out = run(compute.clone(), frame(8, 2, [0, 0, 0, 255], 2)).unwrap();
        assert_eq!((out.width, out.height), (8, 2));
        assert_eq!(out.as_i420().unwrap().len(), 8 * 2 + 2 * 4);
    }
}
