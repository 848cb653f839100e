//! CPU implementation of the RHI
//!
//! Commands run on one dedicated thread in submission order, which gives
//! the same ordering guarantees a single GPU queue does.

use std::sync::Arc;

use super::{GpuFence, Rhi, RhiCommand, Texture, TextureDesc, TextureFormat, TextureRef};
use crate::adapter::convert::{convert_to_planes, I420Buffer};
use crate::error::Result;
use crate::utils::Executor;
use tracing::warn;

pub struct SoftwareRhi {
    thread: Executor,
}

impl SoftwareRhi {
    /// Start the RHI thread
    pub fn start() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            thread: Executor::spawn("rhi")?,
        }))
    }

    /// Whether the caller is running on the RHI thread
    pub fn is_rhi_thread(&self) -> bool {
        self.thread.is_current()
    }

    fn submit_fenced<F>(&self, name: &'static str, work: F) -> Arc<GpuFence>
    where
        F: FnOnce() + Send + 'static,
    {
        let fence = Arc::new(GpuFence::new(name));
        let signal = fence.clone();
        self.thread.post(Box::new(move || {
            work();
            signal.signal();
        }));
        fence
    }
}

impl Rhi for SoftwareRhi {
    fn create_texture(&self, desc: TextureDesc) -> TextureRef {
        Arc::new(Texture::new(desc))
    }

    fn copy_texture(&self, src: &TextureRef, dst: &TextureRef) -> Arc<GpuFence> {
        let src = src.clone();
        let dst = dst.clone();
        self.submit_fenced("copy", move || {
            let input = src.pixels();
            let mut output = dst.pixels_mut();
            scale_copy(src.desc(), &input, dst.desc(), &mut output);
        })
    }

    fn convert_to_i420(
        &self,
        src: &TextureRef,
        y: &TextureRef,
        u: &TextureRef,
        v: &TextureRef,
    ) -> Arc<GpuFence> {
        let (src, y, u, v) = (src.clone(), y.clone(), u.clone(), v.clone());
        self.submit_fenced("i420", move || {
            let (y_size, uv_size) = I420Buffer::plane_sizes(src.width(), src.height());
            let mut y_out = y.pixels_mut();
            let mut u_out = u.pixels_mut();
            let mut v_out = v.pixels_mut();
            if y_out.len() < y_size || u_out.len() < uv_size || v_out.len() < uv_size {
                warn!(
                    "I420 planes too small for {}, conversion skipped",
                    src.desc()
                );
                return;
            }
            convert_to_planes(
                &src.pixels(),
                src.width(),
                src.height(),
                src.format(),
                &mut y_out,
                &mut u_out,
                &mut v_out,
            );
        })
    }

    fn enqueue(&self, command: RhiCommand) {
        self.thread.post(command);
    }
}

/// Nearest-neighbour scaling copy with format swizzle
pub(crate) fn scale_copy(src: TextureDesc, input: &[u8], dst: TextureDesc, output: &mut [u8]) {
    if src.width == 0 || src.height == 0 || dst.width == 0 || dst.height == 0 {
        return;
    }
    let sbpp = src.format.bytes_per_pixel();
    let dbpp = dst.format.bytes_per_pixel();

    for row in 0..dst.height as usize {
        let sy = row * src.height as usize / dst.height as usize;
        for col in 0..dst.width as usize {
            let sx = col * src.width as usize / dst.width as usize;
            let s = sy * src.stride() + sx * sbpp;
            let d = row * dst.stride() + col * dbpp;
            let px = read_rgba(&input[s..s + sbpp], src.format);
            write_rgba(&mut output[d..d + dbpp], dst.format, px);
        }
    }
}

fn read_rgba(px: &[u8], format: TextureFormat) -> [u8; 4] {
    match format {
        TextureFormat::Rgba8 => [px[0], px[1], px[2], px[3]],
        TextureFormat::Bgra8 => [px[2], px[1], px[0], px[3]],
        TextureFormat::R8 => [px[0], px[0], px[0], 255],
    }
}

fn write_rgba(px: &mut [u8], format: TextureFormat, rgba: [u8; 4]) {
    match format {
        TextureFormat::Rgba8 => px.copy_from_slice(&rgba),
        TextureFormat::Bgra8 => px.copy_from_slice(&[rgba[2], rgba[1], rgba[0], rgba[3]]),
        TextureFormat::R8 => px[0] = rgba[0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_copy_scales_and_signals_fence() {
        let rhi = SoftwareRhi::start().unwrap();
        // 4x2 source: left half red, right half blue
        let mut data = Vec::new();
        for _ in 0..2 {
            for col in 0..4 {
                if col < 2 {
                    data.extend_from_slice(&[255, 0, 0, 255]);
                } else {
                    data.extend_from_slice(&[0, 0, 255, 255]);
                }
            }
        }
        let src = Arc::new(Texture::with_data(TextureDesc::rgba(4, 2), data));
        let dst = rhi.create_texture(TextureDesc::new(2, 1, TextureFormat::Bgra8));

        let fence = rhi.copy_texture(&src, &dst);
        fence.spin_wait();

        let out = rhi.read_texture(&dst);
        assert_eq!(&out[0..4], &[0, 0, 255, 255]);
        assert_eq!(&out[4..8], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_commands_run_in_order_on_rhi_thread() {
        let rhi = SoftwareRhi::start().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..10 {
            let counter = counter.clone();
            let seen = seen.clone();
            let rhi2 = rhi.clone();
            rhi.enqueue(Box::new(move || {
                assert!(rhi2.is_rhi_thread());
                seen.lock().push(i);
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        rhi.flush().spin_wait();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert!(!rhi.is_rhi_thread());
    }

    #[test]
    fn test_compute_conversion_fills_planes() {
        let rhi = SoftwareRhi::start().unwrap();
        let src = Arc::new(Texture::with_data(
            TextureDesc::rgba(2, 2),
            [255u8, 255, 255, 255].repeat(4),
        ));
        let y = rhi.create_texture(TextureDesc::new(2, 2, TextureFormat::R8));
        let u = rhi.create_texture(TextureDesc::new(1, 1, TextureFormat::R8));
        let v = rhi.create_texture(TextureDesc::new(1, 1, TextureFormat::R8));

        rhi.convert_to_i420(&src, &y, &u, &v).spin_wait();
        assert_eq!(rhi.read_texture(&y), vec![235; 4]);
        assert_eq!(rhi.read_texture(&u), vec![128]);
        assert_eq!(rhi.read_texture(&v), vec![128]);
    }
}
