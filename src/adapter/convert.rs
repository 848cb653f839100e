//! I420 buffers and RGB to I420 conversion
//!
//! The CPU path hands BGRA readbacks to `dcv-color-primitives`. The software
//! RHI's compute pass uses [`convert_to_planes`], which averages chroma over
//! each 2x2 block and rounds odd sizes up. Both are BT.601 limited range.

use bytes::Bytes;
use dcv_color_primitives::{convert_image, ColorSpace, ImageFormat, PixelFormat};

use crate::error::{AppError, Result};
use crate::rhi::TextureFormat;

/// Planar YUV 4:2:0 frame
#[derive(Clone)]
pub struct I420Buffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl I420Buffer {
    pub fn new(width: u32, height: u32) -> Self {
        let (y, uv) = Self::plane_sizes(width, height);
        Self {
            data: vec![0; y + uv * 2],
            width,
            height,
        }
    }

    /// Assemble a buffer from separately produced planes
    pub fn from_planes(width: u32, height: u32, y: &[u8], u: &[u8], v: &[u8]) -> Option<Self> {
        let (y_size, uv_size) = Self::plane_sizes(width, height);
        if y.len() < y_size || u.len() < uv_size || v.len() < uv_size {
            return None;
        }
        let mut data = Vec::with_capacity(y_size + uv_size * 2);
        data.extend_from_slice(&y[..y_size]);
        data.extend_from_slice(&u[..uv_size]);
        data.extend_from_slice(&v[..uv_size]);
        Some(Self {
            data,
            width,
            height,
        })
    }

    /// (luma bytes, bytes per chroma plane)
    pub fn plane_sizes(width: u32, height: u32) -> (usize, usize) {
        let (cw, ch) = chroma_dims(width, height);
        (width as usize * height as usize, cw * ch)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma_width(&self) -> usize {
        chroma_dims(self.width, self.height).0
    }

    pub fn y_plane(&self) -> &[u8] {
        let (y, _) = Self::plane_sizes(self.width, self.height);
        &self.data[..y]
    }

    pub fn u_plane(&self) -> &[u8] {
        let (y, uv) = Self::plane_sizes(self.width, self.height);
        &self.data[y..y + uv]
    }

    pub fn v_plane(&self) -> &[u8] {
        let (y, uv) = Self::plane_sizes(self.width, self.height);
        &self.data[y + uv..]
    }

    /// Y, U and V planes for writing
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (y_size, uv_size) = Self::plane_sizes(self.width, self.height);
        let (y, chroma) = self.data.split_at_mut(y_size);
        let (u, v) = chroma.split_at_mut(uv_size);
        (y, u, v)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl std::fmt::Debug for I420Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "I420Buffer({}x{})", self.width, self.height)
    }
}

fn chroma_dims(width: u32, height: u32) -> (usize, usize) {
    (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
}

#[inline]
fn rgb_at(src: &[u8], offset: usize, format: TextureFormat) -> (i32, i32, i32) {
    match format {
        TextureFormat::Rgba8 => (
            src[offset] as i32,
            src[offset + 1] as i32,
            src[offset + 2] as i32,
        ),
        TextureFormat::Bgra8 => (
            src[offset + 2] as i32,
            src[offset + 1] as i32,
            src[offset] as i32,
        ),
        TextureFormat::R8 => {
            let l = src[offset] as i32;
            (l, l, l)
        }
    }
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Convert packed pixels into three planes
///
/// Plane slices must hold at least `I420Buffer::plane_sizes` bytes.
pub fn convert_to_planes(
    src: &[u8],
    width: u32,
    height: u32,
    format: TextureFormat,
    y_plane: &mut [u8],
    u_plane: &mut [u8],
    v_plane: &mut [u8],
) {
    let w = width as usize;
    let h = height as usize;
    let bpp = format.bytes_per_pixel();
    let stride = w * bpp;
    let (cw, ch) = chroma_dims(width, height);

    for row in 0..h {
        for col in 0..w {
            let (r, g, b) = rgb_at(src, row * stride + col * bpp, format);
            y_plane[row * w + col] = luma(r, g, b);
        }
    }

    for crow in 0..ch {
        for ccol in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for dy in 0..2 {
                for dx in 0..2 {
                    let row = crow * 2 + dy;
                    let col = ccol * 2 + dx;
                    if row < h && col < w {
                        let (pr, pg, pb) = rgb_at(src, row * stride + col * bpp, format);
                        r += pr;
                        g += pg;
                        b += pb;
                        n += 1;
                    }
                }
            }
            let (u, v) = chroma(r / n, g / n, b / n);
            u_plane[crow * cw + ccol] = u;
            v_plane[crow * cw + ccol] = v;
        }
    }
}

/// Convert tightly packed BGRA into a new I420 buffer
///
/// Width and height must be even.
pub fn bgra_to_i420(src: &[u8], width: u32, height: u32) -> Result<I420Buffer> {
    let src_format = ImageFormat {
        pixel_format: PixelFormat::Bgra,
        color_space: ColorSpace::Rgb,
        num_planes: 1,
    };
    let dst_format = ImageFormat {
        pixel_format: PixelFormat::I420,
        color_space: ColorSpace::Bt601,
        num_planes: 3,
    };

    let mut out = I420Buffer::new(width, height);
    let (y, u, v) = out.planes_mut();
    convert_image(
        width,
        height,
        &src_format,
        None,
        &[src],
        &dst_format,
        None,
        &mut [y, u, v],
    )
    .map_err(|e| AppError::CaptureError(format!("BGRA to I420 at {}x{}: {}", width, height, e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, px: [u8; 4]) -> Vec<u8> {
        px.iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect()
    }

    fn planes(src: &[u8], width: u32, height: u32, format: TextureFormat) -> I420Buffer {
        let mut out = I420Buffer::new(width, height);
        let (y, u, v) = out.planes_mut();
        convert_to_planes(src, width, height, format, y, u, v);
        out
    }

    fn near(actual: u8, expected: u8) -> bool {
        actual.abs_diff(expected) <= 1
    }

    #[test]
    fn test_plane_sizes_round_up() {
        assert_eq!(I420Buffer::plane_sizes(4, 4), (16, 4));
        assert_eq!(I420Buffer::plane_sizes(5, 3), (15, 6));
        assert_eq!(I420Buffer::new(1280, 720).len(), 1280 * 720 * 3 / 2);
    }

    #[test]
    fn test_white_and_black() {
        let white = planes(&solid(4, 4, [255, 255, 255, 255]), 4, 4, TextureFormat::Rgba8);
        assert!(white.y_plane().iter().all(|&y| y == 235));
        assert!(white.u_plane().iter().all(|&u| u == 128));
        assert!(white.v_plane().iter().all(|&v| v == 128));

        let black = planes(&solid(2, 2, [0, 0, 0, 255]), 2, 2, TextureFormat::Rgba8);
        assert_eq!(black.y_plane(), &[16, 16, 16, 16]);
    }

    #[test]
    fn test_red_matches_bt601() {
        let rgba = planes(&solid(2, 2, [255, 0, 0, 255]), 2, 2, TextureFormat::Rgba8);
        assert_eq!(rgba.y_plane()[0], 82);
        assert_eq!(rgba.u_plane(), &[90]);
        assert_eq!(rgba.v_plane(), &[240]);

        // Same colour in BGRA order
        let bgra = planes(&solid(2, 2, [0, 0, 255, 255]), 2, 2, TextureFormat::Bgra8);
        assert_eq!(bgra.as_bytes(), rgba.as_bytes());
    }

    #[test]
    fn test_library_conversion_matches_bt601() {
        let red = bgra_to_i420(&solid(4, 2, [0, 0, 255, 255]), 4, 2).unwrap();
        assert!(red.y_plane().iter().all(|&y| near(y, 82)));
        assert!(red.u_plane().iter().all(|&u| near(u, 90)));
        assert!(red.v_plane().iter().all(|&v| near(v, 240)));

        let white = bgra_to_i420(&solid(2, 2, [255, 255, 255, 255]), 2, 2).unwrap();
        assert!(white.y_plane().iter().all(|&y| near(y, 235)));
        assert!(white.u_plane().iter().all(|&u| near(u, 128)));
    }

    #[test]
    fn test_library_conversion_agrees_with_compute_path() {
        let mut src = Vec::new();
        for i in 0..(8 * 4) as u32 {
            src.extend_from_slice(&[(i * 7) as u8, (i * 13) as u8, (i * 29) as u8, 255]);
        }
        let library = bgra_to_i420(&src, 8, 4).unwrap();
        let compute = planes(&src, 8, 4, TextureFormat::Bgra8);
        for (a, b) in library.y_plane().iter().zip(compute.y_plane()) {
            assert!(a.abs_diff(*b) <= 2, "luma {} vs {}", a, b);
        }
    }

    #[test]
    fn test_library_conversion_rejects_short_input() {
        assert!(bgra_to_i420(&[0; 8], 4, 4).is_err());
    }

    #[test]
    fn test_from_planes_rejects_short_input() {
        assert!(I420Buffer::from_planes(4, 4, &[0; 16], &[0; 4], &[0; 3]).is_none());
        let buf = I420Buffer::from_planes(4, 4, &[1; 16], &[2; 4], &[3; 4]).unwrap();
        assert_eq!(buf.u_plane(), &[2, 2, 2, 2]);
        assert_eq!(buf.v_plane(), &[3, 3, 3, 3]);
    }
}
