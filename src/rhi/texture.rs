use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pixel layout of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    /// 8-bit RGBA, the usual back-buffer format
    Rgba8,
    /// 8-bit BGRA
    Bgra8,
    /// Single 8-bit channel, used for planar YUV output
    R8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Bgra8 => 4,
            TextureFormat::R8 => 1,
        }
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TextureFormat::Rgba8 => "RGBA8",
            TextureFormat::Bgra8 => "BGRA8",
            TextureFormat::R8 => "R8",
        };
        write!(f, "{}", name)
    }
}

/// Texture creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn rgba(width: u32, height: u32) -> Self {
        Self::new(width, height, TextureFormat::Rgba8)
    }

    /// Bytes between two rows
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn size_bytes(&self) -> usize {
        self.stride() * self.height as usize
    }
}

impl fmt::Display for TextureDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);

/// A GPU texture
///
/// Pixel storage is only touched by RHI commands and by readback.
/// Pipeline stages pass textures around as [`TextureRef`] and hand them
/// over by swapping references, never by copying pixels on the CPU.
pub struct Texture {
    id: u64,
    desc: TextureDesc,
    data: RwLock<Vec<u8>>,
}

/// Shared handle to a texture
pub type TextureRef = Arc<Texture>;

impl Texture {
    pub fn new(desc: TextureDesc) -> Self {
        Self {
            id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
            desc,
            data: RwLock::new(vec![0; desc.size_bytes()]),
        }
    }

    /// Create a texture initialised with `data`
    ///
    /// `data` shorter than the texture is zero-extended, longer is truncated.
    pub fn with_data(desc: TextureDesc, mut data: Vec<u8>) -> Self {
        data.resize(desc.size_bytes(), 0);
        Self {
            id: NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed),
            desc,
            data: RwLock::new(data),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    /// Overwrite the contents from CPU memory, as a renderer presenting a frame
    pub fn upload(&self, data: &[u8]) {
        let mut pixels = self.data.write();
        let n = pixels.len().min(data.len());
        pixels[..n].copy_from_slice(&data[..n]);
    }

    pub(crate) fn pixels(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub(crate) fn pixels_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_sizes() {
        let desc = TextureDesc::rgba(1920, 1080);
        assert_eq!(desc.stride(), 7680);
        assert_eq!(desc.size_bytes(), 1920 * 1080 * 4);
        assert_eq!(TextureDesc::new(8, 2, TextureFormat::R8).size_bytes(), 16);
        assert_eq!(desc.to_string(), "1920x1080 RGBA8");
    }

    #[test]
    fn test_texture_ids_are_unique() {
        let a = Texture::new(TextureDesc::rgba(4, 4));
        let b = Texture::new(TextureDesc::rgba(4, 4));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.pixels().len(), 64);
    }

    #[test]
    fn test_with_data_fits_storage() {
        let t = Texture::with_data(TextureDesc::new(2, 2, TextureFormat::R8), vec![1, 2]);
        assert_eq!(&t.pixels()[..], &[1, 2, 0, 0]);
    }

    #[test]
    fn test_upload_is_clamped_to_storage() {
        let t = Texture::new(TextureDesc::new(2, 1, TextureFormat::R8));
        t.upload(&[7, 8, 9]);
        assert_eq!(&t.pixels()[..], &[7, 8]);
    }
}
