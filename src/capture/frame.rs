use std::fmt;

use crate::rhi::TextureRef;

/// A completed copy of a rendered frame
#[derive(Clone)]
pub struct CapturedFrame {
    pub texture: TextureRef,
    /// Microseconds since the capturer was created
    pub timestamp_us: i64,
    /// Per-capturer sequence number, starts at 1
    pub frame_id: u64,
}

impl CapturedFrame {
    pub fn width(&self) -> u32 {
        self.texture.width()
    }

    pub fn height(&self) -> u32 {
        self.texture.height()
    }
}

impl fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("frame_id", &self.frame_id)
            .field("timestamp_us", &self.timestamp_us)
            .field("texture", &self.texture.id())
            .field("size", &format_args!("{}x{}", self.width(), self.height()))
            .finish()
    }
}

/// One simulcast rendition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layer {
    pub scale: f32,
    pub width: u32,
    pub height: u32,
}

impl Layer {
    /// Layer for `scale` of a `width`x`height` capture
    ///
    /// Dimensions are rounded down to even values, with a floor of 2, so
    /// 4:2:0 chroma planes stay aligned.
    pub fn scaled(scale: f32, width: u32, height: u32) -> Self {
        let dim = |v: u32| (((v as f32 * scale) as u32) & !1).max(2);
        Self {
            scale,
            width: dim(width),
            height: dim(height),
        }
    }
}

/// The frames of every layer for one tick, highest quality first
#[derive(Debug, Clone)]
pub struct LayeredFrame {
    pub layers: Vec<CapturedFrame>,
}

impl LayeredFrame {
    pub fn frame_id(&self) -> u64 {
        self.layers.first().map(|f| f.frame_id).unwrap_or(0)
    }

    pub fn timestamp_us(&self) -> i64 {
        self.layers.first().map(|f| f.timestamp_us).unwrap_or(0)
    }

    pub fn layer(&self, index: usize) -> Option<&CapturedFrame> {
        self.layers.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_scaling_keeps_even_dims() {
        let full = Layer::scaled(1.0, 1920, 1080);
        assert_eq!((full.width, full.height), (1920, 1080));

        let half = Layer::scaled(0.5, 1281, 721);
        assert_eq!((half.width, half.height), (640, 360));

        let tiny = Layer::scaled(0.001, 100, 100);
        assert_eq!((tiny.width, tiny.height), (2, 2));
    }
}
