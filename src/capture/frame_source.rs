//! Per-layer frame sources fed from the renderer back-buffer

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::capturer_context::{CapturerContext, TextureObtainer};
use super::frame::{Layer, LayeredFrame};
use crate::config::{CaptureConfig, CaptureSize};
use crate::rhi::{Rhi, TextureRef};

/// One simulcast layer with its own triple buffer
pub struct LayerFrameSource {
    layer: Mutex<Layer>,
    context: Arc<CapturerContext>,
}

impl LayerFrameSource {
    fn new(rhi: Arc<dyn Rhi>, layer: Layer, fixed_resolution: bool) -> Self {
        Self {
            context: CapturerContext::new(rhi, layer.width, layer.height, fixed_resolution),
            layer: Mutex::new(layer),
        }
    }

    pub fn layer(&self) -> Layer {
        *self.layer.lock()
    }

    pub fn context(&self) -> &Arc<CapturerContext> {
        &self.context
    }

    fn on_backbuffer_ready(&self, texture: &TextureRef) {
        self.context.capture_frame(texture);
    }

    fn resize(&self, width: u32, height: u32) {
        let mut layer = self.layer.lock();
        *layer = Layer::scaled(layer.scale, width, height);
        self.context.set_capture_resolution(layer.width, layer.height);
    }
}

/// Deferred frame for every layer, resolved when the encoder runs
pub struct PendingFrame {
    obtainers: Vec<TextureObtainer>,
}

impl PendingFrame {
    pub fn layer_count(&self) -> usize {
        self.obtainers.len()
    }

    /// Swap in the newest completed copy of every layer
    pub fn obtain(self) -> Option<LayeredFrame> {
        let layers = self
            .obtainers
            .into_iter()
            .map(|obtain| obtain())
            .collect::<Option<Vec<_>>>()?;
        Some(LayeredFrame { layers })
    }
}

/// Captures the back-buffer into one triple buffer per layer
pub struct FrameSource {
    rhi: Arc<dyn Rhi>,
    scales: Vec<f32>,
    capture_size: Option<CaptureSize>,
    disable_resolution_change: bool,
    layers: RwLock<Vec<LayerFrameSource>>,
    backbuffer_size: Mutex<Option<(u32, u32)>>,
    initialized: AtomicBool,
}

impl FrameSource {
    /// `scales` lists the simulcast layer scales, highest quality first
    pub fn new(rhi: Arc<dyn Rhi>, scales: Vec<f32>, capture: &CaptureConfig) -> Self {
        let scales = if scales.is_empty() { vec![1.0] } else { scales };
        Self {
            rhi,
            scales,
            capture_size: capture.capture_size,
            disable_resolution_change: capture.disable_resolution_change,
            layers: RwLock::new(Vec::new()),
            backbuffer_size: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Create the layer sources for a back-buffer of the given size
    pub fn initialize(&self, backbuffer_width: u32, backbuffer_height: u32) {
        let (width, height) = match self.capture_size {
            Some(size) => (size.width, size.height),
            None => (backbuffer_width, backbuffer_height),
        };
        let fixed = self.capture_size.is_some() || self.disable_resolution_change;

        let layers: Vec<LayerFrameSource> = self
            .scales
            .iter()
            .map(|&scale| {
                LayerFrameSource::new(self.rhi.clone(), Layer::scaled(scale, width, height), fixed)
            })
            .collect();
        info!(
            "Frame source initialized: {}x{}, {} layer(s), fixed={}",
            width,
            height,
            layers.len(),
            fixed
        );

        *self.layers.write() = layers;
        *self.backbuffer_size.lock() = Some((backbuffer_width, backbuffer_height));
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Called by the renderer each time a back-buffer is presented
    pub fn on_backbuffer_ready(&self, texture: &TextureRef) {
        let size = (texture.width(), texture.height());
        if !self.is_initialized() {
            self.initialize(size.0, size.1);
        }

        {
            let mut tracked = self.backbuffer_size.lock();
            if *tracked != Some(size) {
                debug!("Back-buffer size changed: {:?} -> {:?}", *tracked, size);
                *tracked = Some(size);
                if self.capture_size.is_none() && !self.disable_resolution_change {
                    for layer in self.layers.read().iter() {
                        layer.resize(size.0, size.1);
                    }
                }
            }
        }

        for layer in self.layers.read().iter() {
            layer.on_backbuffer_ready(texture);
        }
    }

    /// Whether every layer has a completed frame
    pub fn is_available(&self) -> bool {
        let layers = self.layers.read();
        !layers.is_empty() && layers.iter().all(|l| l.context.has_frame())
    }

    /// Deferred frame for every layer
    pub fn request_frame(&self) -> Option<PendingFrame> {
        if !self.is_available() {
            return None;
        }
        let obtainers = self
            .layers
            .read()
            .iter()
            .map(|l| l.context.request_newest_captured_frame())
            .collect();
        Some(PendingFrame { obtainers })
    }

    pub fn layers(&self) -> Vec<Layer> {
        self.layers.read().iter().map(|l| l.layer()).collect()
    }

    pub fn layer_count(&self) -> usize {
        self.scales.len()
    }

    /// Capture size of the top layer
    pub fn capture_resolution(&self) -> Option<(u32, u32)> {
        self.layers
            .read()
            .first()
            .map(|l| l.context.resolution())
    }
}
