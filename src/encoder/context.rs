//! Shared encoder state
//!
//! One [`EncoderContext`] owns the real encoder (wrapped in a
//! [`SimulcastEncoderAdapter`]) for every peer. Each peer gets its own
//! [`PeerVideoEncoder`] shim; only the shim bound to the quality
//! controller drives encoding, and every encoded image is delivered to
//! all live shims.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::peer_encoder::PeerVideoEncoder;
use super::simulcast::SimulcastEncoderAdapter;
use super::traits::{EncodedImage, EncoderConfig, EncoderCreator, RateControlParameters, VideoCodecSettings};
use crate::adapter::{create_adapter, AdaptedFrame, FrameAdapterProcess};
use crate::capture::PendingFrame;
use crate::config::{EncoderSettings, SimulcastLayerConfig};
use crate::error::{EncoderError, Result};
use crate::rhi::Rhi;
use crate::signalling::PlayerId;
use crate::utils::{Executor, LogThrottler};
use crate::warn_throttled;

/// Hooks into the encode path, used for stats and latency measurement
pub trait EncodeObserver: Send + Sync {
    /// A frame was obtained from the capture buffers and enters adaptation
    fn on_frame_obtained(&self, _frame_id: u64) {}

    /// An image came out of the encoder
    fn on_encoded(&self, _image: &EncodedImage, _encode_time: Duration) {}
}

/// Whether a rate request reached the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatesOutcome {
    Applied,
    /// Stored until the requesting player becomes quality controller
    Deferred,
}

#[derive(Default)]
struct EncodingState {
    encoder: Option<SimulcastEncoderAdapter>,
    controller: Option<PlayerId>,
    pending_rates: HashMap<PlayerId, RateControlParameters>,
}

/// Join point for the per-layer adapter completions of one frame
struct AdaptJob {
    remaining: AtomicUsize,
    frames: Mutex<Vec<Option<AdaptedFrame>>>,
    failed: AtomicBool,
}

impl AdaptJob {
    fn new(layers: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(layers),
            frames: Mutex::new(vec![None; layers]),
            failed: AtomicBool::new(false),
        }
    }

    /// Record one layer; returns true for the last one
    fn complete(&self, index: usize, result: Result<AdaptedFrame>) -> bool {
        match result {
            Ok(frame) => self.frames.lock()[index] = Some(frame),
            Err(e) => {
                warn!("Layer {} adaptation failed: {}", index, e);
                self.failed.store(true, Ordering::Release);
            }
        }
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn take(&self) -> Option<Vec<AdaptedFrame>> {
        if self.failed.load(Ordering::Acquire) {
            return None;
        }
        std::mem::take(&mut *self.frames.lock())
            .into_iter()
            .collect()
    }
}

pub struct EncoderContext {
    rhi: Arc<dyn Rhi>,
    creator: EncoderCreator,
    settings: EncoderSettings,
    layers: Vec<SimulcastLayerConfig>,
    /// Encoding critical section: guards the encoder and the controller
    encoding: Mutex<EncodingState>,
    adapters: RwLock<Vec<Arc<dyn FrameAdapterProcess>>>,
    sinks: RwLock<Vec<Weak<PeerVideoEncoder>>>,
    worker: Executor,
    keyframe_requested: AtomicBool,
    observer: RwLock<Option<Weak<dyn EncodeObserver>>>,
    frames_encoded: AtomicU64,
    throttler: LogThrottler,
}

impl EncoderContext {
    pub fn new(
        rhi: Arc<dyn Rhi>,
        creator: EncoderCreator,
        settings: EncoderSettings,
        layers: Vec<SimulcastLayerConfig>,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            rhi,
            creator,
            settings,
            layers,
            encoding: Mutex::new(EncodingState::default()),
            adapters: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            worker: Executor::spawn("encoder")?,
            keyframe_requested: AtomicBool::new(false),
            observer: RwLock::new(None),
            frames_encoded: AtomicU64::new(0),
            throttler: LogThrottler::default(),
        }))
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn set_observer(&self, observer: Weak<dyn EncodeObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn EncodeObserver>> {
        self.observer.read().as_ref().and_then(|o| o.upgrade())
    }

    /// Create the shared encoder if no peer has done so yet
    pub fn init_encoder(&self, settings: &VideoCodecSettings) -> std::result::Result<(), EncoderError> {
        if settings.codec != self.settings.codec {
            return Err(EncoderError::InvalidParameter(format!(
                "codec {} requested, {} configured",
                settings.codec, self.settings.codec
            )));
        }

        let mut state = self.encoding.lock();
        if state.encoder.is_some() {
            return Ok(());
        }

        let mut base = EncoderConfig::from_settings(
            &self.settings,
            settings.width,
            settings.height,
            settings.max_framerate,
        );
        base.target_bitrate_bps = settings
            .start_bitrate_bps
            .min(self.settings.max_bitrate_bps);
        base.max_bitrate_bps = settings.max_bitrate_bps.min(self.settings.max_bitrate_bps);

        let encoder = SimulcastEncoderAdapter::new(&self.creator, &base, &self.layers)?;
        let adapters: Vec<Arc<dyn FrameAdapterProcess>> = (0..encoder.stream_count())
            .map(|_| {
                create_adapter(
                    self.rhi.clone(),
                    encoder.input_kind(),
                    self.settings.use_compute_shader,
                )
            })
            .collect();
        info!(
            "Shared encoder created: {} {}x{} @ {} bps, adapter {}",
            self.settings.codec,
            settings.width,
            settings.height,
            base.target_bitrate_bps,
            adapters.first().map(|a| a.name()).unwrap_or("none")
        );

        *self.adapters.write() = adapters;
        state.encoder = Some(encoder);
        self.keyframe_requested.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_encoder_initialized(&self) -> bool {
        self.encoding.lock().encoder.is_some()
    }

    /// Drop the shared encoder and adapters
    pub fn release_encoder(&self) {
        let mut state = self.encoding.lock();
        if state.encoder.take().is_some() {
            info!("Shared encoder released");
        }
        self.adapters.write().clear();
    }

    pub fn controller(&self) -> Option<PlayerId> {
        self.encoding.lock().controller.clone()
    }

    pub fn is_controller(&self, player: &PlayerId) -> bool {
        self.encoding.lock().controller.as_ref() == Some(player)
    }

    /// Swap the quality controller
    ///
    /// Runs under the encoding lock so it cannot interleave with an
    /// encode or a rate change. Rates the new controller requested earlier
    /// are applied now.
    pub fn set_controller(&self, player: Option<PlayerId>) {
        let mut state = self.encoding.lock();
        if state.controller == player {
            return;
        }
        debug!("Encoder controller: {:?} -> {:?}", state.controller, player);
        state.controller = player.clone();

        if let Some(player) = player {
            if let Some(rates) = state.pending_rates.remove(&player) {
                let max = self.settings.max_bitrate_bps;
                if let Some(encoder) = state.encoder.as_mut() {
                    if let Err(e) = encoder.set_rates(rates.bitrate_bps.min(max), rates.framerate_fps)
                    {
                        warn!("Failed to apply pending rates of {}: {}", player, e);
                    }
                }
            }
        }
        self.keyframe_requested.store(true, Ordering::Release);
    }

    /// Rate request from `player`'s bandwidth estimator
    pub fn set_rates(
        &self,
        player: &PlayerId,
        params: RateControlParameters,
    ) -> std::result::Result<RatesOutcome, EncoderError> {
        let mut state = self.encoding.lock();
        if state.controller.as_ref() != Some(player) {
            trace!("Deferring rates from non-controller {}", player);
            state.pending_rates.insert(player.clone(), params);
            return Ok(RatesOutcome::Deferred);
        }
        if let Some(encoder) = state.encoder.as_mut() {
            let bitrate = params.bitrate_bps.min(self.settings.max_bitrate_bps);
            encoder.set_rates(bitrate, params.framerate_fps)?;
        }
        Ok(RatesOutcome::Applied)
    }

    /// Forget everything stored for a departed player
    pub fn remove_player(&self, player: &PlayerId) {
        let mut state = self.encoding.lock();
        state.pending_rates.remove(player);
        if state.controller.as_ref() == Some(player) {
            state.controller = None;
        }
    }

    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Release);
    }

    /// Encodes that delivered at least one image
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    pub(crate) fn register_sink(&self, sink: &Arc<PeerVideoEncoder>) {
        let mut sinks = self.sinks.write();
        sinks.retain(|s| s.strong_count() > 0);
        sinks.push(Arc::downgrade(sink));
    }

    /// Remove a sink; returns how many live sinks remain
    pub(crate) fn unregister_sink(&self, sink: &PeerVideoEncoder) -> usize {
        let mut sinks = self.sinks.write();
        sinks.retain(|s| s.strong_count() > 0 && !std::ptr::eq(s.as_ptr(), sink));
        sinks.len()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks
            .read()
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    /// Adapt and encode the pending frame on behalf of `player`
    ///
    /// Returns immediately; adaptation runs on the RHI and encoding on the
    /// encode worker. Nothing happens unless `player` is the controller.
    pub fn encode_frame(
        self: &Arc<Self>,
        player: &PlayerId,
        pending: PendingFrame,
    ) -> std::result::Result<(), EncoderError> {
        if !self.is_controller(player) {
            return Ok(());
        }
        let adapters = self.adapters.read().clone();
        if adapters.is_empty() {
            return Err(EncoderError::Uninitialized);
        }

        let frame = match pending.obtain() {
            Some(frame) => frame,
            None => {
                warn_throttled!(self.throttler, "no_frame", "No captured frame to encode");
                return Ok(());
            }
        };
        if frame.layers.len() != adapters.len() {
            return Err(EncoderError::InvalidParameter(format!(
                "{} captured layer(s) for {} stream(s)",
                frame.layers.len(),
                adapters.len()
            )));
        }
        if let Some(observer) = self.observer() {
            observer.on_frame_obtained(frame.frame_id());
        }

        let job = Arc::new(AdaptJob::new(adapters.len()));
        for (index, (adapter, input)) in adapters.into_iter().zip(frame.layers).enumerate() {
            let ctx = self.clone();
            let job = job.clone();
            adapter.begin_process(
                input,
                Box::new(move |result| {
                    if job.complete(index, result) {
                        ctx.submit_encode(&job);
                    }
                }),
            );
        }
        Ok(())
    }

    fn submit_encode(self: &Arc<Self>, job: &AdaptJob) {
        let Some(frames) = job.take() else {
            warn_throttled!(self.throttler, "adapt_failed", "Dropping frame, adaptation failed");
            return;
        };
        let ctx = self.clone();
        self.worker.post(Box::new(move || ctx.encode_adapted(frames)));
    }

    fn encode_adapted(&self, frames: Vec<AdaptedFrame>) {
        let force_keyframe = self.keyframe_requested.swap(false, Ordering::AcqRel);
        let started = Instant::now();

        let result = {
            let mut state = self.encoding.lock();
            match state.encoder.as_mut() {
                Some(encoder) => encoder.encode(&frames, force_keyframe),
                None => return,
            }
        };

        match result {
            Ok(images) if images.is_empty() => {
                trace!("Encoder buffered frame {:?}", frames.first().map(|f| f.frame_id));
                if force_keyframe {
                    self.keyframe_requested.store(true, Ordering::Release);
                }
            }
            Ok(images) => {
                let elapsed = started.elapsed();
                self.frames_encoded.fetch_add(1, Ordering::Relaxed);
                let observer = self.observer();
                for image in &images {
                    if let Some(observer) = &observer {
                        observer.on_encoded(image, elapsed);
                    }
                    self.broadcast(image);
                }
            }
            Err(e) => {
                error!("Encode failed: {}", e);
                if force_keyframe {
                    self.keyframe_requested.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Deliver one image to every live shim
    fn broadcast(&self, image: &EncodedImage) {
        let sinks: Vec<Arc<PeerVideoEncoder>> =
            self.sinks.read().iter().filter_map(|s| s.upgrade()).collect();
        for sink in sinks {
            sink.send_encoded_image(image);
        }
    }

    /// Block until queued encodes have run
    #[cfg(test)]
    pub(crate) fn drain_worker(&self) {
        self.worker.drain();
    }
}
