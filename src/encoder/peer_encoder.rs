//! Per-peer encoder shim
//!
//! The peer connection expects an encoder object of its own. The shim
//! looks like one but forwards to the shared [`EncoderContext`]. It only
//! learns which player it serves from the probe frame the pump sends when
//! the player's video source is added.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use super::context::EncoderContext;
use super::traits::{EncodedImage, RateControlParameters, VideoCodecSettings};
use crate::error::{CODEC_ERR_PARAMETER, CODEC_OK, CODEC_UNINITIALIZED};
use crate::pump::{VideoFrame, VideoSink};
use crate::signalling::PlayerId;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Receives every encoded image delivered to this peer
pub type EncodedImageCallback = Box<dyn Fn(&EncodedImage) + Send + Sync>;

pub struct PeerVideoEncoder {
    id: u64,
    context: Arc<EncoderContext>,
    player_id: RwLock<Option<PlayerId>>,
    callback: RwLock<Option<EncodedImageCallback>>,
    settings: Mutex<Option<VideoCodecSettings>>,
    unbound_rates: Mutex<Option<RateControlParameters>>,
    registered: AtomicBool,
    throttler: LogThrottler,
}

impl PeerVideoEncoder {
    pub(crate) fn new(id: u64, context: Arc<EncoderContext>) -> Self {
        Self {
            id,
            context,
            player_id: RwLock::new(None),
            callback: RwLock::new(None),
            settings: Mutex::new(None),
            unbound_rates: Mutex::new(None),
            registered: AtomicBool::new(false),
            throttler: LogThrottler::default(),
        }
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Player this shim was bound to by its probe frame
    pub fn player_id(&self) -> Option<PlayerId> {
        self.player_id.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.settings.lock().is_some()
    }

    /// Prepare for encoding; creates the shared encoder on first use
    ///
    /// On failure the shim is released and a negative code returned.
    pub fn init_encode(self: &Arc<Self>, settings: &VideoCodecSettings) -> i32 {
        if !self.registered.swap(true, Ordering::AcqRel) {
            self.context.register_sink(self);
        }
        match self.context.init_encoder(settings) {
            Ok(()) => {
                debug!(
                    "Peer encoder {} initialized: {} {}x{}",
                    self.id, settings.codec, settings.width, settings.height
                );
                *self.settings.lock() = Some(settings.clone());
                CODEC_OK
            }
            Err(e) => {
                error!("Peer encoder {} init failed: {}", self.id, e);
                self.release();
                e.code()
            }
        }
    }

    /// Accept a frame from the player's video source
    pub fn encode(&self, frame: VideoFrame) -> i32 {
        if !self.is_initialized() {
            return CODEC_UNINITIALIZED;
        }
        match frame {
            VideoFrame::Probe {
                player_id,
                width,
                height,
            } => {
                self.bind(player_id, width, height);
                CODEC_OK
            }
            VideoFrame::Frame(pending) => {
                let Some(player_id) = self.player_id() else {
                    trace!("Peer encoder {} not bound yet, dropping frame", self.id);
                    return CODEC_OK;
                };
                match self.context.encode_frame(&player_id, pending) {
                    Ok(()) => CODEC_OK,
                    Err(e) => {
                        warn_throttled!(
                            self.throttler,
                            "encode_failed",
                            "Peer encoder {} encode failed: {}",
                            self.id,
                            e
                        );
                        e.code()
                    }
                }
            }
        }
    }

    fn bind(&self, player_id: PlayerId, width: u32, height: u32) {
        {
            let mut bound = self.player_id.write();
            if bound.as_ref() == Some(&player_id) {
                return;
            }
            info!(
                "Peer encoder {} bound to player {} ({}x{})",
                self.id, player_id, width, height
            );
            *bound = Some(player_id);
        }
        if let Some(rates) = self.unbound_rates.lock().take() {
            self.set_rates(rates);
        }
    }

    /// Rate request from this peer's bandwidth estimation
    pub fn set_rates(&self, params: RateControlParameters) -> i32 {
        if params.framerate_fps <= 0.0 {
            return CODEC_ERR_PARAMETER;
        }
        let Some(player_id) = self.player_id() else {
            *self.unbound_rates.lock() = Some(params);
            return CODEC_OK;
        };
        match self.context.set_rates(&player_id, params) {
            Ok(_) => CODEC_OK,
            Err(e) => e.code(),
        }
    }

    /// Ask for a keyframe on the shared encoder, e.g. after packet loss
    pub fn request_keyframe(&self) {
        self.context.request_keyframe();
    }

    pub fn register_encode_complete_callback(&self, callback: EncodedImageCallback) -> i32 {
        *self.callback.write() = Some(callback);
        CODEC_OK
    }

    /// Stop receiving images; the shared encoder is dropped with the last shim
    pub fn release(&self) -> i32 {
        *self.settings.lock() = None;
        *self.callback.write() = None;
        if self.registered.swap(false, Ordering::AcqRel) {
            let remaining = self.context.unregister_sink(self);
            if remaining == 0 {
                self.context.release_encoder();
            }
        }
        CODEC_OK
    }

    pub(crate) fn send_encoded_image(&self, image: &EncodedImage) {
        if let Some(callback) = self.callback.read().as_ref() {
            callback(image);
        }
    }
}

impl VideoSink for PeerVideoEncoder {
    fn on_frame(&self, frame: VideoFrame) {
        self.encode(frame);
    }
}

impl Drop for PeerVideoEncoder {
    fn drop(&mut self) {
        self.release();
    }
}
