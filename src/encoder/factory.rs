use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::context::EncoderContext;
use super::peer_encoder::PeerVideoEncoder;
use crate::config::CodecKind;

/// Hands out one encoder shim per peer connection
pub struct VideoEncoderFactory {
    context: Arc<EncoderContext>,
    next_id: AtomicU64,
}

impl VideoEncoderFactory {
    pub fn new(context: Arc<EncoderContext>) -> Self {
        Self {
            context,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<EncoderContext> {
        &self.context
    }

    pub fn supported_codecs(&self) -> Vec<CodecKind> {
        vec![self.context.settings().codec]
    }

    /// New shim, registered to receive every encoded image
    pub fn create_video_encoder(&self) -> Arc<PeerVideoEncoder> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shim = Arc::new(PeerVideoEncoder::new(id, self.context.clone()));
        self.context.register_sink(&shim);
        shim.mark_registered();
        debug!("Created peer encoder {}", id);
        shim
    }
}
