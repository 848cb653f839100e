use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::PendingFrame;
use crate::signalling::PlayerId;

/// What the pump hands to a player's video source
pub enum VideoFrame {
    /// Carries no pixels; tells the encoder shim which player it serves
    Probe {
        player_id: PlayerId,
        width: u32,
        height: u32,
    },
    /// A real frame for the quality controller
    Frame(PendingFrame),
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoFrame::Probe {
                player_id,
                width,
                height,
            } => write!(f, "Probe({}, {}x{})", player_id, width, height),
            VideoFrame::Frame(frame) => write!(f, "Frame({} layer(s))", frame.layer_count()),
        }
    }
}

/// Consumer at the end of a player's video track
pub trait VideoSink: Send + Sync {
    fn on_frame(&self, frame: VideoFrame);
}

/// Video track source of one player
pub struct PlayerVideoSource {
    player_id: PlayerId,
    sink: Arc<dyn VideoSink>,
    join_order: u64,
    frames: AtomicU64,
    probes: AtomicU64,
}

impl PlayerVideoSource {
    pub fn new(player_id: PlayerId, sink: Arc<dyn VideoSink>) -> Self {
        static JOIN_ORDER: AtomicU64 = AtomicU64::new(0);
        Self {
            player_id,
            sink,
            join_order: JOIN_ORDER.fetch_add(1, Ordering::Relaxed),
            frames: AtomicU64::new(0),
            probes: AtomicU64::new(0),
        }
    }

    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    pub(crate) fn join_order(&self) -> u64 {
        self.join_order
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub(crate) fn on_frame(&self, frame: VideoFrame) {
        match frame {
            VideoFrame::Probe { .. } => self.probes.fetch_add(1, Ordering::Relaxed),
            VideoFrame::Frame(_) => self.frames.fetch_add(1, Ordering::Relaxed),
        };
        self.sink.on_frame(frame);
    }
}

impl fmt::Debug for PlayerVideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerVideoSource")
            .field("player_id", &self.player_id)
            .field("frames", &self.frames_delivered())
            .field("probes", &self.probes.load(Ordering::Relaxed))
            .finish()
    }
}
