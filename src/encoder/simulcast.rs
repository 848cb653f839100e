//! One encoder per simulcast stream behind a single encode call

use tracing::{debug, info, warn};

use super::rate_allocator::{SimulcastRateAllocator, StreamAllocation};
use super::traits::{
    EncodedImage, EncoderConfig, EncoderCreator, EncoderInputKind, VideoEncoder,
};
use crate::adapter::AdaptedFrame;
use crate::capture::Layer;
use crate::config::{CodecKind, SimulcastLayerConfig};
use crate::error::EncoderError;

struct Stream {
    encoder: Box<dyn VideoEncoder>,
    config: EncoderConfig,
    allocation: StreamAllocation,
    frames_since_keyframe: u32,
    keyframe_pending: bool,
}

pub struct SimulcastEncoderAdapter {
    codec: CodecKind,
    streams: Vec<Stream>,
    allocator: SimulcastRateAllocator,
    framerate_fps: f64,
}

impl SimulcastEncoderAdapter {
    /// Create one encoder per layer
    ///
    /// `base` is the configuration of the full-size stream; each layer is
    /// sized by its scale. Layers are highest quality first.
    pub fn new(
        creator: &EncoderCreator,
        base: &EncoderConfig,
        layers: &[SimulcastLayerConfig],
    ) -> Result<Self, EncoderError> {
        base.validate()?;
        if layers.is_empty() {
            return Err(EncoderError::InvalidParameter("no simulcast layers".to_string()));
        }

        let mut streams = Vec::with_capacity(layers.len());
        for (index, layer_config) in layers.iter().enumerate() {
            let layer = Layer::scaled(layer_config.scale, base.width, base.height);
            let mut config = base.clone();
            config.width = layer.width;
            config.height = layer.height;
            config.max_bitrate_bps = layer_config.max_bitrate_bps;

            let mut encoder = creator(base.codec)?;
            encoder.configure(&config)?;
            debug!(
                "Simulcast stream {} ready: {} {}x{}",
                index,
                encoder.name(),
                config.width,
                config.height
            );
            streams.push(Stream {
                encoder,
                config,
                allocation: StreamAllocation::default(),
                frames_since_keyframe: 0,
                keyframe_pending: true,
            });
        }

        let mut adapter = Self {
            codec: base.codec,
            streams,
            allocator: SimulcastRateAllocator::new(layers.to_vec()),
            framerate_fps: base.max_framerate as f64,
        };
        adapter.set_rates(base.target_bitrate_bps, base.max_framerate as f64)?;
        info!(
            "Simulcast encoder adapter created: {} stream(s), codec {}",
            adapter.streams.len(),
            adapter.codec
        );
        Ok(adapter)
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn input_kind(&self) -> EncoderInputKind {
        self.streams
            .first()
            .map(|s| s.encoder.input_kind())
            .unwrap_or(EncoderInputKind::I420)
    }

    pub fn allocations(&self) -> Vec<StreamAllocation> {
        self.streams.iter().map(|s| s.allocation).collect()
    }

    pub fn framerate(&self) -> f64 {
        self.framerate_fps
    }

    /// Re-split `total_bps` across streams
    ///
    /// A stream that turns on again starts with a keyframe.
    pub fn set_rates(&mut self, total_bps: u32, framerate_fps: f64) -> Result<(), EncoderError> {
        if framerate_fps <= 0.0 {
            return Err(EncoderError::InvalidParameter(format!(
                "framerate {}",
                framerate_fps
            )));
        }
        self.framerate_fps = framerate_fps;
        let allocations = self.allocator.allocate(total_bps);

        for (index, (stream, allocation)) in self.streams.iter_mut().zip(allocations).enumerate() {
            if allocation.active && !stream.allocation.active {
                debug!("Simulcast stream {} activated", index);
                stream.keyframe_pending = true;
            } else if !allocation.active && stream.allocation.active {
                debug!("Simulcast stream {} paused, bitrate too low", index);
            }
            stream.allocation = allocation;
            if allocation.active {
                stream
                    .encoder
                    .set_rates(allocation.bitrate_bps, framerate_fps)?;
            }
        }
        Ok(())
    }

    /// Ask every active stream for a keyframe on the next encode
    pub fn request_keyframe(&mut self) {
        for stream in self.streams.iter_mut().filter(|s| s.allocation.active) {
            stream.keyframe_pending = true;
        }
    }

    /// Encode one frame per layer
    ///
    /// `frames[i]` feeds stream `i`. A keyframe pending on any active
    /// stream is produced on every active stream so their GOPs stay aligned.
    pub fn encode(
        &mut self,
        frames: &[AdaptedFrame],
        force_keyframe: bool,
    ) -> Result<Vec<EncodedImage>, EncoderError> {
        if frames.len() < self.streams.len() {
            return Err(EncoderError::InvalidParameter(format!(
                "{} frame(s) for {} stream(s)",
                frames.len(),
                self.streams.len()
            )));
        }

        let interval_due = self.streams.iter().any(|s| {
            s.allocation.active
                && s.config.keyframe_interval > 0
                && s.frames_since_keyframe + 1 >= s.config.keyframe_interval
        });
        let keyframe = force_keyframe
            || interval_due
            || self
                .streams
                .iter()
                .any(|s| s.allocation.active && s.keyframe_pending);

        let mut images = Vec::new();
        for (index, (stream, frame)) in self.streams.iter_mut().zip(frames).enumerate() {
            if !stream.allocation.active {
                continue;
            }

            if (frame.width, frame.height) != (stream.config.width, stream.config.height) {
                info!(
                    "Simulcast stream {} resized {}x{} -> {}x{}",
                    index, stream.config.width, stream.config.height, frame.width, frame.height
                );
                stream.config.width = frame.width;
                stream.config.height = frame.height;
                stream.encoder.configure(&stream.config)?;
                stream
                    .encoder
                    .set_rates(stream.allocation.bitrate_bps, self.framerate_fps)?;
            }

            match stream.encoder.encode(frame, keyframe)? {
                Some(packet) => {
                    if keyframe && !packet.is_keyframe {
                        warn!("Simulcast stream {} ignored keyframe request", index);
                    }
                    if packet.is_keyframe {
                        stream.frames_since_keyframe = 0;
                        stream.keyframe_pending = false;
                    } else {
                        stream.frames_since_keyframe += 1;
                    }
                    images.push(EncodedImage {
                        data: packet.data,
                        simulcast_index: index,
                        frame_id: frame.frame_id,
                        timestamp_us: frame.timestamp_us,
                        is_keyframe: packet.is_keyframe,
                        qp: packet.qp,
                        width: frame.width,
                        height: frame.height,
                        codec: self.codec,
                    });
                }
                None => stream.frames_since_keyframe += 1,
            }
        }
        Ok(images)
    }
}
