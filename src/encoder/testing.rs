//! Deterministic encoder backend for tests

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use super::traits::{EncodedPacket, EncoderConfig, EncoderCreator, EncoderInputKind, VideoEncoder};
use crate::adapter::AdaptedFrame;
use crate::config::CodecKind;
use crate::error::EncoderError;

#[derive(Default)]
struct LogInner {
    configs: Vec<EncoderConfig>,
    rates: Vec<(u32, f64)>,
    encoded: Vec<(u64, bool)>,
    /// Encoders accept frames but emit nothing
    silent: bool,
}

/// Shared record of every call made on mock encoders
#[derive(Clone, Default)]
pub struct MockLog {
    inner: Arc<Mutex<LogInner>>,
}

impl MockLog {
    pub fn configs(&self) -> Vec<EncoderConfig> {
        self.inner.lock().configs.clone()
    }

    pub fn rates(&self) -> Vec<(u32, f64)> {
        self.inner.lock().rates.clone()
    }

    pub fn set_silent(&self, silent: bool) {
        self.inner.lock().silent = silent;
    }

    /// (frame id, forced keyframe) per encode call
    pub fn encoded(&self) -> Vec<(u64, bool)> {
        self.inner.lock().encoded.clone()
    }
}

pub struct MockEncoder {
    log: MockLog,
    input: EncoderInputKind,
    configured: bool,
}

impl MockEncoder {
    pub fn new(log: MockLog) -> Self {
        Self {
            log,
            input: EncoderInputKind::I420,
            configured: false,
        }
    }
}

impl VideoEncoder for MockEncoder {
    fn name(&self) -> &str {
        "mock"
    }

    fn input_kind(&self) -> EncoderInputKind {
        self.input
    }

    fn configure(&mut self, config: &EncoderConfig) -> Result<(), EncoderError> {
        config.validate()?;
        self.log.inner.lock().configs.push(config.clone());
        self.configured = true;
        Ok(())
    }

    fn encode(
        &mut self,
        frame: &AdaptedFrame,
        force_keyframe: bool,
    ) -> Result<Option<EncodedPacket>, EncoderError> {
        if !self.configured {
            return Err(EncoderError::Uninitialized);
        }
        let silent = {
            let mut inner = self.log.inner.lock();
            inner.encoded.push((frame.frame_id, force_keyframe));
            inner.silent
        };
        if silent {
            return Ok(None);
        }
        let mut data = frame.frame_id.to_be_bytes().to_vec();
        data.push(force_keyframe as u8);
        Ok(Some(EncodedPacket {
            data: Bytes::from(data),
            is_keyframe: force_keyframe,
            qp: Some(20 + (frame.frame_id % 10) as u32),
        }))
    }

    fn set_rates(&mut self, bitrate_bps: u32, framerate_fps: f64) -> Result<(), EncoderError> {
        self.log.inner.lock().rates.push((bitrate_bps, framerate_fps));
        Ok(())
    }
}

/// Creator producing mock encoders that share `log`
pub fn mock_creator(log: MockLog) -> EncoderCreator {
    Arc::new(move |_codec: CodecKind| {
        Ok(Box::new(MockEncoder::new(log.clone())) as Box<dyn VideoEncoder>)
    })
}

/// Creator whose encoders always fail to construct
pub fn failing_creator() -> EncoderCreator {
    Arc::new(|codec: CodecKind| {
        Err(EncoderError::Failed(format!("no {} backend", codec)))
    })
}
