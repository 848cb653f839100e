use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Capture error: {0}")]
    CaptureError(String),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Signalling error: {0}")]
    Signalling(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::WebRtcError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Signalling(e.to_string())
    }
}

/// Status codes returned across the per-peer encoder contract
pub const CODEC_OK: i32 = 0;
pub const CODEC_ERROR: i32 = -1;
pub const CODEC_ERR_PARAMETER: i32 = -4;
pub const CODEC_UNINITIALIZED: i32 = -7;

/// Encoder failures, each mapped to a negative status code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("encoder failure: {0}")]
    Failed(String),

    #[error("invalid encoder parameter: {0}")]
    InvalidParameter(String),

    #[error("encoder not initialized")]
    Uninitialized,
}

impl EncoderError {
    /// Negative status code for this error
    pub fn code(&self) -> i32 {
        match self {
            EncoderError::Failed(_) => CODEC_ERROR,
            EncoderError::InvalidParameter(_) => CODEC_ERR_PARAMETER,
            EncoderError::Uninitialized => CODEC_UNINITIALIZED,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_error_codes() {
        assert_eq!(EncoderError::Failed("x".into()).code(), CODEC_ERROR);
        assert_eq!(
            EncoderError::InvalidParameter("w".into()).code(),
            CODEC_ERR_PARAMETER
        );
        assert_eq!(EncoderError::Uninitialized.code(), CODEC_UNINITIALIZED);
        assert!(CODEC_OK > CODEC_ERROR);
    }

    #[test]
    fn test_encoder_error_wraps_into_app_error() {
        let err: AppError = EncoderError::Uninitialized.into();
        assert!(err.to_string().contains("not initialized"));
    }
}
