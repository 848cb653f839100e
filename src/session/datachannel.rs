//! Data channel message codec
//!
//! Binary format: `[u8 message type][payload]`, little-endian throughout.
//!
//! Strings are UTF-16LE prefixed by a u16 code-unit count. Byte blobs
//! (freeze frame JPEG, file contents) are prefixed by a u32 byte length.
//!
//! To the player:
//! - 0 QualityControlOwnership: u8 bool
//! - 1 Response, 2 Command: string
//! - 3 FreezeFrame: bytes
//! - 4 UnfreezeFrame: no payload
//! - 5 VideoEncoderAvgQP, 6 LatencyTest, 7 InitialSettings: string
//! - 8 FileExtension, 9 FileMimeType: string
//! - 10 FileContents: bytes
//!
//! From the player:
//! - 0 IFrameRequest, 1 RequestQualityControl: no payload
//! - 2 MaxFpsRequest: u8
//! - 3 AverageBitrateRequest: u16 min kbps, u16 max kbps
//! - 4 StartStreaming, 5 StopStreaming: no payload
//! - 6 LatencyTest: string
//! - 7 RequestInitialSettings: no payload
//! - 50 UIInteraction, 51 Command: string
//! - 60 KeyDown: u8 key code, u8 repeat
//! - 61 KeyUp: u8 key code
//! - 62 KeyPress: u16 char code
//! - 70 MouseEnter, 71 MouseLeave: no payload
//! - 72 MouseDown, 73 MouseUp: u8 button, u16 x, u16 y
//! - 74 MouseMove: u16 x, u16 y, i16 dx, i16 dy
//! - 75 MouseWheel: i16 delta, u16 x, u16 y
//! - 80 TouchStart, 81 TouchEnd, 82 TouchMove: u8 count, then per touch
//!   u16 x, u16 y, u8 id, u8 force

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{AppError, Result};

pub mod to_player {
    pub const QUALITY_CONTROL_OWNERSHIP: u8 = 0;
    pub const RESPONSE: u8 = 1;
    pub const COMMAND: u8 = 2;
    pub const FREEZE_FRAME: u8 = 3;
    pub const UNFREEZE_FRAME: u8 = 4;
    pub const VIDEO_ENCODER_AVG_QP: u8 = 5;
    pub const LATENCY_TEST: u8 = 6;
    pub const INITIAL_SETTINGS: u8 = 7;
    pub const FILE_EXTENSION: u8 = 8;
    pub const FILE_MIME_TYPE: u8 = 9;
    pub const FILE_CONTENTS: u8 = 10;
}

pub mod from_player {
    pub const IFRAME_REQUEST: u8 = 0;
    pub const REQUEST_QUALITY_CONTROL: u8 = 1;
    pub const MAX_FPS_REQUEST: u8 = 2;
    pub const AVERAGE_BITRATE_REQUEST: u8 = 3;
    pub const START_STREAMING: u8 = 4;
    pub const STOP_STREAMING: u8 = 5;
    pub const LATENCY_TEST: u8 = 6;
    pub const REQUEST_INITIAL_SETTINGS: u8 = 7;
    pub const UI_INTERACTION: u8 = 50;
    pub const COMMAND: u8 = 51;
    pub const KEY_DOWN: u8 = 60;
    pub const KEY_UP: u8 = 61;
    pub const KEY_PRESS: u8 = 62;
    pub const MOUSE_ENTER: u8 = 70;
    pub const MOUSE_LEAVE: u8 = 71;
    pub const MOUSE_DOWN: u8 = 72;
    pub const MOUSE_UP: u8 = 73;
    pub const MOUSE_MOVE: u8 = 74;
    pub const MOUSE_WHEEL: u8 = 75;
    pub const TOUCH_START: u8 = 80;
    pub const TOUCH_END: u8 = 81;
    pub const TOUCH_MOVE: u8 = 82;
}

/// Message sent to a player
#[derive(Debug, Clone, PartialEq)]
pub enum ToPlayerMessage {
    QualityControlOwnership(bool),
    Response(String),
    Command(String),
    FreezeFrame(Bytes),
    UnfreezeFrame,
    VideoEncoderAvgQp(String),
    LatencyTest(String),
    InitialSettings(String),
    FileExtension(String),
    FileMimeType(String),
    FileContents(Bytes),
}

impl ToPlayerMessage {
    pub fn type_id(&self) -> u8 {
        use to_player::*;
        match self {
            Self::QualityControlOwnership(_) => QUALITY_CONTROL_OWNERSHIP,
            Self::Response(_) => RESPONSE,
            Self::Command(_) => COMMAND,
            Self::FreezeFrame(_) => FREEZE_FRAME,
            Self::UnfreezeFrame => UNFREEZE_FRAME,
            Self::VideoEncoderAvgQp(_) => VIDEO_ENCODER_AVG_QP,
            Self::LatencyTest(_) => LATENCY_TEST,
            Self::InitialSettings(_) => INITIAL_SETTINGS,
            Self::FileExtension(_) => FILE_EXTENSION,
            Self::FileMimeType(_) => FILE_MIME_TYPE,
            Self::FileContents(_) => FILE_CONTENTS,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.type_id());
        match self {
            Self::QualityControlOwnership(owned) => buf.put_u8(u8::from(*owned)),
            Self::UnfreezeFrame => {}
            Self::FreezeFrame(data) | Self::FileContents(data) => put_blob(&mut buf, data)?,
            Self::Response(s)
            | Self::Command(s)
            | Self::VideoEncoderAvgQp(s)
            | Self::LatencyTest(s)
            | Self::InitialSettings(s)
            | Self::FileExtension(s)
            | Self::FileMimeType(s) => put_string(&mut buf, s)?,
        }
        Ok(buf.freeze())
    }
}

/// One touch point; coordinates are normalised to the u16 range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touch {
    pub x: u16,
    pub y: u16,
    pub id: u8,
    pub force: u8,
}

/// Input forwarded to the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    KeyDown { key_code: u8, repeat: bool },
    KeyUp { key_code: u8 },
    KeyPress { char_code: u16 },
    MouseEnter,
    MouseLeave,
    MouseDown { button: u8, x: u16, y: u16 },
    MouseUp { button: u8, x: u16, y: u16 },
    MouseMove { x: u16, y: u16, dx: i16, dy: i16 },
    MouseWheel { delta: i16, x: u16, y: u16 },
    TouchStart(Vec<Touch>),
    TouchEnd(Vec<Touch>),
    TouchMove(Vec<Touch>),
}

impl InputEvent {
    /// Key code for key up/down events
    pub fn key_code(&self) -> Option<u8> {
        match self {
            Self::KeyDown { key_code, .. } | Self::KeyUp { key_code } => Some(*key_code),
            _ => None,
        }
    }

    /// Pointer position in 0.0..=1.0 viewport coordinates
    pub fn position(&self) -> Option<(f32, f32)> {
        let (x, y) = match self {
            Self::MouseDown { x, y, .. }
            | Self::MouseUp { x, y, .. }
            | Self::MouseMove { x, y, .. }
            | Self::MouseWheel { x, y, .. } => (*x, *y),
            Self::TouchStart(t) | Self::TouchEnd(t) | Self::TouchMove(t) => {
                let first = t.first()?;
                (first.x, first.y)
            }
            _ => return None,
        };
        Some((x as f32 / u16::MAX as f32, y as f32 / u16::MAX as f32))
    }
}

/// Message received from a player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromPlayerMessage {
    IFrameRequest,
    RequestQualityControl,
    MaxFpsRequest(u8),
    AverageBitrateRequest { min_kbps: u16, max_kbps: u16 },
    StartStreaming,
    StopStreaming,
    LatencyTest(String),
    RequestInitialSettings,
    UiInteraction(String),
    Command(String),
    Input(InputEvent),
}

impl FromPlayerMessage {
    pub fn decode(data: &[u8]) -> Result<Self> {
        use from_player::*;

        let mut buf = data;
        let kind = take_u8(&mut buf)?;
        let message = match kind {
            IFRAME_REQUEST => Self::IFrameRequest,
            REQUEST_QUALITY_CONTROL => Self::RequestQualityControl,
            MAX_FPS_REQUEST => Self::MaxFpsRequest(take_u8(&mut buf)?),
            AVERAGE_BITRATE_REQUEST => Self::AverageBitrateRequest {
                min_kbps: take_u16(&mut buf)?,
                max_kbps: take_u16(&mut buf)?,
            },
            START_STREAMING => Self::StartStreaming,
            STOP_STREAMING => Self::StopStreaming,
            LATENCY_TEST => Self::LatencyTest(take_string(&mut buf)?),
            REQUEST_INITIAL_SETTINGS => Self::RequestInitialSettings,
            UI_INTERACTION => Self::UiInteraction(take_string(&mut buf)?),
            COMMAND => Self::Command(take_string(&mut buf)?),
            KEY_DOWN => Self::Input(InputEvent::KeyDown {
                key_code: take_u8(&mut buf)?,
                repeat: take_u8(&mut buf)? != 0,
            }),
            KEY_UP => Self::Input(InputEvent::KeyUp {
                key_code: take_u8(&mut buf)?,
            }),
            KEY_PRESS => Self::Input(InputEvent::KeyPress {
                char_code: take_u16(&mut buf)?,
            }),
            MOUSE_ENTER => Self::Input(InputEvent::MouseEnter),
            MOUSE_LEAVE => Self::Input(InputEvent::MouseLeave),
            MOUSE_DOWN | MOUSE_UP => {
                let button = take_u8(&mut buf)?;
                let x = take_u16(&mut buf)?;
                let y = take_u16(&mut buf)?;
                Self::Input(if kind == MOUSE_DOWN {
                    InputEvent::MouseDown { button, x, y }
                } else {
                    InputEvent::MouseUp { button, x, y }
                })
            }
            MOUSE_MOVE => Self::Input(InputEvent::MouseMove {
                x: take_u16(&mut buf)?,
                y: take_u16(&mut buf)?,
                dx: take_i16(&mut buf)?,
                dy: take_i16(&mut buf)?,
            }),
            MOUSE_WHEEL => Self::Input(InputEvent::MouseWheel {
                delta: take_i16(&mut buf)?,
                x: take_u16(&mut buf)?,
                y: take_u16(&mut buf)?,
            }),
            TOUCH_START | TOUCH_END | TOUCH_MOVE => {
                let touches = take_touches(&mut buf)?;
                Self::Input(match kind {
                    TOUCH_START => InputEvent::TouchStart(touches),
                    TOUCH_END => InputEvent::TouchEnd(touches),
                    _ => InputEvent::TouchMove(touches),
                })
            }
            other => {
                return Err(AppError::Protocol(format!(
                    "unknown data channel message type {}",
                    other
                )))
            }
        };
        Ok(message)
    }
}

fn truncated(what: &str) -> AppError {
    AppError::Protocol(format!("truncated {}", what))
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated("u8"));
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated("u16"));
    }
    Ok(buf.get_u16_le())
}

fn take_i16(buf: &mut &[u8]) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(truncated("i16"));
    }
    Ok(buf.get_i16_le())
}

fn take_string(buf: &mut &[u8]) -> Result<String> {
    let units = take_u16(buf)? as usize;
    if buf.remaining() < units * 2 {
        return Err(truncated("string"));
    }
    let code_units: Vec<u16> = (0..units).map(|_| buf.get_u16_le()).collect();
    String::from_utf16(&code_units).map_err(|e| AppError::Protocol(format!("bad UTF-16: {}", e)))
}

fn take_touches(buf: &mut &[u8]) -> Result<Vec<Touch>> {
    let count = take_u8(buf)? as usize;
    if buf.remaining() < count * 6 {
        return Err(truncated("touch list"));
    }
    Ok((0..count)
        .map(|_| Touch {
            x: buf.get_u16_le(),
            y: buf.get_u16_le(),
            id: buf.get_u8(),
            force: buf.get_u8(),
        })
        .collect())
}

/// Append a counted UTF-16LE string
pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let count = u16::try_from(units.len())
        .map_err(|_| AppError::Protocol(format!("string of {} code units too long", units.len())))?;
    buf.reserve(2 + units.len() * 2);
    buf.put_u16_le(count);
    for unit in units {
        buf.put_u16_le(unit);
    }
    Ok(())
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| AppError::Protocol(format!("payload of {} bytes too long", data.len())))?;
    buf.reserve(4 + data.len());
    buf.put_u32_le(len);
    buf.put_slice(data);
    Ok(())
}
