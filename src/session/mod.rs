//! Player sessions and the data channel protocol

pub mod audio;
pub mod datachannel;
pub mod input;
pub mod player_session;

pub use audio::{AudioFrame, AudioSink};
pub use datachannel::{FromPlayerMessage, InputEvent, ToPlayerMessage, Touch};
pub use input::{InputHandler, InputRouter, LoggingInputHandler};
pub use player_session::{
    build_ice_servers, PlayerSession, SessionEvent, SessionParams, SessionState,
};
