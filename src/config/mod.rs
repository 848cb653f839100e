//! Streamer configuration
//!
//! The schema covers what an engine would expose as console variables:
//! rate control, QP bounds, bitrates, capture size, simulcast layers,
//! degradation preference and input filtering.

pub mod schema;
pub mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
