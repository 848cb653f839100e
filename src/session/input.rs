//! Player input routing

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::datachannel::InputEvent;
use crate::signalling::PlayerId;

/// Host-side consumer of player input
pub trait InputHandler: Send + Sync {
    fn on_input(&self, player: &PlayerId, event: &InputEvent);

    fn on_ui_interaction(&self, player: &PlayerId, descriptor: &str) {
        trace!("UI interaction from {}: {}", player, descriptor);
    }

    fn on_command(&self, player: &PlayerId, command: &str) {
        trace!("Command from {}: {}", player, command);
    }
}

/// Handler that only traces what it receives
#[derive(Debug, Default)]
pub struct LoggingInputHandler;

impl InputHandler for LoggingInputHandler {
    fn on_input(&self, player: &PlayerId, event: &InputEvent) {
        trace!("Input from {}: {:?}", player, event);
    }
}

/// Applies the key filter, then forwards to the handler
pub struct InputRouter {
    filtered_keys: ArcSwap<HashSet<u8>>,
    handler: Arc<dyn InputHandler>,
    forwarded: AtomicU64,
    suppressed: AtomicU64,
}

impl InputRouter {
    pub fn new(handler: Arc<dyn InputHandler>, filtered_keys: &[u8]) -> Self {
        Self {
            filtered_keys: ArcSwap::from_pointee(filtered_keys.iter().copied().collect()),
            handler,
            forwarded: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Replace the filter list, e.g. after a config change
    pub fn set_filtered_keys(&self, keys: &[u8]) {
        self.filtered_keys
            .store(Arc::new(keys.iter().copied().collect()));
    }

    pub fn is_filtered(&self, event: &InputEvent) -> bool {
        event
            .key_code()
            .is_some_and(|code| self.filtered_keys.load().contains(&code))
    }

    /// Returns false when the event was suppressed
    pub fn route(&self, player: &PlayerId, event: &InputEvent) -> bool {
        if self.is_filtered(event) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            trace!("Suppressed filtered key from {}: {:?}", player, event);
            return false;
        }
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.handler.on_input(player, event);
        true
    }

    pub fn ui_interaction(&self, player: &PlayerId, descriptor: &str) {
        self.handler.on_ui_interaction(player, descriptor);
    }

    pub fn command(&self, player: &PlayerId, command: &str) {
        self.handler.on_command(player, command);
    }

    /// (forwarded, suppressed)
    pub fn counts(&self) -> (u64, u64) {
        (
            self.forwarded.load(Ordering::Relaxed),
            self.suppressed.load(Ordering::Relaxed),
        )
    }
}
