//! Per-peer and application stats
//!
//! Every mutation runs on the `game` executor thread. Callers on other
//! threads return immediately; their update is queued. Reads take the
//! lock from any thread.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::error::Result;
use crate::signalling::PlayerId;
use crate::utils::Executor;

/// Weight of a new sample in a smoothed stat
pub const SMOOTHING_FACTOR: f64 = 0.1;

/// Fired on the game thread when a peer stat changes
pub type PeerStatCallback = Arc<dyn Fn(&PlayerId, &str, f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatEntry {
    pub value: f64,
    pub smoothed: bool,
}

impl StatEntry {
    fn update(&mut self, sample: f64) -> f64 {
        self.value = if self.smoothed {
            self.value + (sample - self.value) * SMOOTHING_FACTOR
        } else {
            sample
        };
        self.value
    }
}

#[derive(Default)]
struct StatsState {
    peers: HashMap<PlayerId, BTreeMap<String, StatEntry>>,
    application: BTreeMap<String, StatEntry>,
    listeners: Vec<Weak<dyn Fn(&PlayerId, &str, f64) + Send + Sync>>,
}

fn store(map: &mut BTreeMap<String, StatEntry>, name: String, sample: f64, smoothed: bool) -> (f64, bool) {
    match map.get_mut(&name) {
        Some(entry) => {
            let before = entry.value;
            let after = entry.update(sample);
            (after, after != before)
        }
        None => {
            map.insert(name, StatEntry { value: sample, smoothed });
            (sample, true)
        }
    }
}

pub struct PixelStreamingStats {
    game: Executor,
    state: Arc<Mutex<StatsState>>,
}

impl PixelStreamingStats {
    pub fn new() -> Result<Self> {
        Ok(Self {
            game: Executor::spawn("game")?,
            state: Arc::new(Mutex::new(StatsState::default())),
        })
    }

    /// The thread all stat mutations run on
    pub fn game_thread(&self) -> &Executor {
        &self.game
    }

    pub fn store_peer_stat(&self, player: &PlayerId, name: &str, value: f64, smoothed: bool) {
        let state = self.state.clone();
        let player = player.clone();
        let name = name.to_string();
        self.game.ensure_on(move || {
            let (value, changed, listeners) = {
                let mut state = state.lock();
                let stats = state.peers.entry(player.clone()).or_default();
                let (value, changed) = store(stats, name.clone(), value, smoothed);
                let listeners: Vec<_> = if changed {
                    state.listeners.iter().filter_map(Weak::upgrade).collect()
                } else {
                    Vec::new()
                };
                (value, changed, listeners)
            };
            if changed {
                for listener in listeners {
                    listener(&player, &name, value);
                }
            }
        });
    }

    pub fn store_application_stat(&self, name: &str, value: f64, smoothed: bool) {
        let state = self.state.clone();
        let name = name.to_string();
        self.game.ensure_on(move || {
            store(&mut state.lock().application, name, value, smoothed);
        });
    }

    /// Listen for peer stat changes
    ///
    /// Only a weak reference is kept; dropping the callback unsubscribes.
    pub fn add_on_peer_stat_changed_callback(&self, callback: &PeerStatCallback) {
        let state = self.state.clone();
        let weak = Arc::downgrade(callback);
        self.game.ensure_on(move || state.lock().listeners.push(weak));
    }

    pub fn remove_peer_stats(&self, player: &PlayerId) {
        let state = self.state.clone();
        let player = player.clone();
        self.game.ensure_on(move || {
            if state.lock().peers.remove(&player).is_some() {
                trace!("Stats removed for player {}", player);
            }
        });
    }

    pub fn peer_stat(&self, player: &PlayerId, name: &str) -> Option<f64> {
        self.state
            .lock()
            .peers
            .get(player)
            .and_then(|s| s.get(name))
            .map(|e| e.value)
    }

    pub fn application_stat(&self, name: &str) -> Option<f64> {
        self.state.lock().application.get(name).map(|e| e.value)
    }

    pub fn peer_snapshot(&self, player: &PlayerId) -> Vec<(String, f64)> {
        self.state
            .lock()
            .peers
            .get(player)
            .map(|s| s.iter().map(|(k, e)| (k.clone(), e.value)).collect())
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Text for the on-screen stats overlay
    pub fn render_hud(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut lines = Vec::new();
        for (name, entry) in &state.application {
            lines.push(format!("{}: {:.2}", name, entry.value));
        }
        let mut players: Vec<_> = state.peers.keys().collect();
        players.sort();
        for player in players {
            let mut line = format!("[{}]", player);
            for (name, entry) in &state.peers[player] {
                let _ = write!(line, " {}={:.2}", name, entry.value);
            }
            lines.push(line);
        }
        lines
    }

    /// Block until queued mutations have been applied
    pub fn flush(&self) {
        self.game.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_store_from_any_thread() {
        let stats = Arc::new(PixelStreamingStats::new().unwrap());
        let player = PlayerId::from("1");

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let stats = stats.clone();
                let player = player.clone();
                thread::spawn(move || stats.store_peer_stat(&player, &format!("stat{}", i), i as f64, false))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        stats.store_application_stat("fps", 60.0, false);
        stats.flush();

        assert_eq!(stats.peer_snapshot(&player).len(), 4);
        assert_eq!(stats.peer_stat(&player, "stat3"), Some(3.0));
        assert_eq!(stats.application_stat("fps"), Some(60.0));
    }

    #[test]
    fn test_smoothing() {
        let stats = PixelStreamingStats::new().unwrap();
        let player = PlayerId::from("1");
        stats.store_peer_stat(&player, "qp", 20.0, true);
        stats.store_peer_stat(&player, "qp", 30.0, true);
        stats.store_peer_stat(&player, "bitrate", 5.0, false);
        stats.store_peer_stat(&player, "bitrate", 7.0, false);
        stats.flush();

        let qp = stats.peer_stat(&player, "qp").unwrap();
        assert!((qp - 21.0).abs() < 1e-9);
        assert_eq!(stats.peer_stat(&player, "bitrate"), Some(7.0));
    }

    #[test]
    fn test_listeners_are_weak() {
        let stats = PixelStreamingStats::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let game_thread = Arc::new(Mutex::new(None));
        let g = game_thread.clone();
        let callback: PeerStatCallback = Arc::new(move |player: &PlayerId, name: &str, value: f64| {
            *g.lock() = thread::current().name().map(str::to_string);
            s.lock().push((player.to_string(), name.to_string(), value));
        });
        stats.add_on_peer_stat_changed_callback(&callback);

        let player = PlayerId::from("7");
        stats.store_peer_stat(&player, "rtt", 12.0, false);
        // Unchanged value does not fire
        stats.store_peer_stat(&player, "rtt", 12.0, false);
        stats.flush();
        assert_eq!(*seen.lock(), vec![("7".to_string(), "rtt".to_string(), 12.0)]);
        assert_eq!(game_thread.lock().as_deref(), Some("game"));

        drop(callback);
        stats.store_peer_stat(&player, "rtt", 15.0, false);
        stats.flush();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_remove_and_hud() {
        let stats = PixelStreamingStats::new().unwrap();
        stats.store_application_stat("encoder.fps", 59.94, false);
        stats.store_peer_stat(&PlayerId::from("b"), "qp", 25.0, false);
        stats.store_peer_stat(&PlayerId::from("a"), "qp", 30.0, false);
        stats.flush();

        let hud = stats.render_hud();
        assert_eq!(hud, vec!["encoder.fps: 59.94", "[a] qp=30.00", "[b] qp=25.00"]);

        stats.remove_peer_stats(&PlayerId::from("a"));
        stats.flush();
        assert_eq!(stats.peer_count(), 1);
        assert!(stats.peer_stat(&PlayerId::from("a"), "qp").is_none());
    }
}
