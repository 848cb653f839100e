//! End-to-end latency measurement requested by a player
//!
//! A test walks through the pipeline stages once. Each hook advances the
//! stage only from the stage before it, by compare-and-swap, so hooks
//! firing from different threads or out of order are harmless.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info};

use crate::signalling::PlayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LatencyStage {
    Inactive = 0,
    PreCapture = 1,
    PostCapture = 2,
    PreEncode = 3,
    PostEncode = 4,
    ResultsReady = 5,
}

impl LatencyStage {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::PreCapture,
            2 => Self::PostCapture,
            3 => Self::PreEncode,
            4 => Self::PostEncode,
            5 => Self::ResultsReady,
            _ => Self::Inactive,
        }
    }
}

/// Timings sent back to the player, unix milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyTestResults {
    pub receipt_time_ms: i64,
    pub pre_capture_time_ms: i64,
    pub post_capture_time_ms: i64,
    pub pre_encode_time_ms: i64,
    pub post_encode_time_ms: i64,
    pub transmission_time_ms: i64,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Default)]
struct ActiveTest {
    player: Option<PlayerId>,
    results: LatencyTestResults,
}

pub struct LatencyTester {
    stage: AtomicU8,
    test: Mutex<ActiveTest>,
}

impl Default for LatencyTester {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTester {
    pub fn new() -> Self {
        Self {
            stage: AtomicU8::new(LatencyStage::Inactive as u8),
            test: Mutex::new(ActiveTest::default()),
        }
    }

    pub fn stage(&self) -> LatencyStage {
        LatencyStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.stage() != LatencyStage::Inactive
    }

    fn advance(&self, from: LatencyStage, to: LatencyStage) -> bool {
        self.stage
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Begin a test for `player`; fails while another test runs
    pub fn start(&self, player: &PlayerId) -> bool {
        let mut test = self.test.lock();
        if !self.advance(LatencyStage::Inactive, LatencyStage::PreCapture) {
            debug!("Latency test already running, ignoring request from {}", player);
            return false;
        }
        *test = ActiveTest {
            player: Some(player.clone()),
            results: LatencyTestResults {
                receipt_time_ms: now_ms(),
                ..Default::default()
            },
        };
        info!("Latency test started by player {}", player);
        true
    }

    /// A frame was captured; `pre_capture_ms` is when capture began
    pub fn on_frame_captured(&self, pre_capture_ms: i64) {
        let mut test = self.test.lock();
        if self.advance(LatencyStage::PreCapture, LatencyStage::PostCapture) {
            test.results.pre_capture_time_ms = pre_capture_ms;
            test.results.post_capture_time_ms = now_ms();
        }
    }

    pub fn on_encode_begin(&self) {
        let mut test = self.test.lock();
        if self.advance(LatencyStage::PostCapture, LatencyStage::PreEncode) {
            test.results.pre_encode_time_ms = now_ms();
        }
    }

    pub fn on_encode_end(&self) {
        let mut test = self.test.lock();
        if self.advance(LatencyStage::PreEncode, LatencyStage::PostEncode) {
            test.results.post_encode_time_ms = now_ms();
        }
    }

    /// Collect finished results and reset for the next test
    pub fn take_results(&self) -> Option<(PlayerId, LatencyTestResults)> {
        let mut test = self.test.lock();
        if !self.advance(LatencyStage::PostEncode, LatencyStage::ResultsReady) {
            return None;
        }
        let mut finished = std::mem::take(&mut *test);
        finished.results.transmission_time_ms = now_ms();
        self.stage
            .store(LatencyStage::Inactive as u8, Ordering::Release);
        finished.player.map(|p| (p, finished.results))
    }

    /// Abandon a running test, e.g. when its player leaves
    pub fn cancel_for(&self, player: &PlayerId) {
        let mut test = self.test.lock();
        if test.player.as_ref() == Some(player) {
            *test = ActiveTest::default();
            self.stage
                .store(LatencyStage::Inactive as u8, Ordering::Release);
            debug!("Latency test of {} cancelled", player);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_full_run() {
        let tester = LatencyTester::new();
        let player = PlayerId::from("1");
        assert!(tester.take_results().is_none());

        assert!(tester.start(&player));
        assert!(!tester.start(&PlayerId::from("2")));
        assert_eq!(tester.stage(), LatencyStage::PreCapture);

        // Out of order hooks do nothing
        tester.on_encode_end();
        tester.on_encode_begin();
        assert_eq!(tester.stage(), LatencyStage::PreCapture);

        let pre = now_ms();
        tester.on_frame_captured(pre);
        tester.on_encode_begin();
        tester.on_encode_end();
        assert_eq!(tester.stage(), LatencyStage::PostEncode);

        let (who, results) = tester.take_results().unwrap();
        assert_eq!(who, player);
        assert_eq!(results.pre_capture_time_ms, pre);
        assert!(results.receipt_time_ms <= results.pre_capture_time_ms);
        assert!(results.post_capture_time_ms <= results.pre_encode_time_ms);
        assert!(results.post_encode_time_ms <= results.transmission_time_ms);
        assert_eq!(tester.stage(), LatencyStage::Inactive);

        let json = serde_json::to_value(&results).unwrap();
        assert!(json.get("ReceiptTimeMs").is_some());
        assert!(json.get("TransmissionTimeMs").is_some());
    }

    #[test]
    fn test_concurrent_hooks_advance_once() {
        let tester = Arc::new(LatencyTester::new());
        tester.start(&PlayerId::from("1"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tester = tester.clone();
                thread::spawn(move || tester.on_frame_captured(i))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tester.stage(), LatencyStage::PostCapture);
    }

    #[test]
    fn test_cancel() {
        let tester = LatencyTester::new();
        let player = PlayerId::from("1");
        tester.start(&player);
        tester.cancel_for(&PlayerId::from("other"));
        assert!(tester.is_active());
        tester.cancel_for(&player);
        assert!(!tester.is_active());
        assert!(tester.start(&player));
    }
}
