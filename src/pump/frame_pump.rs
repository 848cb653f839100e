//! Frame scheduling for all player video sources
//!
//! A dedicated thread wakes once per frame interval. Each cycle it runs
//! queued tasks, sends a probe frame to each newly added source and
//! promotes it, then hands the newest captured frame to the quality
//! controller's source. Only that source drives the shared encoder; the
//! other players receive the encoded result through the encoder fan-out.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::video_source::{PlayerVideoSource, VideoFrame};
use crate::capture::FrameSource;
use crate::error::{AppError, Result};
use crate::signalling::PlayerId;
use crate::utils::{Task, ThreadWaiter};

/// Upper bound on an idle wait, so `stop` is never missed for long
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 240;

/// Called with the new controller whenever it changes
pub type ControllerListener = Box<dyn Fn(Option<PlayerId>) + Send + Sync>;

#[derive(Default)]
struct Sources {
    /// Added but not yet probed
    pending: HashMap<PlayerId, Arc<PlayerVideoSource>>,
    /// Probed and eligible for frames
    initialised: HashMap<PlayerId, Arc<PlayerVideoSource>>,
    controller: Option<PlayerId>,
}

impl Sources {
    fn contains(&self, player: &PlayerId) -> bool {
        self.pending.contains_key(player) || self.initialised.contains_key(player)
    }

    /// Earliest-joined remaining source
    fn successor(&self) -> Option<PlayerId> {
        self.initialised
            .values()
            .chain(self.pending.values())
            .min_by_key(|s| s.join_order())
            .map(|s| s.player_id().clone())
    }
}

/// Pump counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub cycles: u64,
    pub frames_submitted: u64,
    pub probes_sent: u64,
    pub tasks_run: u64,
}

struct PumpShared {
    frame_source: Arc<FrameSource>,
    sources: Mutex<Sources>,
    tasks: Mutex<VecDeque<Task>>,
    waiter: ThreadWaiter,
    fps: AtomicU32,
    running: AtomicBool,
    listener: RwLock<Option<ControllerListener>>,
    cycles: AtomicU64,
    frames_submitted: AtomicU64,
    probes_sent: AtomicU64,
    tasks_run: AtomicU64,
}

pub struct FramePump {
    shared: Arc<PumpShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FramePump {
    pub fn new(frame_source: Arc<FrameSource>, fps: u32) -> Self {
        Self {
            shared: Arc::new(PumpShared {
                frame_source,
                sources: Mutex::new(Sources::default()),
                tasks: Mutex::new(VecDeque::new()),
                waiter: ThreadWaiter::new(),
                fps: AtomicU32::new(fps.clamp(MIN_FPS, MAX_FPS)),
                running: AtomicBool::new(false),
                listener: RwLock::new(None),
                cycles: AtomicU64::new(0),
                frames_submitted: AtomicU64::new(0),
                probes_sent: AtomicU64::new(0),
                tasks_run: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the pump thread
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || shared.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                AppError::Internal(format!("failed to spawn frame pump: {}", e))
            })?;
        *thread = Some(handle);
        info!("Frame pump started at {} fps", self.fps());
        Ok(())
    }

    /// Stop the pump thread and wait for it to exit
    ///
    /// Blocks; async callers go through `spawn_blocking` or use
    /// [`FramePump::request_stop`].
    pub fn stop(&self) {
        if let Some(handle) = self.request_stop() {
            join_pump(handle);
        }
    }

    /// Tell the pump thread to exit without waiting for it
    pub fn request_stop(&self) -> Option<JoinHandle<()>> {
        let handle = self.thread.lock().take()?;
        self.shared.running.store(false, Ordering::Release);
        self.shared.waiter.notify();
        Some(handle)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn set_controller_listener(&self, listener: ControllerListener) {
        *self.shared.listener.write() = Some(listener);
    }

    /// Register a player's source; it gets a probe frame on the next cycle
    pub fn add_source(&self, source: Arc<PlayerVideoSource>) {
        let player = source.player_id().clone();
        {
            let mut sources = self.shared.sources.lock();
            sources.initialised.remove(&player);
            sources.pending.insert(player.clone(), source);
        }
        debug!("Video source added for player {}", player);
        self.shared.waiter.notify();
    }

    /// Unregister a player's source
    ///
    /// Once this returns the source receives no further frames. If it
    /// belonged to the quality controller, control passes to the
    /// earliest-joined remaining source, or to nobody.
    pub fn remove_source(&self, player: &PlayerId) -> bool {
        let (removed, new_controller) = {
            let mut sources = self.shared.sources.lock();
            let removed = sources.pending.remove(player).is_some()
                | sources.initialised.remove(player).is_some();
            if sources.controller.as_ref() == Some(player) {
                let next = sources.successor();
                sources.controller = next.clone();
                (removed, Some(next))
            } else {
                (removed, None)
            }
        };
        if removed {
            debug!("Video source removed for player {}", player);
        }
        if let Some(next) = new_controller {
            info!("Quality controller {} left, now {:?}", player, next);
            self.shared.notify_controller(next);
        }
        removed
    }

    pub fn has_source(&self, player: &PlayerId) -> bool {
        self.shared.sources.lock().contains(player)
    }

    pub fn source_count(&self) -> usize {
        let sources = self.shared.sources.lock();
        sources.pending.len() + sources.initialised.len()
    }

    /// Choose which player's source drives the encoder
    pub fn set_quality_controller(&self, player: Option<PlayerId>) {
        {
            let mut sources = self.shared.sources.lock();
            if let Some(p) = &player {
                if !sources.contains(p) {
                    warn!("Quality controller {} has no video source yet", p);
                }
            }
            if sources.controller == player {
                return;
            }
            sources.controller = player.clone();
        }
        info!("Quality controller set to {:?}", player);
        self.shared.notify_controller(player);
        self.shared.waiter.notify();
    }

    pub fn quality_controller(&self) -> Option<PlayerId> {
        self.shared.sources.lock().controller.clone()
    }

    pub fn set_fps(&self, fps: u32) {
        let fps = fps.clamp(MIN_FPS, MAX_FPS);
        let old = self.shared.fps.swap(fps, Ordering::AcqRel);
        if old != fps {
            info!("Frame pump fps {} -> {}", old, fps);
            self.shared.waiter.notify();
        }
    }

    pub fn fps(&self) -> u32 {
        self.shared.fps.load(Ordering::Acquire)
    }

    /// Run `task` on the pump thread at the start of the next cycle
    pub fn queue_task(&self, task: Task) {
        self.shared.tasks.lock().push_back(task);
        self.shared.waiter.notify();
    }

    /// Deliver the newest frame to the quality controller's source
    pub fn try_submit_frame(&self) -> bool {
        self.shared.try_submit_frame()
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            cycles: self.shared.cycles.load(Ordering::Relaxed),
            frames_submitted: self.shared.frames_submitted.load(Ordering::Relaxed),
            probes_sent: self.shared.probes_sent.load(Ordering::Relaxed),
            tasks_run: self.shared.tasks_run.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn cycle(&self) -> bool {
        self.shared.cycle()
    }
}

/// Wait for a pump thread handed out by [`FramePump::request_stop`]
pub fn join_pump(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("Frame pump thread panicked");
    }
    info!("Frame pump stopped");
}

impl Drop for FramePump {
    fn drop(&mut self) {
        // The thread exits on its own at the end of its cycle
        if self.request_stop().is_some() {
            debug!("Frame pump detached on drop");
        }
    }
}

impl PumpShared {
    fn run(&self) {
        debug!("Frame pump thread running");
        while self.running.load(Ordering::Acquire) {
            let started = Instant::now();
            let busy = self.cycle();

            let interval = Duration::from_micros(1_000_000 / self.fps.load(Ordering::Acquire) as u64);
            let deadline = if busy {
                started + interval
            } else {
                started + IDLE_WAIT
            };
            self.waiter.wait_until(deadline);
        }
    }

    /// One pump cycle; returns whether any source is attached
    fn cycle(&self) -> bool {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.run_tasks();
        self.probe_pending();
        self.try_submit_frame();

        let sources = self.sources.lock();
        !(sources.pending.is_empty() && sources.initialised.is_empty())
    }

    fn run_tasks(&self) {
        let tasks: Vec<Task> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task();
            self.tasks_run.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Probe and promote new sources under a single lock
    fn probe_pending(&self) {
        let mut sources = self.sources.lock();
        if sources.pending.is_empty() {
            return;
        }
        let (width, height) = self.frame_source.capture_resolution().unwrap_or((0, 0));
        let pending: Vec<_> = sources.pending.drain().collect();
        for (player, source) in pending {
            source.on_frame(VideoFrame::Probe {
                player_id: player.clone(),
                width,
                height,
            });
            self.probes_sent.fetch_add(1, Ordering::Relaxed);
            sources.initialised.insert(player, source);
        }
    }

    fn try_submit_frame(&self) -> bool {
        let sources = self.sources.lock();
        let Some(controller) = sources.controller.as_ref() else {
            return false;
        };
        let Some(source) = sources.initialised.get(controller) else {
            return false;
        };
        let Some(frame) = self.frame_source.request_frame() else {
            return false;
        };
        source.on_frame(VideoFrame::Frame(frame));
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn notify_controller(&self, player: Option<PlayerId>) {
        if let Some(listener) = self.listener.read().as_ref() {
            listener(player);
        }
    }
}
