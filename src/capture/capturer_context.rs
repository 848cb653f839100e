//! Triple-buffered frame capture
//!
//! Each context owns four texture slots: two write slots used by GPU copies
//! of alternating parity, `temp` holding the newest completed copy and
//! `read` holding the frame handed to the consumer. Slots change roles by
//! swapping texture references under `state`, pixels are never copied on
//! the CPU.
//!
//! The renderer never waits: if the write slot for the current parity is
//! still being copied into, the incoming frame is dropped. The consumer
//! never waits either: it gets the newest completed frame, or the one it
//! already had.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::frame::CapturedFrame;
use crate::rhi::{Rhi, TextureDesc, TextureFormat, TextureRef};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Deferred access to the newest captured frame
///
/// Invoking it performs the temp/read swap, so it should run as late as
/// possible, right before the frame is consumed.
pub type TextureObtainer = Box<dyn FnOnce() -> Option<CapturedFrame> + Send>;

#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    frame_id: u64,
    timestamp_us: i64,
}

struct Slots {
    desc: TextureDesc,
    generation: u64,
    parity: usize,
    write: [TextureRef; 2],
    in_flight: [bool; 2],
    temp: TextureRef,
    temp_meta: Option<FrameMeta>,
    temp_dirty: bool,
    read: TextureRef,
    read_meta: Option<FrameMeta>,
    pending_resize: Option<(u32, u32)>,
}

impl Slots {
    fn allocate(rhi: &dyn Rhi, desc: TextureDesc, generation: u64) -> Self {
        Self {
            desc,
            generation,
            parity: 0,
            write: [rhi.create_texture(desc), rhi.create_texture(desc)],
            in_flight: [false; 2],
            temp: rhi.create_texture(desc),
            temp_meta: None,
            temp_dirty: false,
            read: rhi.create_texture(desc),
            read_meta: None,
            pending_resize: None,
        }
    }

    fn newest_id(&self) -> u64 {
        let temp = self.temp_meta.map(|m| m.frame_id).unwrap_or(0);
        let read = self.read_meta.map(|m| m.frame_id).unwrap_or(0);
        temp.max(read)
    }
}

pub struct CapturerContext {
    rhi: Arc<dyn Rhi>,
    fixed_resolution: bool,
    state: Mutex<Slots>,
    next_frame_id: AtomicU64,
    started: Instant,
    runtime: Option<tokio::runtime::Handle>,
    throttler: LogThrottler,
}

impl CapturerContext {
    pub fn new(rhi: Arc<dyn Rhi>, width: u32, height: u32, fixed_resolution: bool) -> Arc<Self> {
        Self::with_format(rhi, width, height, TextureFormat::Rgba8, fixed_resolution)
    }

    pub fn with_format(
        rhi: Arc<dyn Rhi>,
        width: u32,
        height: u32,
        format: TextureFormat,
        fixed_resolution: bool,
    ) -> Arc<Self> {
        let desc = TextureDesc::new(width, height, format);
        let slots = Slots::allocate(rhi.as_ref(), desc, 0);
        debug!("Capturer context created: {}", desc);
        Arc::new(Self {
            rhi,
            fixed_resolution,
            state: Mutex::new(slots),
            next_frame_id: AtomicU64::new(1),
            started: Instant::now(),
            runtime: tokio::runtime::Handle::try_current().ok(),
            throttler: LogThrottler::default(),
        })
    }

    /// Current capture size
    pub fn resolution(&self) -> (u32, u32) {
        let state = self.state.lock();
        state
            .pending_resize
            .unwrap_or((state.desc.width, state.desc.height))
    }

    pub fn is_fixed_resolution(&self) -> bool {
        self.fixed_resolution
    }

    /// Request a new capture size
    ///
    /// Takes effect on the next `capture_frame`, which reallocates every
    /// slot. Copies still in flight at that point are discarded when they
    /// complete.
    pub fn set_capture_resolution(&self, width: u32, height: u32) {
        if self.fixed_resolution {
            warn!(
                "Capture resolution is fixed, ignoring change to {}x{}",
                width, height
            );
            return;
        }
        let mut state = self.state.lock();
        if state.pending_resize.is_none() && (state.desc.width, state.desc.height) == (width, height)
        {
            return;
        }
        info!(
            "Capture resolution change requested: {}x{} -> {}x{}",
            state.desc.width, state.desc.height, width, height
        );
        state.pending_resize = Some((width, height));
    }

    /// Start copying `source` into the idle write slot
    ///
    /// Returns the frame id assigned to the copy, or `None` when the frame
    /// was dropped because that slot is still busy.
    pub fn capture_frame(self: &Arc<Self>, source: &TextureRef) -> Option<u64> {
        let mut state = self.state.lock();

        if let Some((width, height)) = state.pending_resize.take() {
            let desc = TextureDesc::new(width, height, state.desc.format);
            let generation = state.generation + 1;
            *state = Slots::allocate(self.rhi.as_ref(), desc, generation);
            info!("Capture slots reallocated: {} (generation {})", desc, generation);
        }

        let index = state.parity;
        if state.in_flight[index] {
            warn_throttled!(
                self.throttler,
                "write_slot_busy",
                "Capture write slot {} still in flight, dropping frame",
                index
            );
            return None;
        }
        state.parity ^= 1;

        // The consumer may still hold this texture from an earlier read
        if Arc::strong_count(&state.write[index]) > 1 {
            state.write[index] = self.rhi.create_texture(state.desc);
        }
        state.in_flight[index] = true;
        let target = state.write[index].clone();
        let generation = state.generation;

        let meta = FrameMeta {
            frame_id: self.next_frame_id.fetch_add(1, Ordering::Relaxed),
            timestamp_us: self.started.elapsed().as_micros() as i64,
        };
        drop(state);

        let fence = self.rhi.copy_texture(source, &target);
        drop(target);

        let this = self.clone();
        let poll = move || {
            // Fences have no blocking wait, spinning here is intended
            fence.spin_wait();
            this.on_copy_complete(index, generation, meta);
        };
        match &self.runtime {
            Some(handle) => {
                handle.spawn_blocking(poll);
            }
            None => {
                if let Err(e) = std::thread::Builder::new()
                    .name("fence-poll".to_string())
                    .spawn(poll)
                {
                    warn!("Failed to spawn fence poll thread: {}", e);
                    let mut state = self.state.lock();
                    if state.generation == generation {
                        state.in_flight[index] = false;
                    }
                    return None;
                }
            }
        }

        Some(meta.frame_id)
    }

    fn on_copy_complete(&self, index: usize, generation: u64, meta: FrameMeta) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(
                "Discarding frame {} copied before resolution change",
                meta.frame_id
            );
            return;
        }
        state.in_flight[index] = false;

        if meta.frame_id <= state.newest_id() {
            return;
        }
        let slots = &mut *state;
        std::mem::swap(&mut slots.write[index], &mut slots.temp);
        slots.temp_meta = Some(meta);
        slots.temp_dirty = true;
    }

    /// Deferred handle to the newest completed frame
    pub fn request_newest_captured_frame(self: &Arc<Self>) -> TextureObtainer {
        let this = self.clone();
        Box::new(move || this.obtain())
    }

    fn obtain(&self) -> Option<CapturedFrame> {
        let mut state = self.state.lock();
        if state.temp_dirty {
            let slots = &mut *state;
            std::mem::swap(&mut slots.temp, &mut slots.read);
            slots.read_meta = slots.temp_meta.take();
            slots.temp_dirty = false;
        }
        state.read_meta.map(|meta| CapturedFrame {
            texture: state.read.clone(),
            timestamp_us: meta.timestamp_us,
            frame_id: meta.frame_id,
        })
    }

    /// Whether a completed frame can be obtained
    pub fn has_frame(&self) -> bool {
        let state = self.state.lock();
        state.temp_dirty || state.read_meta.is_some()
    }

    #[cfg(test)]
    fn slot_descs(&self) -> Vec<TextureDesc> {
        let state = self.state.lock();
        vec![
            state.write[0].desc(),
            state.write[1].desc(),
            state.temp.desc(),
            state.read.desc(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::{SoftwareRhi, Texture};
    use std::collections::HashMap;
    use std::time::Duration;

    fn solid(width: u32, height: u32, value: u8) -> TextureRef {
        Arc::new(Texture::with_data(
            TextureDesc::rgba(width, height),
            vec![value; (width * height * 4) as usize],
        ))
    }

    fn wait_for_frame(ctx: &Arc<CapturerContext>) -> CapturedFrame {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(frame) = ctx.request_newest_captured_frame()() {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame captured");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_no_frame_before_first_copy() {
        let rhi = SoftwareRhi::start().unwrap();
        let ctx = CapturerContext::new(rhi, 8, 8, false);
        assert!(!ctx.has_frame());
        assert!(ctx.request_newest_captured_frame()().is_none());
    }

    #[test]
    fn test_request_is_idempotent_without_new_capture() {
        let rhi = SoftwareRhi::start().unwrap();
        let ctx = CapturerContext::new(rhi, 8, 8, false);

        ctx.capture_frame(&solid(8, 8, 7)).unwrap();
        let first = wait_for_frame(&ctx);
        let second = ctx.request_newest_captured_frame()().unwrap();

        assert_eq!(first.texture.id(), second.texture.id());
        assert_eq!(first.frame_id, second.frame_id);
        assert!(first.texture.pixels().iter().all(|&b| b == 7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_consumer_sees_monotonic_untorn_frames() {
        let rhi = SoftwareRhi::start().unwrap();
        let ctx = CapturerContext::new(rhi, 32, 32, false);

        let producer_ctx = ctx.clone();
        let producer = std::thread::spawn(move || {
            let mut issued = HashMap::new();
            for i in 0..300u32 {
                let value = (i % 251) as u8;
                if let Some(id) = producer_ctx.capture_frame(&solid(32, 32, value)) {
                    issued.insert(id, value);
                }
                if i % 3 == 0 {
                    std::thread::sleep(Duration::from_micros(200));
                }
            }
            issued
        });

        let mut observed = Vec::new();
        while !producer.is_finished() {
            if let Some(frame) = ctx.request_newest_captured_frame()() {
                let first = frame.texture.pixels()[0];
                assert!(
                    frame.texture.pixels().iter().all(|&b| b == first),
                    "torn frame {}",
                    frame.frame_id
                );
                observed.push((frame.frame_id, frame.timestamp_us, first));
            }
            std::thread::sleep(Duration::from_micros(300));
        }
        let issued = producer.join().unwrap();

        assert!(!observed.is_empty());
        for pair in observed.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
            assert!(pair[1].1 >= pair[0].1);
        }
        for (id, _, value) in &observed {
            assert_eq!(issued.get(id), Some(value));
        }
    }

    #[test]
    fn test_resolution_change_reallocates_all_slots() {
        let rhi = SoftwareRhi::start().unwrap();
        let ctx = CapturerContext::new(rhi, 1920, 1080, false);

        ctx.capture_frame(&solid(1920, 1080, 1)).unwrap();
        let before = wait_for_frame(&ctx);
        assert_eq!((before.width(), before.height()), (1920, 1080));

        // A copy still in flight at the change must never surface
        ctx.capture_frame(&solid(1920, 1080, 2));
        ctx.set_capture_resolution(1280, 720);
        assert_eq!(ctx.resolution(), (1280, 720));

        let id = ctx.capture_frame(&solid(1920, 1080, 3)).unwrap();
        for desc in ctx.slot_descs() {
            assert_eq!((desc.width, desc.height), (1280, 720));
        }

        let after = wait_for_frame(&ctx);
        assert_eq!((after.width(), after.height()), (1280, 720));
        assert_eq!(after.frame_id, id);
        assert!(after.texture.pixels().iter().all(|&b| b == 3));
    }

    #[test]
    fn test_fixed_resolution_ignores_changes() {
        let rhi = SoftwareRhi::start().unwrap();
        let ctx = CapturerContext::new(rhi, 64, 64, true);
        ctx.set_capture_resolution(32, 32);
        assert_eq!(ctx.resolution(), (64, 64));

        ctx.capture_frame(&solid(128, 128, 9)).unwrap();
        let frame = wait_for_frame(&ctx);
        assert_eq!((frame.width(), frame.height()), (64, 64));
    }

    #[test]
    fn test_held_read_texture_is_never_overwritten() {
        let rhi = SoftwareRhi::start().unwrap();
        let ctx = CapturerContext::new(rhi, 4, 4, false);

        ctx.capture_frame(&solid(4, 4, 10)).unwrap();
        let held = wait_for_frame(&ctx);

        for value in 11..20 {
            ctx.capture_frame(&solid(4, 4, value));
            let deadline = Instant::now() + Duration::from_secs(5);
            while ctx.state.lock().in_flight.iter().any(|f| *f) {
                assert!(Instant::now() < deadline);
                std::thread::yield_now();
            }
            ctx.request_newest_captured_frame()();
        }
        assert!(held.texture.pixels().iter().all(|&b| b == 10));
    }
}
