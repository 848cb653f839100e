//! Streamer - top-level orchestration
//!
//! Ties the pipeline together and answers the signalling server.
//!
//! # Architecture
//!
//! ```text
//! Streamer
//!     |
//!     +-- FrameSource (back-buffer copies per simulcast layer)
//!     |
//!     +-- FramePump (frame-pump thread)
//!     |       +-- PlayerVideoSource[] -> PeerVideoEncoder shims
//!     |
//!     +-- EncoderContext (one shared encoder, fan-out to every shim)
//!     |
//!     +-- PlayerSession[] (peer connection, video/audio tracks, data channel)
//!     |
//!     +-- SignallingServerConnection (WebSocket JSON)
//!     |
//!     +-- PixelStreamingStats (game thread) / LatencyTester
//! ```
//!
//! The first player to connect becomes quality controller. Its shim is the
//! only one the pump feeds; everyone else receives the same encoded images.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capture::FrameSource;
use crate::config::{ConfigStore, StreamerConfig};
use crate::encoder::{
    EncodeObserver, EncodedImage, EncoderContext, EncoderCreator, RateControlParameters,
    VideoCodecSettings, VideoEncoderFactory,
};
use crate::error::{AppError, Result};
use crate::latency::{now_ms, LatencyTester};
use crate::pump::{join_pump, FramePump};
use crate::rhi::{Rhi, SoftwareRhi, TextureRef};
use crate::session::{
    audio::AUDIO_QUEUE_DEPTH, build_ice_servers, AudioFrame, FromPlayerMessage, InputHandler, InputRouter, PlayerSession, SessionEvent,
    SessionParams, ToPlayerMessage,
};
use crate::signalling::{
    IceCandidateInit, IceServer, PeerConnectionOptions, PlayerId, SignallingObserver,
    SignallingServerConnection, SignallingTransport,
};
use crate::stats::{names, PixelStreamingStats};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Resolution offered before the first back-buffer arrives
const DEFAULT_RESOLUTION: (u32, u32) = (1280, 720);

pub struct Streamer {
    config: ConfigStore,
    rhi: Arc<dyn Rhi>,
    frame_source: Arc<FrameSource>,
    pump: FramePump,
    factory: VideoEncoderFactory,
    stats: Arc<PixelStreamingStats>,
    latency: Arc<LatencyTester>,
    input: InputRouter,
    sessions: RwLock<HashMap<PlayerId, Arc<PlayerSession>>>,
    signalling: RwLock<Option<Arc<dyn SignallingTransport>>>,
    connection: Mutex<Option<Arc<SignallingServerConnection>>>,
    remote_ice_servers: RwLock<Vec<IceServer>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    audio_tx: broadcast::Sender<AudioFrame>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    /// Last freeze frame, replayed to players joining while frozen
    freeze_frame: RwLock<Option<Bytes>>,
    streaming: AtomicBool,
    runtime: Handle,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    throttler: LogThrottler,
}

impl Streamer {
    /// Build the pipeline; nothing runs until [`Streamer::start`]
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ConfigStore,
        creator: EncoderCreator,
        input_handler: Arc<dyn InputHandler>,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| AppError::Internal(format!("streamer needs a tokio runtime: {}", e)))?;
        let cfg = config.get();
        cfg.validate()?;

        let rhi: Arc<dyn Rhi> = SoftwareRhi::start()?;
        let scales = cfg.simulcast.layers.iter().map(|l| l.scale).collect();
        let frame_source = Arc::new(FrameSource::new(rhi.clone(), scales, &cfg.capture));
        let pump = FramePump::new(frame_source.clone(), cfg.capture.fps);
        let context = EncoderContext::new(
            rhi.clone(),
            creator,
            cfg.encoder.clone(),
            cfg.simulcast.layers.clone(),
        )?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (audio_tx, _) = broadcast::channel(AUDIO_QUEUE_DEPTH);

        let streamer = Arc::new(Self {
            rhi,
            frame_source,
            pump,
            factory: VideoEncoderFactory::new(context),
            stats: Arc::new(PixelStreamingStats::new()?),
            latency: Arc::new(LatencyTester::new()),
            input: InputRouter::new(input_handler, &cfg.input.filtered_keys),
            sessions: RwLock::new(HashMap::new()),
            signalling: RwLock::new(None),
            connection: Mutex::new(None),
            remote_ice_servers: RwLock::new(Vec::new()),
            event_tx,
            audio_tx,
            event_rx: Mutex::new(Some(event_rx)),
            freeze_frame: RwLock::new(None),
            streaming: AtomicBool::new(true),
            runtime,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            throttler: LogThrottler::default(),
            config,
        });

        let observer: Weak<dyn EncodeObserver> = Arc::downgrade(&streamer) as Weak<Streamer>;
        streamer.factory.context().set_observer(observer);

        let weak = Arc::downgrade(&streamer);
        streamer
            .pump
            .set_controller_listener(Box::new(move |controller: Option<PlayerId>| {
                if let Some(streamer) = weak.upgrade() {
                    streamer.on_controller_changed(controller);
                }
            }));

        info!(
            "Streamer created: {} at {} fps, {} simulcast layer(s)",
            cfg.encoder.codec,
            cfg.capture.fps,
            cfg.simulcast.layers.len()
        );
        Ok(streamer)
    }

    pub fn rhi(&self) -> &Arc<dyn Rhi> {
        &self.rhi
    }

    pub fn frame_source(&self) -> &Arc<FrameSource> {
        &self.frame_source
    }

    pub fn pump(&self) -> &FramePump {
        &self.pump
    }

    pub fn encoder_context(&self) -> &Arc<EncoderContext> {
        self.factory.context()
    }

    pub fn stats(&self) -> &Arc<PixelStreamingStats> {
        &self.stats
    }

    pub fn latency(&self) -> &Arc<LatencyTester> {
        &self.latency
    }

    pub fn input(&self) -> &InputRouter {
        &self.input
    }

    pub fn session(&self, player: &PlayerId) -> Option<Arc<PlayerSession>> {
        self.sessions.read().get(player).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Route outgoing signalling through `transport`
    pub fn set_signalling_transport(&self, transport: Arc<dyn SignallingTransport>) {
        *self.signalling.write() = Some(transport);
    }

    /// Start the pump and background tasks, then connect to signalling
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.start_pipeline()?;

        let observer: Weak<dyn SignallingObserver> = Arc::downgrade(self) as Weak<Streamer>;
        let connection = SignallingServerConnection::new(self.config.get().signalling.clone(), observer);
        info!(
            "Connecting to signalling server {} as {}",
            self.config.get().signalling.url,
            connection.endpoint_id()
        );
        self.set_signalling_transport(connection.clone());
        let handle = connection.start();
        *self.connection.lock() = Some(connection);
        self.tasks.lock().push(handle);
        Ok(())
    }

    /// Start everything except the signalling connection
    pub fn start_pipeline(self: &Arc<Self>) -> Result<()> {
        self.pump.start()?;

        let mut tasks = self.tasks.lock();
        if let Some(rx) = self.event_rx.lock().take() {
            tasks.push(self.spawn_event_loop(rx));
        }
        tasks.push(self.spawn_stats_reporter());
        tasks.push(self.spawn_config_watcher());
        if self.config.get().stats.hud_enabled {
            tasks.push(self.spawn_hud());
        }
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping streamer");
        self.cancel.cancel();
        if let Some(connection) = self.connection.lock().take() {
            connection.stop();
        }
        if let Some(handle) = self.pump.request_stop() {
            if let Err(e) = tokio::task::spawn_blocking(move || join_pump(handle)).await {
                warn!("Joining the frame pump failed: {}", e);
            }
        }
        self.disconnect_all("streamer stopped").await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Entry point for every rendered back-buffer
    pub fn on_backbuffer_ready(&self, texture: &TextureRef) {
        if !self.is_streaming() {
            return;
        }
        let pre_capture = now_ms();
        self.frame_source.on_backbuffer_ready(texture);
        self.latency.on_frame_captured(pre_capture);
    }

    /// Fan one Opus packet out to every player's audio sink
    ///
    /// Returns how many sinks it was queued for.
    pub fn submit_audio(&self, frame: AudioFrame) -> usize {
        if !self.is_streaming() {
            return 0;
        }
        match self.audio_tx.send(frame) {
            Ok(sinks) => sinks,
            Err(_) => {
                trace!("No audio sinks, packet dropped");
                0
            }
        }
    }

    // ---------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------

    fn transport(&self) -> Option<Arc<dyn SignallingTransport>> {
        self.signalling.read().clone()
    }

    fn session_params(&self, player_id: PlayerId) -> SessionParams {
        let cfg = self.config.get();
        let (width, height) = self
            .frame_source
            .capture_resolution()
            .or_else(|| cfg.capture.capture_size.map(|s| (s.width, s.height)))
            .unwrap_or(DEFAULT_RESOLUTION);
        let ice_servers = build_ice_servers(&cfg.webrtc, &self.remote_ice_servers.read());
        SessionParams {
            player_id,
            ice_servers,
            codec_settings: VideoCodecSettings {
                codec: cfg.encoder.codec,
                width,
                height,
                max_framerate: self.pump.fps(),
                start_bitrate_bps: cfg.encoder.target_bitrate_bps,
                max_bitrate_bps: cfg.encoder.max_bitrate_bps,
            },
            simulcast_index: 0,
            audio: self.audio_tx.subscribe(),
        }
    }

    async fn create_session(&self, player_id: PlayerId) -> Result<Arc<PlayerSession>> {
        if self.session(&player_id).is_some() {
            warn!("Player {} already has a session, replacing it", player_id);
            self.remove_player(&player_id, "replaced by new session").await;
        }

        let params = self.session_params(player_id.clone());
        let session = PlayerSession::create(params, &self.factory, self.event_tx.clone()).await?;
        let count = {
            let mut sessions = self.sessions.write();
            sessions.insert(player_id.clone(), session.clone());
            sessions.len()
        };

        self.pump.add_source(session.video_source().clone());
        if self.pump.quality_controller().is_none() {
            self.pump.set_quality_controller(Some(player_id.clone()));
        }
        self.stats
            .store_application_stat(names::CONNECTED_PLAYERS, count as f64, false);
        info!("Player {} joined ({} connected)", player_id, count);
        Ok(session)
    }

    /// Tear down a player's session without telling signalling
    pub async fn remove_player(&self, player_id: &PlayerId, reason: &str) -> bool {
        let (session, count) = {
            let mut sessions = self.sessions.write();
            (sessions.remove(player_id), sessions.len())
        };
        let Some(session) = session else {
            debug!("Player {} has no session to remove", player_id);
            return false;
        };

        self.pump.remove_source(player_id);
        self.factory.context().remove_player(player_id);
        self.stats.remove_peer_stats(player_id);
        self.latency.cancel_for(player_id);
        session.disconnect(reason).await;
        self.stats
            .store_application_stat(names::CONNECTED_PLAYERS, count as f64, false);
        info!("Player {} left: {} ({} connected)", player_id, reason, count);
        true
    }

    /// Ask signalling to drop the player, then tear the session down
    pub async fn disconnect_player(&self, player_id: &PlayerId, reason: &str) {
        if let Some(transport) = self.transport() {
            if let Err(e) = transport.send_disconnect_player(player_id, reason) {
                warn!("Failed to send disconnectPlayer for {}: {}", player_id, e);
            }
        }
        self.remove_player(player_id, reason).await;
    }

    async fn disconnect_all(&self, reason: &str) {
        let players: Vec<PlayerId> = self.sessions.read().keys().cloned().collect();
        for player in players {
            self.remove_player(&player, reason).await;
        }
    }

    fn snapshot_sessions(&self) -> Vec<Arc<PlayerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    fn on_controller_changed(&self, controller: Option<PlayerId>) {
        self.factory.context().set_controller(controller.clone());
        let sessions = self.snapshot_sessions();
        self.runtime.spawn(async move {
            for session in sessions {
                let owns = controller.as_ref() == Some(session.player_id());
                if let Err(e) = session.send(&ToPlayerMessage::QualityControlOwnership(owns)).await {
                    trace!("Ownership not sent to {}: {}", session.player_id(), e);
                }
            }
        });
    }

    // ---------------------------------------------------------------
    // Data channel
    // ---------------------------------------------------------------

    pub async fn send_to_player(&self, player_id: &PlayerId, message: &ToPlayerMessage) -> Result<()> {
        let session = self
            .session(player_id)
            .ok_or_else(|| AppError::NotFound(format!("player {}", player_id)))?;
        session.send(message).await
    }

    /// Send to every player whose data channel is open
    pub async fn broadcast(&self, message: &ToPlayerMessage) -> usize {
        let mut delivered = 0;
        for session in self.snapshot_sessions() {
            match session.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => trace!("Broadcast skipped {}: {}", session.player_id(), e),
            }
        }
        delivered
    }

    /// Show a still image on every player until [`Streamer::unfreeze_frame`]
    pub async fn freeze_frame(&self, jpeg: Bytes) -> usize {
        *self.freeze_frame.write() = Some(jpeg.clone());
        self.broadcast(&ToPlayerMessage::FreezeFrame(jpeg)).await
    }

    pub async fn unfreeze_frame(&self) -> usize {
        *self.freeze_frame.write() = None;
        self.broadcast(&ToPlayerMessage::UnfreezeFrame).await
    }

    /// Transfer a file: mime type, then extension, then contents
    pub async fn send_file(
        &self,
        player_id: &PlayerId,
        mime_type: &str,
        extension: &str,
        contents: Bytes,
    ) -> Result<()> {
        self.send_to_player(player_id, &ToPlayerMessage::FileMimeType(mime_type.to_string()))
            .await?;
        self.send_to_player(player_id, &ToPlayerMessage::FileExtension(extension.to_string()))
            .await?;
        self.send_to_player(player_id, &ToPlayerMessage::FileContents(contents))
            .await
    }

    fn initial_settings(&self) -> String {
        let cfg: Arc<StreamerConfig> = self.config.get();
        let min_bitrate = cfg
            .simulcast
            .layers
            .iter()
            .map(|l| l.min_bitrate_bps)
            .min()
            .unwrap_or(0);
        json!({
            "PixelStreaming": {
                "AllowPixelStreamingCommands": false,
                "DisableLatencyTest": false,
            },
            "Encoder": {
                "TargetBitrate": cfg.encoder.target_bitrate_bps,
                "MaxBitrate": cfg.encoder.max_bitrate_bps,
                "MinQP": cfg.encoder.min_qp,
                "MaxQP": cfg.encoder.max_qp,
                "RateControl": cfg.encoder.rate_control,
            },
            "WebRTC": {
                "DegradationPref": cfg.webrtc.degradation_preference,
                "FPS": self.pump.fps(),
                "MinBitrate": min_bitrate,
                "MaxBitrate": cfg.encoder.max_bitrate_bps,
            },
        })
        .to_string()
    }

    async fn on_data_channel_open(&self, player_id: &PlayerId) {
        let owns = self.pump.quality_controller().as_ref() == Some(player_id);
        let mut messages = vec![
            ToPlayerMessage::QualityControlOwnership(owns),
            ToPlayerMessage::InitialSettings(self.initial_settings()),
        ];
        if let Some(jpeg) = self.freeze_frame.read().clone() {
            messages.push(ToPlayerMessage::FreezeFrame(jpeg));
        }
        for message in &messages {
            if let Err(e) = self.send_to_player(player_id, message).await {
                warn!("Initial message to {} failed: {}", player_id, e);
                break;
            }
        }
    }

    /// Act on one binary message from a player
    pub async fn handle_player_message(&self, player_id: &PlayerId, data: &[u8]) {
        let message = match FromPlayerMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                warn_throttled!(
                    self.throttler,
                    "bad_dc_message",
                    "Bad data channel message from {}: {}",
                    player_id,
                    e
                );
                return;
            }
        };

        match message {
            FromPlayerMessage::IFrameRequest => {
                debug!("Keyframe requested by {}", player_id);
                self.factory.context().request_keyframe();
            }
            FromPlayerMessage::RequestQualityControl => {
                self.pump.set_quality_controller(Some(player_id.clone()));
            }
            FromPlayerMessage::MaxFpsRequest(fps) => {
                let fps = if fps == 0 {
                    self.config.get().capture.fps
                } else {
                    fps as u32
                };
                self.pump.set_fps(fps);
            }
            FromPlayerMessage::AverageBitrateRequest { min_kbps, max_kbps } => {
                self.on_bitrate_request(player_id, min_kbps, max_kbps);
            }
            FromPlayerMessage::StartStreaming => {
                info!("Streaming started by {}", player_id);
                self.streaming.store(true, Ordering::Release);
            }
            FromPlayerMessage::StopStreaming => {
                info!("Streaming stopped by {}", player_id);
                self.streaming.store(false, Ordering::Release);
            }
            FromPlayerMessage::LatencyTest(payload) => {
                debug!("Latency test from {}: {}", player_id, payload);
                self.latency.start(player_id);
            }
            FromPlayerMessage::RequestInitialSettings => {
                let settings = ToPlayerMessage::InitialSettings(self.initial_settings());
                if let Err(e) = self.send_to_player(player_id, &settings).await {
                    warn!("Initial settings to {} failed: {}", player_id, e);
                }
            }
            FromPlayerMessage::UiInteraction(descriptor) => {
                self.input.ui_interaction(player_id, &descriptor);
            }
            FromPlayerMessage::Command(command) => {
                self.input.command(player_id, &command);
            }
            FromPlayerMessage::Input(event) => {
                self.input.route(player_id, &event);
            }
        }
    }

    fn on_bitrate_request(&self, player_id: &PlayerId, min_kbps: u16, max_kbps: u16) {
        if max_kbps == 0 || min_kbps > max_kbps {
            warn!(
                "Ignoring bitrate request {}..{} kbps from {}",
                min_kbps, max_kbps, player_id
            );
            return;
        }
        let Some(session) = self.session(player_id) else {
            return;
        };
        let average_kbps = (min_kbps as u32 + max_kbps as u32) / 2;
        let code = session.encoder().set_rates(RateControlParameters {
            bitrate_bps: average_kbps * 1000,
            framerate_fps: self.pump.fps() as f64,
        });
        debug!(
            "Bitrate request {} kbps from {} -> {}",
            average_kbps, player_id, code
        );
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::IceCandidate {
                player_id,
                candidate,
            } => {
                if let Some(transport) = self.transport() {
                    if let Err(e) = transport.send_ice_candidate(&player_id, candidate) {
                        debug!("Candidate for {} not sent: {}", player_id, e);
                    }
                }
            }
            SessionEvent::Connected(player_id) => {
                info!("Player {} media connected", player_id);
            }
            SessionEvent::DataChannelOpen(player_id) => {
                self.on_data_channel_open(&player_id).await;
            }
            SessionEvent::DataChannelMessage { player_id, data } => {
                self.handle_player_message(&player_id, &data).await;
            }
            SessionEvent::ConnectionLost { player_id, reason } => {
                self.disconnect_player(&player_id, &reason).await;
            }
        }
    }

    // ---------------------------------------------------------------
    // Background tasks
    // ---------------------------------------------------------------

    fn spawn_event_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(streamer) = weak.upgrade() else {
                    break;
                };
                streamer.handle_session_event(event).await;
            }
            debug!("Session event loop finished");
        })
    }

    /// Per-peer stats and the `VideoEncoderAvgQP` feedback
    fn spawn_stats_reporter(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = Duration::from_millis(self.config.get().stats.qp_report_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(streamer) = weak.upgrade() else {
                    break;
                };
                streamer.report_stats().await;
            }
        })
    }

    async fn report_stats(&self) {
        for session in self.snapshot_sessions() {
            let player = session.player_id();
            self.stats
                .store_peer_stat(player, names::FRAMES_SENT, session.frames_sent() as f64, false);
            self.stats
                .store_peer_stat(player, names::BYTES_SENT, session.bytes_sent() as f64, false);
        }
        self.stats
            .store_application_stat(names::PUMP_FPS, self.pump.fps() as f64, false);

        if let Some(qp) = self.stats.application_stat(names::ENCODER_QP) {
            self.broadcast(&ToPlayerMessage::VideoEncoderAvgQp(format!("{:.0}", qp)))
                .await;
        }
    }

    fn spawn_config_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let mut changes = self.config.subscribe();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => change,
                };
                if let Err(tokio::sync::broadcast::error::RecvError::Closed) = change {
                    break;
                }
                let Some(streamer) = weak.upgrade() else {
                    break;
                };
                let cfg = streamer.config.get();
                streamer.input.set_filtered_keys(&cfg.input.filtered_keys);
                streamer.pump.set_fps(cfg.capture.fps);
                debug!("Applied configuration change");
            }
        })
    }

    fn spawn_hud(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(self.config.get().stats.hud_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(streamer) = weak.upgrade() else {
                    break;
                };
                for line in streamer.stats.render_hud() {
                    info!("[HUD] {}", line);
                }
            }
        })
    }
}

impl EncodeObserver for Streamer {
    fn on_frame_obtained(&self, _frame_id: u64) {
        self.latency.on_encode_begin();
    }

    fn on_encoded(&self, image: &EncodedImage, encode_time: Duration) {
        if image.simulcast_index != 0 {
            return;
        }
        if let Some(qp) = image.qp {
            self.stats
                .store_application_stat(names::ENCODER_QP, qp as f64, true);
        }
        self.stats.store_application_stat(
            names::ENCODE_TIME_MS,
            encode_time.as_secs_f64() * 1000.0,
            true,
        );
        self.stats
            .store_application_stat(names::FRAMES_ENCODED, image.frame_id as f64, false);

        self.latency.on_encode_end();
        if let Some((player_id, results)) = self.latency.take_results() {
            let Some(session) = self.session(&player_id) else {
                return;
            };
            let payload = match serde_json::to_string(&results) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialise latency results: {}", e);
                    return;
                }
            };
            self.runtime.spawn(async move {
                if let Err(e) = session.send(&ToPlayerMessage::LatencyTest(payload)).await {
                    warn!("Latency results to {} failed: {}", session.player_id(), e);
                }
            });
        }
    }
}

#[async_trait]
impl SignallingObserver for Streamer {
    async fn on_connected(&self) {
        info!("Signalling connected");
    }

    async fn on_config(&self, options: PeerConnectionOptions) {
        debug!("Received {} ICE server(s) from signalling", options.ice_servers.len());
        *self.remote_ice_servers.write() = options.ice_servers;
    }

    async fn on_offer(&self, player_id: PlayerId, sdp: String) {
        let answer = match self.create_session(player_id.clone()).await {
            Ok(session) => session.on_offer(sdp).await,
            Err(e) => Err(e),
        };
        match answer {
            Ok(answer) => {
                let Some(transport) = self.transport() else {
                    warn!("No signalling link to answer {}", player_id);
                    return;
                };
                if let Err(e) = transport.send_answer(&player_id, answer) {
                    warn!("Failed to send answer to {}: {}", player_id, e);
                }
            }
            Err(e) => {
                error!("Failed to answer offer from {}: {}", player_id, e);
                self.disconnect_player(&player_id, &format!("failed to answer offer: {}", e))
                    .await;
            }
        }
    }

    async fn on_answer(&self, player_id: PlayerId, sdp: String) {
        let Some(session) = self.session(&player_id) else {
            warn!("Answer for unknown player {}", player_id);
            return;
        };
        if let Err(e) = session.on_answer(sdp).await {
            error!("Bad answer from {}: {}", player_id, e);
            self.disconnect_player(&player_id, &format!("bad answer: {}", e))
                .await;
        }
    }

    async fn on_remote_ice_candidate(&self, player_id: PlayerId, candidate: IceCandidateInit) {
        let Some(session) = self.session(&player_id) else {
            warn!("ICE candidate for unknown player {}", player_id);
            return;
        };
        if let Err(e) = session.add_remote_ice_candidate(candidate).await {
            warn!("Failed to add candidate for {}: {}", player_id, e);
        }
    }

    async fn on_player_connected(&self, player_id: PlayerId, data_channel: bool) {
        debug!("Player {} connected (data channel: {})", player_id, data_channel);
        if !self.config.get().signalling.offer_to_players {
            return;
        }
        let offer = match self.create_session(player_id.clone()).await {
            Ok(session) => session.create_offer().await,
            Err(e) => Err(e),
        };
        match (offer, self.transport()) {
            (Ok(sdp), Some(transport)) => {
                if let Err(e) = transport.send_offer(&player_id, sdp) {
                    warn!("Failed to send offer to {}: {}", player_id, e);
                }
            }
            (Ok(_), None) => warn!("No signalling link to offer {}", player_id),
            (Err(e), _) => {
                error!("Failed to create offer for {}: {}", player_id, e);
                self.disconnect_player(&player_id, &format!("failed to create offer: {}", e))
                    .await;
            }
        }
    }

    async fn on_player_disconnected(&self, player_id: PlayerId) {
        self.remove_player(&player_id, "player disconnected").await;
    }

    async fn on_player_count(&self, count: u32) {
        debug!("Signalling reports {} player(s)", count);
    }

    async fn on_disconnected(&self) {
        warn!("Signalling connection lost");
        self.disconnect_all("signalling connection lost").await;
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Never join here: the last handle may drop on a runtime worker
        if self.pump.request_stop().is_some() {
            debug!("Streamer dropped without stop, frame pump detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamerConfig;
    use crate::encoder::testing::{mock_creator, MockLog};
    use crate::session::datachannel::from_player;
    use crate::session::InputEvent;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::RTCPeerConnection;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
    use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Offer(PlayerId),
        Answer(PlayerId, String),
        Candidate(PlayerId),
        Disconnect(PlayerId, String),
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Sent>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }
    }

    impl SignallingTransport for RecordingTransport {
        fn send_offer(&self, player_id: &PlayerId, _sdp: String) -> Result<()> {
            self.sent.lock().push(Sent::Offer(player_id.clone()));
            Ok(())
        }

        fn send_answer(&self, player_id: &PlayerId, sdp: String) -> Result<()> {
            self.sent.lock().push(Sent::Answer(player_id.clone(), sdp));
            Ok(())
        }

        fn send_ice_candidate(&self, player_id: &PlayerId, _c: IceCandidateInit) -> Result<()> {
            self.sent.lock().push(Sent::Candidate(player_id.clone()));
            Ok(())
        }

        fn send_disconnect_player(&self, player_id: &PlayerId, reason: &str) -> Result<()> {
            self.sent
                .lock()
                .push(Sent::Disconnect(player_id.clone(), reason.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingInput {
        events: Mutex<Vec<(PlayerId, InputEvent)>>,
        commands: Mutex<Vec<String>>,
    }

    impl InputHandler for RecordingInput {
        fn on_input(&self, player: &PlayerId, event: &InputEvent) {
            self.events.lock().push((player.clone(), event.clone()));
        }

        fn on_command(&self, _player: &PlayerId, command: &str) {
            self.commands.lock().push(command.to_string());
        }
    }

    fn streamer_with(
        config: StreamerConfig,
        input: Arc<RecordingInput>,
    ) -> (Arc<Streamer>, Arc<RecordingTransport>) {
        let streamer = Streamer::new(
            ConfigStore::in_memory(config),
            mock_creator(MockLog::default()),
            input,
        )
        .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        streamer.set_signalling_transport(transport.clone());
        (streamer, transport)
    }

    async fn browser_offer() -> (RTCPeerConnection, String) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let browser = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        browser
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .unwrap();
        browser.create_data_channel("cirrus", None).await.unwrap();
        let offer = browser.create_offer(None).await.unwrap();
        browser.set_local_description(offer.clone()).await.unwrap();
        (browser, offer.sdp)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offer_answer_and_disconnect() {
        let (streamer, transport) = streamer_with(StreamerConfig::default(), Arc::default());
        let player = PlayerId::from(42u64);

        streamer
            .on_config(PeerConnectionOptions {
                ice_servers: vec![IceServer {
                    urls: vec!["stun:stun.example.org".into()],
                    username: None,
                    credential: None,
                }],
            })
            .await;
        assert_eq!(streamer.remote_ice_servers.read().len(), 1);

        let (browser, offer) = browser_offer().await;
        streamer.on_offer(player.clone(), offer).await;

        let answer = transport
            .sent()
            .into_iter()
            .find_map(|s| match s {
                Sent::Answer(p, sdp) if p == player => Some(sdp),
                _ => None,
            })
            .expect("answer sent");
        assert!(answer.contains("m=video"));
        assert_eq!(streamer.session_count(), 1);
        assert!(streamer.pump().has_source(&player));
        assert_eq!(streamer.pump().quality_controller(), Some(player.clone()));
        assert_eq!(streamer.encoder_context().sink_count(), 1);

        let session = streamer.session(&player).unwrap();
        assert!(session.audio().is_running());
        assert_eq!(streamer.submit_audio(AudioFrame::opus(vec![0xf8, 0xff, 0xfe], 20)), 1);

        streamer.on_player_disconnected(player.clone()).await;
        assert!(!session.audio().is_running());
        assert_eq!(streamer.session_count(), 0);
        assert_eq!(streamer.pump().quality_controller(), None);
        assert!(!streamer.pump().try_submit_frame());
        assert_eq!(streamer.encoder_context().sink_count(), 0);
        // Signalling already knows; nothing is sent back
        assert!(!transport
            .sent()
            .iter()
            .any(|s| matches!(s, Sent::Disconnect(..))));

        browser.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_offer_disconnects_player() {
        let (streamer, transport) = streamer_with(StreamerConfig::default(), Arc::default());
        let player = PlayerId::from("9");

        streamer.on_offer(player.clone(), "not sdp".to_string()).await;

        assert_eq!(streamer.session_count(), 0);
        assert!(transport
            .sent()
            .iter()
            .any(|s| matches!(s, Sent::Disconnect(p, _) if *p == player)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_player_messages_are_ignored() {
        let (streamer, transport) = streamer_with(StreamerConfig::default(), Arc::default());
        let ghost = PlayerId::from("ghost");

        streamer.on_answer(ghost.clone(), "v=0".to_string()).await;
        streamer
            .on_remote_ice_candidate(
                ghost.clone(),
                IceCandidateInit {
                    sdp_mid: "0".into(),
                    sdp_mline_index: 0,
                    candidate: "candidate:1 1 udp 1 127.0.0.1 1 typ host".into(),
                },
            )
            .await;
        assert!(!streamer.remove_player(&ghost, "gone").await);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_control_messages() {
        let (streamer, _transport) = streamer_with(StreamerConfig::default(), Arc::default());
        let player = PlayerId::from("1");

        streamer
            .handle_player_message(&player, &[from_player::MAX_FPS_REQUEST, 30])
            .await;
        assert_eq!(streamer.pump().fps(), 30);
        streamer
            .handle_player_message(&player, &[from_player::MAX_FPS_REQUEST, 0])
            .await;
        assert_eq!(streamer.pump().fps(), 60);

        streamer
            .handle_player_message(&player, &[from_player::REQUEST_QUALITY_CONTROL])
            .await;
        assert_eq!(streamer.pump().quality_controller(), Some(player.clone()));

        streamer
            .handle_player_message(&player, &[from_player::STOP_STREAMING])
            .await;
        assert!(!streamer.is_streaming());
        streamer
            .handle_player_message(&player, &[from_player::START_STREAMING])
            .await;
        assert!(streamer.is_streaming());

        let mut latency = vec![from_player::LATENCY_TEST, 2, 0];
        latency.extend_from_slice(&[b'{', 0, b'}', 0]);
        streamer.handle_player_message(&player, &latency).await;
        assert!(streamer.latency().is_active());

        // Garbage never panics
        streamer.handle_player_message(&player, &[]).await;
        streamer.handle_player_message(&player, &[200, 1, 2]).await;
    }

    #[tokio::test]
    async fn test_submit_audio_without_players() {
        let (streamer, _transport) = streamer_with(StreamerConfig::default(), Arc::default());
        assert_eq!(streamer.submit_audio(AudioFrame::opus(vec![0xf8], 20)), 0);
    }

    #[tokio::test]
    async fn test_drop_inside_runtime_does_not_wait_for_pump() {
        let (streamer, _transport) = streamer_with(StreamerConfig::default(), Arc::default());
        streamer.start_pipeline().unwrap();
        streamer
            .pump()
            .queue_task(Box::new(|| std::thread::sleep(Duration::from_millis(300))));
        // Let the pump thread pick the slow task up
        std::thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        drop(streamer);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_joins_pump() {
        let (streamer, _transport) = streamer_with(StreamerConfig::default(), Arc::default());
        streamer.start_pipeline().unwrap();
        assert!(streamer.pump().is_running());
        streamer.stop().await;
        assert!(!streamer.pump().is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_input_goes_through_key_filter() {
        let mut config = StreamerConfig::default();
        config.input.filtered_keys = vec![27];
        let input = Arc::new(RecordingInput::default());
        let (streamer, _transport) = streamer_with(config, input.clone());
        let player = PlayerId::from("3");

        streamer
            .handle_player_message(&player, &[from_player::KEY_DOWN, 27, 0])
            .await;
        streamer
            .handle_player_message(&player, &[from_player::KEY_DOWN, 65, 1])
            .await;
        streamer
            .handle_player_message(&player, &[from_player::COMMAND, 2, 0, b'h', 0, b'i', 0])
            .await;

        let events = input.events.lock().clone();
        assert_eq!(
            events,
            vec![(
                player.clone(),
                InputEvent::KeyDown {
                    key_code: 65,
                    repeat: true
                }
            )]
        );
        assert_eq!(*input.commands.lock(), vec!["hi".to_string()]);
        assert_eq!(streamer.input().counts(), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_freeze_frame_is_cached() {
        let (streamer, _transport) = streamer_with(StreamerConfig::default(), Arc::default());

        assert_eq!(streamer.freeze_frame(Bytes::from_static(b"\xff\xd8jpeg")).await, 0);
        assert!(streamer.freeze_frame.read().is_some());
        streamer.unfreeze_frame().await;
        assert!(streamer.freeze_frame.read().is_none());

        let settings: serde_json::Value =
            serde_json::from_str(&streamer.initial_settings()).unwrap();
        assert_eq!(settings["WebRTC"]["FPS"], 60);
        assert_eq!(settings["Encoder"]["RateControl"], "CBR");
    }
}
