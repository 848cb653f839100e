//! One browser peer: peer connection, video and audio tracks, data channel

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::audio::{AudioFrame, AudioSink};
use super::datachannel::ToPlayerMessage;
use crate::config::{CodecKind, WebRtcConfig};
use crate::encoder::{
    EncodedImage, PeerVideoEncoder, RateControlParameters, VideoCodecSettings, VideoEncoderFactory,
};
use crate::error::{AppError, Result};
use crate::pump::PlayerVideoSource;
use crate::signalling::{IceCandidateInit, IceServer, PlayerId};

const STREAM_ID: &str = "pixelstreaming";
const DATA_CHANNEL_LABEL: &str = "datachannel";
/// Encoded images queued for the track before new ones are dropped
const VIDEO_QUEUE_DEPTH: usize = 60;

/// Lifecycle of a player session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    IceGathering,
    Connected,
    /// Negotiation failed; only teardown remains
    Failed,
    Disconnecting,
    Destroyed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, OfferSent | OfferReceived) => true,
            (OfferSent | OfferReceived, AnswerExchanged) => true,
            (AnswerExchanged, IceGathering | Connected) => true,
            (IceGathering, Connected) => true,
            (Disconnecting, Destroyed) => true,
            (Disconnecting | Destroyed, _) => false,
            (Created | OfferSent | OfferReceived | AnswerExchanged | IceGathering, Failed) => true,
            (_, Disconnecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::OfferSent => "offer_sent",
            SessionState::OfferReceived => "offer_received",
            SessionState::AnswerExchanged => "answer_exchanged",
            SessionState::IceGathering => "ice_gathering",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Things a session reports to its owner
#[derive(Debug, Clone)]
pub enum SessionEvent {
    IceCandidate {
        player_id: PlayerId,
        candidate: IceCandidateInit,
    },
    Connected(PlayerId),
    DataChannelOpen(PlayerId),
    DataChannelMessage {
        player_id: PlayerId,
        data: Bytes,
    },
    ConnectionLost {
        player_id: PlayerId,
        reason: String,
    },
}

/// Merge configured servers with those the signalling server sent
pub fn build_ice_servers(config: &WebRtcConfig, remote: &[IceServer]) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    for url in &config.stun_servers {
        servers.push(RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        });
    }
    for turn in &config.turn_servers {
        if turn.username.is_empty() || turn.credential.is_empty() {
            warn!("Skipping TURN server {:?}, credentials missing", turn.urls);
            continue;
        }
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    for server in remote {
        servers.push(RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        });
    }
    servers
}

fn codec_capability(codec: CodecKind) -> RTCRtpCodecCapability {
    match codec {
        CodecKind::H264 => RTCRtpCodecCapability {
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_string(),
            rtcp_feedback: vec![],
        },
        CodecKind::Vp8 => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

/// Parameters for a new session
pub struct SessionParams {
    pub player_id: PlayerId,
    pub ice_servers: Vec<RTCIceServer>,
    pub codec_settings: VideoCodecSettings,
    /// Simulcast stream this player receives
    pub simulcast_index: usize,
    /// Opus packets submitted by the engine
    pub audio: broadcast::Receiver<AudioFrame>,
}

pub struct PlayerSession {
    player_id: PlayerId,
    state: Mutex<SessionState>,
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio: AudioSink,
    data_channel: RwLock<Option<Arc<RTCDataChannel>>>,
    encoder: Arc<PeerVideoEncoder>,
    video_source: Arc<PlayerVideoSource>,
    pending_candidates: Mutex<Vec<IceCandidateInit>>,
    disconnecting: AtomicBool,
    events: mpsc::UnboundedSender<SessionEvent>,
    frames_sent: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
}

impl PlayerSession {
    pub async fn create(
        params: SessionParams,
        factory: &VideoEncoderFactory,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        let SessionParams {
            player_id,
            ice_servers,
            codec_settings,
            simulcast_index,
            audio,
        } = params;
        info!(
            "Creating session for player {} ({} {}x{})",
            player_id, codec_settings.codec, codec_settings.width, codec_settings.height
        );

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(codec_settings.codec),
            format!("video-{}", player_id),
            STREAM_ID.to_string(),
        ));
        let sender = pc
            .add_track(video_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let audio_sink = AudioSink::new(&player_id, STREAM_ID);
        let audio_sender = pc.add_track(audio_sink.track()).await?;

        let encoder = factory.create_video_encoder();
        let code = encoder.init_encode(&codec_settings);
        if code < 0 {
            let _ = pc.close().await;
            return Err(AppError::Internal(format!(
                "encoder init for player {} failed with code {}",
                player_id, code
            )));
        }

        let video_source = Arc::new(PlayerVideoSource::new(player_id.clone(), encoder.clone()));
        let session = Arc::new(Self {
            player_id,
            state: Mutex::new(SessionState::Created),
            pc,
            video_track,
            audio: audio_sink,
            data_channel: RwLock::new(None),
            encoder,
            video_source,
            pending_candidates: Mutex::new(Vec::new()),
            disconnecting: AtomicBool::new(false),
            events,
            frames_sent: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
        });

        session.start_video(codec_settings.max_framerate, simulcast_index);
        session.start_audio(audio, audio_sender);
        session.start_rtcp_reader(sender, codec_settings.max_framerate);
        session.setup_event_handlers();
        Ok(session)
    }

    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn video_source(&self) -> &Arc<PlayerVideoSource> {
        &self.video_source
    }

    pub fn audio(&self) -> &AudioSink {
        &self.audio
    }

    pub fn encoder(&self) -> &Arc<PeerVideoEncoder> {
        &self.encoder
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn is_data_channel_open(&self) -> bool {
        self.data_channel
            .read()
            .as_ref()
            .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            debug!(
                "Player {} ignoring transition {} -> {}",
                self.player_id, *state, next
            );
            return false;
        }
        debug!("Player {} session {} -> {}", self.player_id, *state, next);
        *state = next;
        true
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("Session event receiver gone for player {}", self.player_id);
        }
    }

    /// Forward encoded images of one simulcast stream to the video track
    fn start_video(self: &Arc<Self>, fps: u32, simulcast_index: usize) {
        let (tx, mut rx) = mpsc::channel::<EncodedImage>(VIDEO_QUEUE_DEPTH);
        let weak_encoder = Arc::downgrade(&self.encoder);
        self.encoder
            .register_encode_complete_callback(Box::new(move |image: &EncodedImage| {
                if image.simulcast_index != simulcast_index {
                    return;
                }
                if tx.try_send(image.clone()).is_err() {
                    // Queue full: resync the decoder once it drains
                    if let Some(encoder) = weak_encoder.upgrade() {
                        encoder.request_keyframe();
                    }
                }
            }));

        let session = Arc::downgrade(self);
        let track = self.video_track.clone();
        let frames_sent = self.frames_sent.clone();
        let bytes_sent = self.bytes_sent.clone();
        let frame_duration = Duration::from_micros(1_000_000 / fps.max(1) as u64);
        tokio::spawn(async move {
            while let Some(image) = rx.recv().await {
                let connected = session
                    .upgrade()
                    .is_some_and(|s| s.state() == SessionState::Connected);
                if !connected {
                    continue;
                }
                let len = image.data.len() as u64;
                let sample = Sample {
                    data: image.data,
                    duration: frame_duration,
                    ..Default::default()
                };
                match track.write_sample(&sample).await {
                    Ok(()) => {
                        frames_sent.fetch_add(1, Ordering::Relaxed);
                        bytes_sent.fetch_add(len, Ordering::Relaxed);
                    }
                    Err(e) => trace!("write_sample failed: {}", e),
                }
            }
            debug!("Video writer finished");
        });
    }

    fn start_audio(self: &Arc<Self>, frames: broadcast::Receiver<AudioFrame>, sender: Arc<RTCRtpSender>) {
        let session = Arc::downgrade(self);
        self.audio.start(frames, move || {
            session
                .upgrade()
                .is_some_and(|s| s.state() == SessionState::Connected)
        });

        // Interceptors only run while someone reads the sender's RTCP
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }

    /// Drain RTCP; keyframe requests and REMB feed the encoder
    fn start_rtcp_reader(&self, sender: Arc<RTCRtpSender>, fps: u32) {
        let encoder = Arc::downgrade(&self.encoder);
        let player_id = self.player_id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((packets, _)) = sender.read(&mut buf).await {
                let Some(encoder) = encoder.upgrade() else {
                    break;
                };
                for packet in packets {
                    let any = packet.as_any();
                    if any.is::<PictureLossIndication>() || any.is::<FullIntraRequest>() {
                        trace!("Keyframe requested by player {}", player_id);
                        encoder.request_keyframe();
                    } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                        encoder.set_rates(RateControlParameters {
                            bitrate_bps: remb.bitrate as u32,
                            framerate_fps: fps.max(1) as f64,
                        });
                    }
                }
            }
            debug!("RTCP reader for player {} finished", player_id);
        });
    }

    fn setup_event_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let (Some(session), Some(candidate)) = (weak.upgrade(), candidate) else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => session.emit(SessionEvent::IceCandidate {
                            player_id: session.player_id.clone(),
                            candidate: IceCandidateInit {
                                sdp_mid: init.sdp_mid.unwrap_or_default(),
                                sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                                candidate: init.candidate,
                            },
                        }),
                        Err(e) => warn!("Failed to serialise local candidate: {}", e),
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    info!("Player {} peer connection {}", session.player_id, state);
                    match state {
                        RTCPeerConnectionState::Connected => {
                            if session.transition(SessionState::Connected) {
                                session.encoder.request_keyframe();
                                session.emit(SessionEvent::Connected(session.player_id.clone()));
                            }
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            if !session.disconnecting.load(Ordering::Acquire) {
                                session.emit(SessionEvent::ConnectionLost {
                                    player_id: session.player_id.clone(),
                                    reason: format!("peer connection {}", state),
                                });
                            }
                        }
                        _ => {}
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(session) = weak.upgrade() {
                        session.attach_data_channel(dc);
                    }
                })
            }));
    }

    fn attach_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        info!(
            "Player {} data channel '{}' attached",
            self.player_id,
            dc.label()
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.emit(SessionEvent::DataChannelOpen(session.player_id.clone()));
                }
            })
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.emit(SessionEvent::DataChannelMessage {
                        player_id: session.player_id.clone(),
                        data: msg.data,
                    });
                }
            })
        }));

        *self.data_channel.write() = Some(dc);
    }

    /// Answer a browser offer; returns the answer SDP
    pub async fn on_offer(&self, sdp: String) -> Result<String> {
        if !self.transition(SessionState::OfferReceived) {
            return Err(AppError::BadRequest(format!(
                "unexpected offer in state {}",
                self.state()
            )));
        }
        match self.answer_offer(sdp).await {
            Ok(answer) => {
                self.transition(SessionState::AnswerExchanged);
                self.transition(SessionState::IceGathering);
                Ok(answer)
            }
            Err(e) => Err(self.fail("offer", e)),
        }
    }

    async fn answer_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        self.flush_pending_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    /// Park the session in `Failed` and hand the error back
    fn fail(&self, stage: &str, err: AppError) -> AppError {
        warn!("Player {} {} negotiation failed: {}", self.player_id, stage, err);
        self.transition(SessionState::Failed);
        err
    }

    /// Start negotiation from this side; returns the offer SDP
    pub async fn create_offer(self: &Arc<Self>) -> Result<String> {
        if !self.transition(SessionState::OfferSent) {
            return Err(AppError::BadRequest(format!(
                "cannot offer in state {}",
                self.state()
            )));
        }
        let dc = self.pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
        self.attach_data_channel(dc);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    pub async fn on_answer(&self, sdp: String) -> Result<()> {
        if self.state() != SessionState::OfferSent {
            return Err(AppError::BadRequest(format!(
                "unexpected answer in state {}",
                self.state()
            )));
        }
        let applied = match RTCSessionDescription::answer(sdp) {
            Ok(answer) => self.pc.set_remote_description(answer).await,
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            return Err(self.fail("answer", e.into()));
        }
        self.transition(SessionState::AnswerExchanged);
        self.transition(SessionState::IceGathering);
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Add a remote candidate, holding it until a remote description exists
    pub async fn add_remote_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            trace!("Queueing early candidate for player {}", self.player_id);
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        self.add_candidate(candidate).await
    }

    async fn add_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: Some(candidate.sdp_mid),
                sdp_mline_index: Some(candidate.sdp_mline_index),
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<_> = self.pending_candidates.lock().drain(..).collect();
        for candidate in pending {
            if let Err(e) = self.add_candidate(candidate).await {
                warn!("Dropping queued candidate for player {}: {}", self.player_id, e);
            }
        }
    }

    /// Send one message over the data channel
    pub async fn send(&self, message: &ToPlayerMessage) -> Result<()> {
        let dc = self.data_channel.read().clone();
        let dc = dc.ok_or_else(|| {
            AppError::ServiceUnavailable(format!("player {} has no data channel", self.player_id))
        })?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(AppError::ServiceUnavailable(format!(
                "data channel of player {} is {}",
                self.player_id,
                dc.ready_state()
            )));
        }
        let payload = message.encode()?;
        dc.send(&payload).await?;
        Ok(())
    }

    /// Tear the session down; only the first call has any effect
    pub async fn disconnect(&self, reason: &str) -> bool {
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            debug!("Player {} already disconnecting", self.player_id);
            return false;
        }
        info!("Disconnecting player {}: {}", self.player_id, reason);
        self.transition(SessionState::Disconnecting);
        self.audio.stop();
        self.encoder.release();
        if let Err(e) = self.pc.close().await {
            warn!("Closing peer connection of {} failed: {}", self.player_id, e);
        }
        self.transition(SessionState::Destroyed);
        true
    }
}

impl fmt::Debug for PlayerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerSession")
            .field("player_id", &self.player_id)
            .field("state", &self.state())
            .finish()
    }
}
