//! WebSocket client for the signalling server

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::protocol::{
    parse_message, IceCandidateInit, IncomingMessage, OutgoingMessage, ParseOutcome,
    PeerConnectionOptions, PlayerId, PlayerIdFormat, CLOSE_CODE_PROTOCOL_ERROR,
};
use crate::config::SignallingConfig;
use crate::error::{AppError, Result};

/// Receiver of signalling events
#[async_trait]
pub trait SignallingObserver: Send + Sync {
    async fn on_connected(&self) {}
    async fn on_config(&self, options: PeerConnectionOptions);
    async fn on_offer(&self, player_id: PlayerId, sdp: String);
    async fn on_answer(&self, player_id: PlayerId, sdp: String);
    async fn on_remote_ice_candidate(&self, player_id: PlayerId, candidate: IceCandidateInit);
    async fn on_player_connected(&self, _player_id: PlayerId, _data_channel: bool) {}
    async fn on_player_disconnected(&self, player_id: PlayerId);
    async fn on_player_count(&self, _count: u32) {}
    async fn on_disconnected(&self) {}
}

/// Outgoing half of the signalling link as seen by sessions
pub trait SignallingTransport: Send + Sync {
    fn send_offer(&self, player_id: &PlayerId, sdp: String) -> Result<()>;
    fn send_answer(&self, player_id: &PlayerId, sdp: String) -> Result<()>;
    fn send_ice_candidate(&self, player_id: &PlayerId, candidate: IceCandidateInit) -> Result<()>;
    fn send_disconnect_player(&self, player_id: &PlayerId, reason: &str) -> Result<()>;
}

/// How a single connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    ClosedByServer,
    ProtocolError(String),
    Transport(String),
}

pub struct SignallingServerConnection {
    config: SignallingConfig,
    endpoint_id: String,
    format: PlayerIdFormat,
    observer: Weak<dyn SignallingObserver>,
    outgoing: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl SignallingServerConnection {
    pub fn new(config: SignallingConfig, observer: Weak<dyn SignallingObserver>) -> Arc<Self> {
        let endpoint_id = if config.streamer_id.is_empty() {
            format!("streamer-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        } else {
            config.streamer_id.clone()
        };
        Arc::new(Self {
            format: PlayerIdFormat::from_flag(config.send_player_id_as_integer),
            config,
            endpoint_id,
            observer,
            outgoing: RwLock::new(None),
            connected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn player_id_format(&self) -> PlayerIdFormat {
        self.format
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connect in the background, reconnecting when configured to
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this.run_once().await {
                    Ok(end) => info!("Signalling connection ended: {:?}", end),
                    Err(e) => warn!("Signalling connection failed: {}", e),
                }
                if this.cancel.is_cancelled() || !this.config.auto_reconnect {
                    break;
                }
                let delay = Duration::from_secs(this.config.reconnect_interval_secs.max(1));
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                debug!("Reconnecting to signalling server");
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One connection, from connect to close
    pub async fn run_once(&self) -> Result<SessionEnd> {
        info!("Connecting to signalling server {}", self.config.url);
        let (ws, _) = connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outgoing.write() = Some(tx);
        self.connected.store(true, Ordering::Release);
        info!("Connected to signalling server");

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Signalling write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        if let Some(observer) = self.observer.upgrade() {
            observer.on_connected().await;
        }

        let period = Duration::from_secs(self.config.keep_alive_interval_secs.max(1));
        let mut keep_alive = interval_at(Instant::now() + period, period);

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close(CloseCode::Normal, "streamer shutting down");
                    break SessionEnd::Cancelled;
                }
                _ = keep_alive.tick() => {
                    let time = chrono::Utc::now().timestamp();
                    if let Err(e) = self.send(OutgoingMessage::Ping { time }) {
                        debug!("Keep-alive not sent: {}", e);
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = self.handle_text(&text).await {
                            warn!("Closing signalling connection: {}", reason);
                            self.close(CloseCode::from(CLOSE_CODE_PROTOCOL_ERROR), &reason);
                            break SessionEnd::ProtocolError(reason);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Signalling server closed the connection: {:?}", frame);
                        break SessionEnd::ClosedByServer;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Transport(e.to_string()),
                    None => break SessionEnd::ClosedByServer,
                }
            }
        };

        self.outgoing.write().take();
        self.connected.store(false, Ordering::Release);
        if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
            debug!("Signalling writer did not finish in time");
        }
        if let Some(observer) = self.observer.upgrade() {
            observer.on_disconnected().await;
        }
        Ok(end)
    }

    /// Route one text frame; returns a reason when the socket must close
    async fn handle_text(&self, text: &str) -> Option<String> {
        trace!("Signalling <- {}", text);
        let message = match parse_message(text) {
            ParseOutcome::Message(message) => message,
            ParseOutcome::PlayerError { player_id, reason } => {
                warn!("Bad message for player {}: {}", player_id, reason);
                if let Err(e) = self.send_disconnect_player(&player_id, &reason) {
                    warn!("Failed to disconnect player {}: {}", player_id, e);
                }
                return None;
            }
            ParseOutcome::ProtocolError(reason) => return Some(reason),
            ParseOutcome::Ignored(kind) => {
                debug!("Ignoring signalling message '{}'", kind);
                return None;
            }
        };

        if let IncomingMessage::Identify = message {
            info!("Identifying as {}", self.endpoint_id);
            if let Err(e) = self.send(OutgoingMessage::EndpointId {
                id: self.endpoint_id.clone(),
            }) {
                warn!("Failed to send endpointId: {}", e);
            }
            return None;
        }
        if let IncomingMessage::Ping { time } = message {
            if let Err(e) = self.send(OutgoingMessage::Pong { time }) {
                debug!("Pong not sent: {}", e);
            }
            return None;
        }

        let Some(observer) = self.observer.upgrade() else {
            return None;
        };
        match message {
            IncomingMessage::Config {
                peer_connection_options,
            } => observer.on_config(peer_connection_options).await,
            IncomingMessage::Offer { sdp, player_id } => observer.on_offer(player_id, sdp).await,
            IncomingMessage::Answer { sdp, player_id } => observer.on_answer(player_id, sdp).await,
            IncomingMessage::IceCandidate {
                candidate,
                player_id,
            } => observer.on_remote_ice_candidate(player_id, candidate).await,
            IncomingMessage::PlayerCount { count } => observer.on_player_count(count).await,
            IncomingMessage::PlayerConnected {
                player_id,
                data_channel,
            } => observer.on_player_connected(player_id, data_channel).await,
            IncomingMessage::PlayerDisconnected { player_id } => {
                observer.on_player_disconnected(player_id).await
            }
            IncomingMessage::Pong { time } => trace!("Signalling pong {}", time),
            IncomingMessage::Identify | IncomingMessage::Ping { .. } => {}
        }
        None
    }

    fn close(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        if let Some(tx) = self.outgoing.read().as_ref() {
            let _ = tx.send(Message::Close(Some(frame)));
        }
    }

    pub fn send(&self, message: OutgoingMessage) -> Result<()> {
        let text = message.to_json()?;
        trace!("Signalling -> {}", text);
        let outgoing = self.outgoing.read();
        let tx = outgoing
            .as_ref()
            .ok_or_else(|| AppError::Signalling("not connected".to_string()))?;
        tx.send(Message::Text(text))
            .map_err(|_| AppError::Signalling("connection closed".to_string()))
    }
}

impl SignallingTransport for SignallingServerConnection {
    fn send_offer(&self, player_id: &PlayerId, sdp: String) -> Result<()> {
        self.send(OutgoingMessage::Offer {
            sdp,
            player_id: player_id.to_wire(self.format),
        })
    }

    fn send_answer(&self, player_id: &PlayerId, sdp: String) -> Result<()> {
        self.send(OutgoingMessage::Answer {
            sdp,
            player_id: player_id.to_wire(self.format),
        })
    }

    fn send_ice_candidate(&self, player_id: &PlayerId, candidate: IceCandidateInit) -> Result<()> {
        self.send(OutgoingMessage::IceCandidate {
            candidate,
            player_id: player_id.to_wire(self.format),
        })
    }

    fn send_disconnect_player(&self, player_id: &PlayerId, reason: &str) -> Result<()> {
        self.send(OutgoingMessage::DisconnectPlayer {
            player_id: player_id.to_wire(self.format),
            reason: reason.to_string(),
        })
    }
}
