//! Signalling server message model
//!
//! JSON text frames tagged by `type`. Player ids arrive either as JSON
//! integers or strings and are normalised into [`PlayerId`]; outgoing
//! messages emit them in the format the server expects.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Close code sent when the server itself sends something unparseable
pub const CLOSE_CODE_PROTOCOL_ERROR: u16 = 4000;

/// Logical player identity, independent of its wire format
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire form under the given format
    ///
    /// Ids that are not numeric stay strings even in integer mode.
    pub fn to_wire(&self, format: PlayerIdFormat) -> WirePlayerId {
        match format {
            PlayerIdFormat::Integer => match self.0.parse::<u64>() {
                Ok(n) => WirePlayerId::Int(n),
                Err(_) => WirePlayerId::Str(self.0.clone()),
            },
            PlayerIdFormat::String => WirePlayerId::Str(self.0.clone()),
        }
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PlayerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for PlayerId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl Serialize for PlayerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PlayerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PlayerIdVisitor;

        impl<'de> Visitor<'de> for PlayerIdVisitor {
            type Value = PlayerId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a player id as integer or string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PlayerId, E> {
                Ok(PlayerId::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PlayerId, E> {
                Ok(PlayerId(v.to_string()))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PlayerId, E> {
                if v.is_empty() {
                    return Err(E::custom("empty player id"));
                }
                Ok(PlayerId::from(v))
            }
        }

        deserializer.deserialize_any(PlayerIdVisitor)
    }
}

/// How player ids are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerIdFormat {
    #[default]
    String,
    Integer,
}

impl PlayerIdFormat {
    pub fn from_flag(send_as_integer: bool) -> Self {
        if send_as_integer {
            Self::Integer
        } else {
            Self::String
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WirePlayerId {
    Int(u64),
    Str(String),
}

/// ICE candidate as carried in `iceCandidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    pub candidate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

/// One entry of `peerConnectionOptions.iceServers`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "deserialize_urls")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

fn deserialize_urls<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PeerConnectionOptions {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

/// Messages received from the signalling server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    #[serde(rename = "identify")]
    Identify,
    #[serde(rename = "config")]
    Config {
        #[serde(rename = "peerConnectionOptions", default)]
        peer_connection_options: PeerConnectionOptions,
    },
    #[serde(rename = "offer")]
    Offer {
        sdp: String,
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },
    #[serde(rename = "answer")]
    Answer {
        sdp: String,
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },
    #[serde(rename = "iceCandidate")]
    IceCandidate {
        candidate: IceCandidateInit,
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },
    #[serde(rename = "playerCount")]
    PlayerCount { count: u32 },
    #[serde(rename = "playerConnected")]
    PlayerConnected {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        #[serde(rename = "dataChannel", default)]
        data_channel: bool,
    },
    #[serde(rename = "playerDisconnected")]
    PlayerDisconnected {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        time: i64,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        time: i64,
    },
}

/// Messages sent to the signalling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "endpointId")]
    EndpointId { id: String },
    #[serde(rename = "offer")]
    Offer {
        sdp: String,
        #[serde(rename = "playerId")]
        player_id: WirePlayerId,
    },
    #[serde(rename = "answer")]
    Answer {
        sdp: String,
        #[serde(rename = "playerId")]
        player_id: WirePlayerId,
    },
    #[serde(rename = "iceCandidate")]
    IceCandidate {
        candidate: IceCandidateInit,
        #[serde(rename = "playerId")]
        player_id: WirePlayerId,
    },
    #[serde(rename = "disconnectPlayer")]
    DisconnectPlayer {
        #[serde(rename = "playerId")]
        player_id: WirePlayerId,
        reason: String,
    },
    #[serde(rename = "ping")]
    Ping { time: i64 },
    #[serde(rename = "pong")]
    Pong { time: i64 },
}

impl OutgoingMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Outcome of parsing one text frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Message(IncomingMessage),
    /// Malformed message about one player; that player gets disconnected
    PlayerError { player_id: PlayerId, reason: String },
    /// Malformed message about the streamer; the socket is closed
    ProtocolError(String),
    /// Well-formed but not for us
    Ignored(String),
}

const PLAYER_SCOPED: &[&str] = &[
    "offer",
    "answer",
    "iceCandidate",
    "playerConnected",
    "playerDisconnected",
];

const STREAMER_SCOPED: &[&str] = &["identify", "config", "playerCount", "ping", "pong"];

/// Parse one signalling text frame and classify failures by scope
pub fn parse_message(text: &str) -> ParseOutcome {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return ParseOutcome::ProtocolError(format!("invalid JSON: {}", e)),
    };
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return ParseOutcome::ProtocolError("message has no type".to_string());
    };

    let player_scoped = PLAYER_SCOPED.contains(&kind.as_str());
    if !player_scoped && !STREAMER_SCOPED.contains(&kind.as_str()) {
        return ParseOutcome::Ignored(kind);
    }

    let player_id = value
        .get("playerId")
        .and_then(|v| PlayerId::deserialize(v).ok());

    match serde_json::from_value::<IncomingMessage>(value) {
        Ok(message) => ParseOutcome::Message(message),
        Err(e) => {
            let reason = format!("failed to parse '{}' message: {}", kind, e);
            match (player_scoped, player_id) {
                (true, Some(player_id)) => ParseOutcome::PlayerError { player_id, reason },
                _ => ParseOutcome::ProtocolError(reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_format_is_transparent() {
        let as_int = r#"{"type":"offer","sdp":"v=0","playerId":42}"#;
        let as_str = r#"{"type":"offer","sdp":"v=0","playerId":"42"}"#;

        let a = parse_message(as_int);
        let b = parse_message(as_str);
        assert_eq!(a, b);
        match a {
            ParseOutcome::Message(IncomingMessage::Offer { player_id, sdp }) => {
                assert_eq!(player_id, PlayerId::from("42"));
                assert_eq!(sdp, "v=0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outgoing_player_id_follows_format() {
        let id = PlayerId::from(42u64);
        let msg = OutgoingMessage::Answer {
            sdp: "v=0".to_string(),
            player_id: id.to_wire(PlayerIdFormat::Integer),
        };
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["playerId"], 42);

        let msg = OutgoingMessage::Answer {
            sdp: "v=0".to_string(),
            player_id: id.to_wire(PlayerIdFormat::String),
        };
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["playerId"], "42");

        // Parses back to the same player either way
        let reparsed = parse_message(&msg.to_json().unwrap());
        assert!(matches!(
            reparsed,
            ParseOutcome::Message(IncomingMessage::Answer { player_id, .. }) if player_id == id
        ));
    }

    #[test]
    fn test_non_numeric_id_stays_string() {
        let id = PlayerId::from("browser-7");
        assert_eq!(
            id.to_wire(PlayerIdFormat::Integer),
            WirePlayerId::Str("browser-7".to_string())
        );
    }

    #[test]
    fn test_config_ice_servers() {
        let text = r#"{
            "type": "config",
            "peerConnectionOptions": {
                "iceServers": [
                    { "urls": "stun:stun.l.google.com:19302" },
                    { "urls": ["turn:a:3478", "turn:b:3478"], "username": "u", "credential": "c" }
                ]
            }
        }"#;
        match parse_message(text) {
            ParseOutcome::Message(IncomingMessage::Config {
                peer_connection_options,
            }) => {
                let servers = peer_connection_options.ice_servers;
                assert_eq!(servers.len(), 2);
                assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
                assert_eq!(servers[1].urls.len(), 2);
                assert_eq!(servers[1].username.as_deref(), Some("u"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ice_candidate_fields() {
        let text = r#"{"type":"iceCandidate","playerId":3,
            "candidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host"}}"#;
        match parse_message(text) {
            ParseOutcome::Message(IncomingMessage::IceCandidate { candidate, player_id }) => {
                assert_eq!(player_id.as_str(), "3");
                assert_eq!(candidate.sdp_mid, "0");
                assert_eq!(candidate.sdp_mline_index, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_player_scoped_error_names_the_player() {
        match parse_message(r#"{"type":"offer","playerId":7}"#) {
            ParseOutcome::PlayerError { player_id, reason } => {
                assert_eq!(player_id, PlayerId::from("7"));
                assert!(reason.contains("sdp"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_streamer_scoped_errors_are_fatal() {
        assert!(matches!(parse_message("{{"), ParseOutcome::ProtocolError(_)));
        assert!(matches!(
            parse_message(r#"{"sdp":"x"}"#),
            ParseOutcome::ProtocolError(_)
        ));
        assert!(matches!(
            parse_message(r#"{"type":"playerCount","count":"many"}"#),
            ParseOutcome::ProtocolError(_)
        ));
        // Player-scoped but no usable player id
        assert!(matches!(
            parse_message(r#"{"type":"offer","sdp":"v=0"}"#),
            ParseOutcome::ProtocolError(_)
        ));
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        assert_eq!(
            parse_message(r#"{"type":"streamerList","ids":[]}"#),
            ParseOutcome::Ignored("streamerList".to_string())
        );
        assert_eq!(
            parse_message(r#"{"type":"identify"}"#),
            ParseOutcome::Message(IncomingMessage::Identify)
        );
    }

    #[test]
    fn test_keepalive_messages() {
        let ping = OutgoingMessage::Ping { time: 1_700_000_000 };
        assert_eq!(ping.to_json().unwrap(), r#"{"type":"ping","time":1700000000}"#);
        assert_eq!(
            parse_message(r#"{"type":"pong","time":5}"#),
            ParseOutcome::Message(IncomingMessage::Pong { time: 5 })
        );
        let endpoint = OutgoingMessage::EndpointId { id: "s1".into() };
        assert_eq!(endpoint.to_json().unwrap(), r#"{"type":"endpointId","id":"s1"}"#);
    }
}
