use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    common::types::{GuildId, UserId},
    configs::PlayerConfig,
    gateway::{crypto::CipherMode, udp_link::PacketSink},
};

#[derive(Serialize, Deserialize, Debug)]
pub struct VoiceGatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

pub mod op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_DISCONNECT: u8 = 13;
}

/// Credentials of one voice-server assignment.
#[derive(Clone, PartialEq, Eq)]
pub struct VoiceRequest {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl std::fmt::Debug for VoiceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceRequest")
            .field("guild_id", &self.guild_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Gateway tunables taken from the player config.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub version: u8,
    pub cipher_modes: Vec<CipherMode>,
    pub discovery_timeout: Duration,
    pub timestamp_modulus: u64,
}

impl From<&PlayerConfig> for GatewaySettings {
    fn from(config: &PlayerConfig) -> Self {
        Self {
            version: config.gateway_version,
            cipher_modes: config.cipher_modes.clone(),
            discovery_timeout: Duration::from_millis(config.discovery_timeout_ms),
            timestamp_modulus: config.timestamp_modulus,
        }
    }
}

/// What the outer loop does after a connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and send Resume.
    Resume,
    /// Reconnect and send a fresh Identify.
    Identify,
    /// Give up.
    Terminal,
}

/// Close code policy of the voice gateway.
pub fn classify_close(code: u16) -> CloseAction {
    match code {
        1001 | 1006 | 4000 | 4009 | 4015 => CloseAction::Resume,
        4006 => CloseAction::Identify,
        _ => CloseAction::Terminal,
    }
}

/// Outcome of a single WS connection.
pub(crate) enum SessionOutcome {
    Close {
        code: u16,
        reason: String,
        by_remote: bool,
        action: CloseAction,
    },
    /// Cancelled by the owner.
    Shutdown,
}

/// Notifications sent upward to the player.
pub enum GatewayEvent {
    Connecting { resume: bool },
    /// IP discovery finished and the protocol was selected.
    Ready { ssrc: u32, mode: CipherMode },
    /// A session description arrived; frames may be sent through `transport`.
    SessionReady { transport: Box<dyn PacketSink> },
    /// The server accepted a resume; the current transport stays valid.
    Resumed,
    SpeakingStarted {
        user_id: Option<UserId>,
        ssrc: u32,
        stream: flume::Receiver<Vec<u8>>,
    },
    /// The user left the channel; their inbound streams are closed.
    SpeakerLeft { user_id: UserId },
    Closed {
        code: u16,
        reason: String,
        by_remote: bool,
        action: CloseAction,
    },
    /// The session ended for good.
    Disconnected { code: u16, reason: String },
}

impl std::fmt::Debug for GatewayEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting { resume } => write!(f, "Connecting {{ resume: {resume} }}"),
            Self::Ready { ssrc, mode } => write!(f, "Ready {{ ssrc: {ssrc}, mode: {mode} }}"),
            Self::SessionReady { .. } => f.write_str("SessionReady"),
            Self::Resumed => f.write_str("Resumed"),
            Self::SpeakingStarted { user_id, ssrc, .. } => {
                write!(f, "SpeakingStarted {{ user_id: {user_id:?}, ssrc: {ssrc} }}")
            }
            Self::SpeakerLeft { user_id } => write!(f, "SpeakerLeft {{ user_id: {user_id:?} }}"),
            Self::Closed {
                code,
                reason,
                by_remote,
                action,
            } => write!(
                f,
                "Closed {{ code: {code}, reason: {reason:?}, by_remote: {by_remote}, action: {action:?} }}"
            ),
            Self::Disconnected { code, reason } => {
                write!(f, "Disconnected {{ code: {code}, reason: {reason:?} }}")
            }
        }
    }
}

/// Commands from the player to its voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCommand {
    Speaking(bool),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("voice gateway connection failed: {0}")]
    Connect(String),
    #[error("no supported encryption mode offered: {0:?}")]
    NoCipherMode(Vec<String>),
    #[error("IP discovery failed: {0}")]
    Discovery(String),
    #[error("invalid voice server address {0}")]
    Address(String),
    #[error("malformed ready payload: {0}")]
    Malformed(&'static str),
}

impl GatewayError {
    /// Close code reported upward for locally detected failures.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Connect(_) => 1006,
            Self::NoCipherMode(_) => 4016,
            Self::Discovery(_) | Self::Address(_) | Self::Malformed(_) => 4000,
        }
    }
}

pub fn gateway_url(endpoint: &str, version: u8) -> String {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        format!("wss://{}/?v={}", endpoint, version)
    }
}
