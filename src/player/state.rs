use serde::{Deserialize, Serialize};

use crate::{common::types::GuildId, protocol::tracks::Track};

/// `null` clears the track, a string sets it, an absent field keeps it.
pub fn deserialize_track_encoded<'de, D>(deserializer: D) -> Result<Option<TrackEncoded>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: serde_json::Value = serde::Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(Some(TrackEncoded::Clear)),
        serde_json::Value::String(s) => Ok(Some(TrackEncoded::Set(s))),
        _ => Err(serde::de::Error::custom("expected string or null")),
    }
}

/// Full player state as returned by REST endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub guild_id: GuildId,
    pub track: Option<Track>,
    pub volume: u8,
    pub paused: bool,
    pub state: PlayerState,
    pub voice: VoiceState,
    /// Always empty; audio filters are not supported.
    pub filters: serde_json::Value,
}

impl Player {
    /// View of a guild that has no player yet.
    pub fn idle(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            track: None,
            volume: 100,
            paused: false,
            state: PlayerState {
                time: crate::common::types::now_ms(),
                position: 0,
                connected: false,
                ping: -1,
            },
            voice: VoiceState::default(),
            filters: serde_json::json!({}),
        }
    }
}

/// Position and connection summary, also pushed as `playerUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Unix timestamp in milliseconds.
    pub time: u64,
    /// Playback position in milliseconds.
    pub position: u64,
    /// Whether the voice session is connected.
    pub connected: bool,
    /// Voice gateway ping in milliseconds. -1 if not connected.
    pub ping: i64,
}

/// Voice credentials forwarded by the client.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl std::fmt::Debug for VoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceState")
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("session_id", &self.session_id)
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

impl VoiceState {
    pub fn is_complete(&self) -> bool {
        !self.token.is_empty() && !self.endpoint.is_empty() && !self.session_id.is_empty()
    }
}

/// Request body for PATCH /v4/sessions/{sessionId}/players/{guildId}.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(default, deserialize_with = "deserialize_track_encoded")]
    pub encoded_track: Option<TrackEncoded>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub track: Option<PlayerUpdateTrack>,
    #[serde(default)]
    pub position: Option<u64>,
    #[serde(default)]
    pub volume: Option<i32>,
    #[serde(default)]
    pub paused: Option<bool>,
    #[serde(default)]
    pub voice: Option<VoiceState>,
}

impl PlayerUpdate {
    /// The track instruction, preferring the nested `track` object.
    pub fn track_request(&self) -> Option<TrackRequest> {
        let nested = self.track.as_ref();
        let encoded = nested
            .and_then(|t| t.encoded.clone())
            .or_else(|| self.encoded_track.clone());
        match encoded {
            Some(TrackEncoded::Clear) => return Some(TrackRequest::Stop),
            Some(TrackEncoded::Set(encoded)) => return Some(TrackRequest::Encoded(encoded)),
            None => {}
        }
        nested
            .and_then(|t| t.identifier.clone())
            .or_else(|| self.identifier.clone())
            .map(TrackRequest::Identifier)
    }
}

/// Track field in a player update request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateTrack {
    /// Base64-encoded track. Null to stop. Omit to keep current.
    #[serde(default, deserialize_with = "deserialize_track_encoded")]
    pub encoded: Option<TrackEncoded>,
    /// Track identifier to resolve. Mutually exclusive with `encoded`.
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub user_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TrackEncoded {
    Clear,
    Set(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackRequest {
    Stop,
    Encoded(String),
    Identifier(String),
}
