use serde::{Deserialize, Serialize};

/// Request body for `PATCH /v4/sessions/{sessionId}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(default)]
    pub resuming: Option<bool>,
    /// Resume window in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub resuming: bool,
    pub timeout: u64,
}

/// Query of `/v4/loadtracks`.
#[derive(Debug, Deserialize)]
pub struct LoadTracksQuery {
    pub identifier: Option<String>,
}

/// Query of `/v4/decodetrack`; `track` is accepted as an alias.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeTrackQuery {
    pub encoded_track: Option<String>,
    pub track: Option<String>,
}

/// Body of `POST /v4/decodetracks`: either a bare array or `{ "tracks": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EncodedTracks {
    List(Vec<String>),
    Wrapped { tracks: Vec<String> },
}

impl EncodedTracks {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::List(tracks) | Self::Wrapped { tracks } => tracks,
        }
    }
}

/// Inbound control-socket message.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Stats,
}
