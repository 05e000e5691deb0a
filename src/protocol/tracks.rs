use std::io::{Cursor, Read};

use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::Severity;

/// Version tag written at the start of every encoded track.
pub const TRACK_FORMAT_VERSION: i32 = 2;

const FLAG_URI: i32 = 1 << 0;
const FLAG_ARTWORK: i32 = 1 << 1;
const FLAG_ISRC: i32 = 1 << 2;

/// Why an encoded track was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("encoded track is not valid base64")]
    Base64,
    #[error("encoded track ended while reading {field} at byte {offset}")]
    Truncated { field: &'static str, offset: u64 },
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("unsupported track format version {0}")]
    UnsupportedVersion(i32),
    #[error("decoded track is invalid: {0}")]
    Invalid(&'static str),
}

/// Metadata describing one playable item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds, 0 when unknown.
    pub length: u64,
    pub is_stream: bool,
    /// Playback position in milliseconds. Not part of the binary form.
    #[serde(default)]
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

impl TrackInfo {
    /// Serializes the descriptor to its base64 binary form.
    ///
    /// Layout, big-endian: `i32 version`, `i32 flags`, `utf identifier`,
    /// `utf author`, `i64 length`, `u8 is_stream`, `utf title`, `[utf uri]`,
    /// `utf source_name`, `[utf artwork_url]`, `[utf isrc]`. Returns `None`
    /// when a field cannot be represented (strings over 65535 bytes, lengths
    /// beyond `i64::MAX`).
    pub fn encode(&self) -> Option<String> {
        let mut flags = 0;
        if self.uri.is_some() {
            flags |= FLAG_URI;
        }
        if self.artwork_url.is_some() {
            flags |= FLAG_ARTWORK;
        }
        if self.isrc.is_some() {
            flags |= FLAG_ISRC;
        }

        let mut buf = Vec::with_capacity(256);
        buf.write_i32::<BigEndian>(TRACK_FORMAT_VERSION).ok()?;
        buf.write_i32::<BigEndian>(flags).ok()?;
        write_utf(&mut buf, &self.identifier)?;
        write_utf(&mut buf, &self.author)?;
        let length = i64::try_from(self.length).ok()?;
        buf.write_i64::<BigEndian>(length).ok()?;
        buf.write_u8(u8::from(self.is_stream)).ok()?;
        write_utf(&mut buf, &self.title)?;
        if let Some(uri) = &self.uri {
            write_utf(&mut buf, uri)?;
        }
        write_utf(&mut buf, &self.source_name)?;
        if let Some(artwork) = &self.artwork_url {
            write_utf(&mut buf, artwork)?;
        }
        if let Some(isrc) = &self.isrc {
            write_utf(&mut buf, isrc)?;
        }

        Some(BASE64_STANDARD.encode(buf))
    }

    /// Parses an encoded track. Every read is bounds-checked and the result is
    /// validated before it is returned.
    pub fn decode(encoded: &str) -> Result<Self, DecodeError> {
        let data = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|_| DecodeError::Base64)?;
        let mut cursor = Cursor::new(data.as_slice());

        let version = read_i32(&mut cursor, "version")?;
        if version != TRACK_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let flags = read_i32(&mut cursor, "flags")?;

        let identifier = read_utf(&mut cursor, "identifier")?;
        let author = read_utf(&mut cursor, "author")?;
        let length = cursor
            .read_i64::<BigEndian>()
            .map_err(|_| truncated(&cursor, "length"))?;
        let is_stream = cursor
            .read_u8()
            .map_err(|_| truncated(&cursor, "isStream"))?
            != 0;
        let title = read_utf(&mut cursor, "title")?;
        let uri = read_optional(&mut cursor, flags & FLAG_URI != 0, "uri")?;
        let source_name = read_utf(&mut cursor, "sourceName")?;
        let artwork_url = read_optional(&mut cursor, flags & FLAG_ARTWORK != 0, "artworkUrl")?;
        let isrc = read_optional(&mut cursor, flags & FLAG_ISRC != 0, "isrc")?;

        let length = u64::try_from(length).map_err(|_| DecodeError::Invalid("negative length"))?;

        let info = Self {
            identifier,
            is_seekable: !is_stream,
            author,
            length,
            is_stream,
            position: 0,
            title,
            uri,
            artwork_url,
            isrc,
            source_name,
        };
        info.validate()?;
        Ok(info)
    }

    /// Checks the invariants every decoded descriptor must satisfy.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.identifier.is_empty() {
            return Err(DecodeError::Invalid("empty identifier"));
        }
        if self.source_name.is_empty() {
            return Err(DecodeError::Invalid("empty source name"));
        }
        // the binary form only carries isStream, seekability is derived from it
        if self.is_seekable == self.is_stream {
            return Err(DecodeError::Invalid("isSeekable must be the inverse of isStream"));
        }
        Ok(())
    }
}

fn truncated(cursor: &Cursor<&[u8]>, field: &'static str) -> DecodeError {
    DecodeError::Truncated {
        field,
        offset: cursor.position(),
    }
}

fn read_i32(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<i32, DecodeError> {
    cursor
        .read_i32::<BigEndian>()
        .map_err(|_| truncated(cursor, field))
}

fn read_utf(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<String, DecodeError> {
    let len = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| truncated(cursor, field))? as usize;
    let remaining = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
    if len as u64 > remaining {
        return Err(truncated(cursor, field));
    }
    let mut bytes = vec![0u8; len];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| truncated(cursor, field))?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(field))
}

fn read_optional(
    cursor: &mut Cursor<&[u8]>,
    present: bool,
    field: &'static str,
) -> Result<Option<String>, DecodeError> {
    if present {
        read_utf(cursor, field).map(Some)
    } else {
        Ok(None)
    }
}

fn write_utf(buf: &mut Vec<u8>, value: &str) -> Option<()> {
    let len = u16::try_from(value.len()).ok()?;
    buf.write_u16::<BigEndian>(len).ok()?;
    buf.extend_from_slice(value.as_bytes());
    Some(())
}

/// Cheap shape check used before attempting a full decode.
pub fn is_encoded(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

/// A track descriptor together with its canonical encoded form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default = "empty_object")]
    pub plugin_info: serde_json::Value,
    #[serde(default = "empty_object")]
    pub user_data: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl Track {
    /// Pairs `info` with its encoding, or `None` when it cannot be encoded.
    /// Returns `None` when the descriptor cannot be encoded or would not
    /// decode back to itself.
    pub fn new(info: TrackInfo) -> Option<Self> {
        info.validate().ok()?;
        let encoded = info.encode()?;
        Some(Self {
            encoded,
            info,
            plugin_info: empty_object(),
            user_data: empty_object(),
        })
    }

    pub fn decode(encoded: &str) -> Result<Self, DecodeError> {
        let info = TrackInfo::decode(encoded)?;
        Ok(Self {
            encoded: encoded.trim().to_string(),
            info,
            plugin_info: empty_object(),
            user_data: empty_object(),
        })
    }
}

/// Outcome of resolving a query.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    Track(Track),
    Playlist(PlaylistData),
    Search(Vec<Track>),
    Empty {},
    Error(LoadError),
}

impl LoadResult {
    pub fn error(message: impl Into<String>, severity: Severity, cause: impl Into<String>) -> Self {
        Self::Error(LoadError {
            message: Some(message.into()),
            severity,
            cause: cause.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    pub plugin_info: serde_json::Value,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the selected track, -1 when none is selected.
    pub selected_track: i32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadError {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
}
