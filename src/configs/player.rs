use serde::{Deserialize, Serialize};

use crate::gateway::CipherMode;

/// Opus encoder presets selectable from the config file.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

/// Encoder settings fixed when a pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderPreset {
    pub bitrate: i32,
    /// In-band forward error correction.
    pub fec: bool,
    /// Expected packet loss, in percent, used for loss concealment tuning.
    pub packet_loss_percent: u8,
}

impl Quality {
    pub fn preset(self) -> EncoderPreset {
        match self {
            Self::Low => EncoderPreset {
                bitrate: 64_000,
                fec: true,
                packet_loss_percent: 15,
            },
            Self::Medium => EncoderPreset {
                bitrate: 96_000,
                fec: true,
                packet_loss_percent: 10,
            },
            Self::High => EncoderPreset {
                bitrate: 128_000,
                fec: true,
                packet_loss_percent: 5,
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlayerConfig {
    #[serde(default)]
    pub quality: Quality,
    /// Cipher modes in order of preference; the first one offered by the voice server wins.
    #[serde(default = "default_cipher_modes")]
    pub cipher_modes: Vec<CipherMode>,
    /// Keep sequence/timestamp counters running across a seek instead of restarting them.
    #[serde(default = "default_true")]
    pub seek_timestamp_continuity: bool,
    #[serde(default = "default_seek_timeout_ms")]
    pub seek_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// RTP timestamps wrap at this value.
    #[serde(default = "default_timestamp_modulus")]
    pub timestamp_modulus: u64,
    #[serde(default = "default_gateway_version")]
    pub gateway_version: u8,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Encoded frames buffered between the transcoder and the pacing loop.
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            cipher_modes: default_cipher_modes(),
            seek_timestamp_continuity: true,
            seek_timeout_ms: default_seek_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            timestamp_modulus: default_timestamp_modulus(),
            gateway_version: default_gateway_version(),
            ffmpeg_path: default_ffmpeg_path(),
            frame_buffer: default_frame_buffer(),
        }
    }
}

fn default_cipher_modes() -> Vec<CipherMode> {
    vec![CipherMode::Lite, CipherMode::Suffix, CipherMode::Normal]
}

fn default_true() -> bool {
    true
}

fn default_seek_timeout_ms() -> u64 {
    10_000
}

fn default_discovery_timeout_ms() -> u64 {
    5_000
}

fn default_timestamp_modulus() -> u64 {
    1 << 32
}

fn default_gateway_version() -> u8 {
    8
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_frame_buffer() -> usize {
    50
}
