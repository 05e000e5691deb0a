//! Fixed parameters of the transcoder output.

/// Output sample rate (Hz).
pub const TARGET_SAMPLE_RATE: u32 = 48_000;

pub const CHANNELS: usize = 2;

/// Samples per channel in one 20 ms frame.
pub const FRAME_SAMPLES_PER_CHANNEL: usize = 960;

/// Interleaved samples in one 20 ms stereo frame.
pub const FRAME_SIZE_SAMPLES: usize = FRAME_SAMPLES_PER_CHANNEL * CHANNELS;

/// Bytes of s16le PCM in one frame.
pub const PCM_FRAME_BYTES: usize = FRAME_SIZE_SAMPLES * 2;

/// Upper bound of one encoded Opus packet.
pub const MAX_OPUS_PACKET: usize = 4_000;

pub const MAX_VOLUME: u8 = 100;
