use std::time::Duration;

/// Length of the RTP header prefixed to every voice packet.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP version 2, no padding, no extension, no CSRC.
pub const RTP_VERSION_BYTE: u8 = 0x80;

/// Dynamic payload type used for Opus.
pub const RTP_OPUS_PAYLOAD_TYPE: u8 = 0x78;

/// RTP header extension bit in the first header byte.
pub const RTP_EXTENSION_BIT: u8 = 0x10;

/// Duration of one Opus frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples per channel in one frame at 48 kHz; the RTP timestamp step.
pub const FRAME_SAMPLES: u32 = 960;

/// An Opus frame of silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Silence frames sent when transmission stops, so receivers do not interpolate.
pub const SILENCE_FRAMES_ON_STOP: usize = 5;

/// Size of an IP discovery request and response.
pub const DISCOVERY_PACKET_LEN: usize = 74;

/// Initial capacity of the outbound packet buffer.
pub const UDP_PACKET_BUF_CAPACITY: usize = 1500;

/// Inbound packets buffered per remote SSRC before new ones are dropped.
pub const INBOUND_STREAM_CAPACITY: usize = 64;

/// Timeout (ms) allowed for the WS write task to shut down gracefully.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;
