pub mod constants;
pub mod crypto;
pub mod pacing;
pub mod session;
pub mod udp_link;

pub use crypto::{CipherMode, CryptoError, PacketCipher};
pub use pacing::{Clock, PacingControl, PacingEvent, PacingLoop, PacingParts, SharedSink, TokioClock};
pub use session::{
    CloseAction, GatewayConnector, GatewayEvent, GatewaySettings, VoiceConnector, VoiceRequest,
    VoiceSessionHandle,
};
pub use udp_link::{CipherContext, FrameCounters, PacketSink, UdpBackend};
