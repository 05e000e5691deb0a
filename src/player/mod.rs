mod actor;
pub mod context;
pub mod error;
pub mod handle;
pub mod state;
pub mod status;

pub use context::{PlayOptions, PlayerDeps, PlayerEvent, PlayerSnapshot, SpeakerStream};
pub use error::PlayerError;
pub use handle::PlayerHandle;
pub use state::*;
pub use status::{ConnectionStatus, PlaybackReason, PlaybackStatus};
