use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlayerError {
    #[error("the current track is not seekable")]
    NotSeekable,
    #[error("failed to resolve the audio stream: {0}")]
    Resolve(String),
    #[error("{0}")]
    Pipeline(String),
    #[error("no audio within {0} ms")]
    Timeout(u64),
    #[error("superseded by a newer request")]
    Cancelled,
    #[error("player has been destroyed")]
    Gone,
}
