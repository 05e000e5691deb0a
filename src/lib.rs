pub mod audio;
pub mod common;
pub mod configs;
pub mod gateway;
pub mod monitoring;
pub mod player;
pub mod protocol;
pub mod server;
pub mod sources;
pub mod transport;
