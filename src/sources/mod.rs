pub mod http;
pub mod local;
pub mod manager;
pub mod plugin;
pub mod youtube;

pub use manager::SourceManager;
pub use plugin::{BoxedSource, LoadOptions, SourcePlugin};
