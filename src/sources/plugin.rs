use async_trait::async_trait;

use crate::{
    audio::StreamLocator,
    common::types::AnyResult,
    protocol::tracks::{LoadResult, TrackInfo},
};

/// Per-request options of a track lookup.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Forces a provider by name instead of matching the query.
    pub source_name: Option<String>,
    /// Caps the number of returned tracks for searches and playlists.
    pub limit: Option<usize>,
}

/// Trait that all source plugins must implement.
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Unique identifier for this source, also stored as `sourceName` in tracks.
    fn name(&self) -> &str;

    /// Check if this source can handle the given query.
    fn can_handle(&self, query: &str) -> bool;

    /// Resolve the query into track(s).
    async fn load(&self, query: &str, options: &LoadOptions) -> LoadResult;

    /// Where the transcoder should read `track` from.
    async fn resolve_stream_locator(&self, track: &TrackInfo) -> AnyResult<StreamLocator>;
}

pub type BoxedSource = Box<dyn SourcePlugin>;
