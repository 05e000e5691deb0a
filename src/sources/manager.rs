use crate::{
    audio::StreamLocator,
    common::{
        Severity,
        types::{AnyResult, map_boxed_err},
    },
    configs::Config,
    protocol::tracks::{LoadResult, TrackInfo},
    sources::{
        http::HttpSource,
        local::LocalSource,
        plugin::{BoxedSource, LoadOptions, SourcePlugin},
        youtube::YouTubeSource,
    },
};

/// Ordered set of providers. The first one whose `can_handle` matches a query
/// serves it alone.
pub struct SourceManager {
    sources: Vec<BoxedSource>,
}

impl SourceManager {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        let mut sources: Vec<BoxedSource> = Vec::new();

        macro_rules! register_source {
            ($enabled:expr, $name:literal, $ctor:expr) => {
                if $enabled {
                    match $ctor {
                        Ok(src) => {
                            tracing::info!("Loaded source: {}", $name);
                            sources.push(Box::new(src));
                        }
                        Err(e) => {
                            tracing::error!("{} source failed to initialize: {}", $name, e);
                        }
                    }
                }
            };
        }

        // order is match priority
        register_source!(
            config.sources.local,
            "local",
            LocalSource::new(config.local.clone())
        );
        register_source!(
            config.sources.youtube,
            "youtube",
            YouTubeSource::new(config.youtube.clone(), http.clone())
        );
        register_source!(config.sources.http, "http", HttpSource::new(http.clone()));

        Self { sources }
    }

    pub fn with_sources(sources: Vec<BoxedSource>) -> Self {
        Self { sources }
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    fn by_name(&self, name: &str) -> Option<&dyn SourcePlugin> {
        self.sources
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    /// Load tracks using the forced source or the first matching one.
    pub async fn load(&self, query: &str, options: &LoadOptions) -> LoadResult {
        let source = match options.source_name.as_deref() {
            Some(name) => match self.by_name(name) {
                Some(source) => source,
                None => {
                    return LoadResult::error(
                        format!("Source '{}' not found", name),
                        Severity::Common,
                        "UnknownSource",
                    );
                }
            },
            None => match self.sources.iter().find(|s| s.can_handle(query)) {
                Some(source) => source.as_ref(),
                None => {
                    tracing::debug!("No source could handle identifier: {}", query);
                    return LoadResult::Empty {};
                }
            },
        };

        tracing::trace!("Loading '{}' with source: {}", query, source.name());
        source.load(query, options).await
    }

    /// Resolves where to read `track` from, using the provider that created it.
    pub async fn resolve(&self, track: &TrackInfo) -> AnyResult<StreamLocator> {
        let source = self.by_name(&track.source_name).ok_or_else(|| {
            map_boxed_err(format!("source '{}' is not enabled", track.source_name))
        })?;
        source.resolve_stream_locator(track).await
    }
}
