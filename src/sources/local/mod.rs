use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use symphonia::core::{
    codecs::CODEC_TYPE_NULL,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::{MetadataOptions, StandardTagKey, Tag},
    probe::Hint,
};
use tracing::{debug, error, warn};

use crate::{
    audio::StreamLocator,
    common::{Severity, types::AnyResult},
    configs::LocalConfig,
    protocol::tracks::{LoadResult, PlaylistData, PlaylistInfo, Track, TrackInfo},
    sources::plugin::{LoadOptions, SourcePlugin},
};

const ISRC_PATTERN: &str = r"(?i)([A-Z]{2}[A-Z0-9]{3}\d{2}\d{5})";

pub struct LocalSource {
    base_path: PathBuf,
    extensions: Vec<String>,
    isrc_regex: Regex,
}

/// Tags and duration read from a file header.
#[derive(Debug, Default)]
struct ProbedMetadata {
    title: Option<String>,
    artist: Option<String>,
    isrc: Option<String>,
    length_ms: u64,
}

impl LocalSource {
    pub fn new(config: LocalConfig) -> AnyResult<Self> {
        let extensions = config
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Ok(Self {
            base_path: PathBuf::from(config.base_path),
            extensions,
            isrc_regex: Regex::new(ISRC_PATTERN)?,
        })
    }

    fn strip_prefix(query: &str) -> &str {
        query
            .strip_prefix("local:")
            .or_else(|| query.strip_prefix("file://"))
            .unwrap_or(query)
    }

    fn has_allowed_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|a| a.eq_ignore_ascii_case(e)))
    }

    fn resolve_path(&self, query: &str) -> PathBuf {
        let joined = self.base_path.join(Self::strip_prefix(query));
        std::fs::canonicalize(&joined).unwrap_or(joined)
    }

    fn probe_file(path: &Path) -> AnyResult<ProbedMetadata> {
        let file = std::fs::File::open(path)?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        // container-level tags win over tags found before the container (ID3)
        let mut tags: Vec<Tag> = Vec::new();
        if let Some(meta) = probed.metadata.get() {
            if let Some(revision) = meta.current() {
                tags.extend_from_slice(revision.tags());
            }
        }
        let mut format = probed.format;
        if let Some(revision) = format.metadata().current() {
            tags.extend_from_slice(revision.tags());
        }

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or("no audio track found")?;

        let length_ms = match (track.codec_params.n_frames, track.codec_params.sample_rate) {
            (Some(frames), Some(rate)) if rate > 0 => (frames as f64 / rate as f64 * 1000.0) as u64,
            _ => 0,
        };

        let mut meta = ProbedMetadata {
            length_ms,
            ..Default::default()
        };
        for tag in tags {
            let value = tag.value.to_string();
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) => meta.title = Some(value),
                Some(StandardTagKey::Artist) => meta.artist = Some(value),
                Some(StandardTagKey::AlbumArtist) if meta.artist.is_none() => {
                    meta.artist = Some(value)
                }
                Some(StandardTagKey::IdentIsrc) => meta.isrc = Some(value.to_uppercase()),
                _ => {}
            }
        }
        Ok(meta)
    }

    fn build_track(&self, path: &Path) -> Option<Track> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Unknown")
            .to_string();

        let meta = Self::probe_file(path).unwrap_or_else(|e| {
            warn!("Failed to parse audio metadata for {}: {}", path.display(), e);
            ProbedMetadata::default()
        });

        let isrc = meta.isrc.or_else(|| {
            self.isrc_regex
                .captures(&stem)
                .map(|c| c[1].to_uppercase())
        });
        let identifier = path.to_string_lossy().into_owned();

        Track::new(TrackInfo {
            uri: Some(format!("file://{}", identifier)),
            identifier,
            is_seekable: true,
            author: meta
                .artist
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "Local File".to_string()),
            length: meta.length_ms,
            is_stream: false,
            position: 0,
            title: meta.title.filter(|t| !t.is_empty()).unwrap_or(stem),
            artwork_url: None,
            isrc,
            source_name: "local".to_string(),
        })
    }

    fn load_directory(&self, dir: &Path, limit: Option<usize>) -> LoadResult {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                return LoadResult::error(
                    format!("Failed to read directory: {}", e),
                    Severity::Common,
                    e.to_string(),
                );
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.has_allowed_extension(path))
            .collect();
        files.sort();
        if let Some(limit) = limit {
            files.truncate(limit);
        }

        if files.is_empty() {
            return LoadResult::Empty {};
        }

        let tracks: Vec<Track> = files.iter().filter_map(|f| self.build_track(f)).collect();
        LoadResult::Playlist(PlaylistData {
            info: PlaylistInfo {
                name: dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string(),
                selected_track: 0,
            },
            plugin_info: serde_json::json!({}),
            tracks,
        })
    }

    fn load_blocking(&self, query: &str, limit: Option<usize>) -> LoadResult {
        let path = self.resolve_path(query);
        debug!("Local source probing: {}", path.display());

        let Ok(stat) = std::fs::metadata(&path) else {
            return LoadResult::error(
                format!("File not found: {}", query),
                Severity::Common,
                "NotFound",
            );
        };

        if stat.is_dir() {
            return self.load_directory(&path, limit);
        }
        if !self.has_allowed_extension(&path) {
            return LoadResult::error(
                format!("Unsupported file type: {}", query),
                Severity::Common,
                "UnsupportedFileType",
            );
        }

        match self.build_track(&path) {
            Some(track) => LoadResult::Track(track),
            None => LoadResult::error(
                "Failed to encode local track",
                Severity::Fault,
                "EncodeFailed",
            ),
        }
    }
}

#[async_trait]
impl SourcePlugin for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    fn can_handle(&self, query: &str) -> bool {
        if query.starts_with("local:") || query.starts_with("file://") {
            return true;
        }
        !query.contains("://") && self.has_allowed_extension(Path::new(query))
    }

    async fn load(&self, query: &str, options: &LoadOptions) -> LoadResult {
        let source = Self {
            base_path: self.base_path.clone(),
            extensions: self.extensions.clone(),
            isrc_regex: self.isrc_regex.clone(),
        };
        let query = query.to_string();
        let limit = options.limit;

        match tokio::task::spawn_blocking(move || source.load_blocking(&query, limit)).await {
            Ok(result) => result,
            Err(e) => {
                error!("Local source: task join error: {}", e);
                LoadResult::error(
                    "Internal error reading local file",
                    Severity::Fault,
                    e.to_string(),
                )
            }
        }
    }

    async fn resolve_stream_locator(&self, track: &TrackInfo) -> AnyResult<StreamLocator> {
        let path = PathBuf::from(Self::strip_prefix(&track.identifier));
        if !path.is_file() {
            return Err(format!("local file {} no longer exists", path.display()).into());
        }
        Ok(StreamLocator::File(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "renode-local-{}-{}",
                name,
                crate::common::types::SessionId::generate()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        fn file(&self, name: &str) -> PathBuf {
            let path = self.0.join(name);
            std::fs::write(&path, b"not really audio").unwrap();
            path
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn source(base: &Path) -> LocalSource {
        LocalSource::new(LocalConfig {
            base_path: base.to_string_lossy().into_owned(),
            extensions: vec!["mp3".into(), ".flac".into()],
        })
        .unwrap()
    }

    #[test]
    fn handles_prefixes_and_extensions() {
        let source = source(Path::new("."));
        assert!(source.can_handle("local:anything"));
        assert!(source.can_handle("file:///music/a.wav"));
        assert!(source.can_handle("songs/A.MP3"));
        assert!(source.can_handle("x.flac"));
        assert!(!source.can_handle("https://cdn.example/a.mp3"));
        assert!(!source.can_handle("never gonna give you up"));
    }

    #[tokio::test]
    async fn file_falls_back_to_name_metadata() {
        let dir = TempDir::new("file");
        dir.file("USRC17607839 - Song.mp3");
        let source = source(&dir.0);

        let LoadResult::Track(track) = source
            .load("USRC17607839 - Song.mp3", &LoadOptions::default())
            .await
        else {
            panic!("expected a track");
        };
        assert_eq!(track.info.title, "USRC17607839 - Song");
        assert_eq!(track.info.author, "Local File");
        assert_eq!(track.info.isrc.as_deref(), Some("USRC17607839"));
        assert!(track.info.is_seekable);
        assert!(!track.info.is_stream);
        assert_eq!(track.info.source_name, "local");
        assert!(track.info.uri.as_deref().unwrap().starts_with("file://"));
        assert_eq!(TrackInfo::decode(&track.encoded).unwrap(), track.info);

        let locator = source.resolve_stream_locator(&track.info).await.unwrap();
        assert_eq!(locator, StreamLocator::File(PathBuf::from(&track.info.identifier)));
    }

    #[tokio::test]
    async fn directories_become_sorted_playlists() {
        let dir = TempDir::new("dir");
        dir.file("b.flac");
        dir.file("a.mp3");
        dir.file("notes.txt");
        let source = source(dir.0.parent().unwrap());
        let name = dir.0.file_name().unwrap().to_str().unwrap().to_string();

        let LoadResult::Playlist(playlist) = source
            .load(&format!("local:{name}"), &LoadOptions::default())
            .await
        else {
            panic!("expected a playlist");
        };
        assert_eq!(playlist.info.name, name);
        assert_eq!(playlist.info.selected_track, 0);
        let titles: Vec<_> = playlist.tracks.iter().map(|t| t.info.title.as_str()).collect();
        assert_eq!(titles, ["a", "b"]);

        let limited = source
            .load(
                &format!("local:{name}"),
                &LoadOptions {
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(limited, LoadResult::Playlist(p) if p.tracks.len() == 1));
    }

    #[tokio::test]
    async fn empty_missing_and_unsupported() {
        let dir = TempDir::new("empty");
        dir.file("readme.txt");
        let source = source(&dir.0);

        assert!(matches!(
            source.load("local:.", &LoadOptions::default()).await,
            LoadResult::Empty {}
        ));
        assert!(matches!(
            source.load("missing.mp3", &LoadOptions::default()).await,
            LoadResult::Error(_)
        ));
        assert!(matches!(
            source.load("local:readme.txt", &LoadOptions::default()).await,
            LoadResult::Error(e) if e.cause == "UnsupportedFileType"
        ));
    }
}
