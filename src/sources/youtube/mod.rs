pub mod api;
pub mod resolver;

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    audio::StreamLocator,
    common::{Severity, types::AnyResult},
    configs::YouTubeConfig,
    protocol::tracks::{LoadResult, PlaylistData, PlaylistInfo, Track, TrackInfo},
    sources::{
        http::is_hls,
        plugin::{LoadOptions, SourcePlugin},
    },
};

use api::{ApiErrorBody, ListResponse, Playlist, PlaylistItem, SearchResult, Video};

const SEARCH_PREFIX: &str = "ytsearch:";
const MAX_PAGE_SIZE: usize = 50;
const API_TIMEOUT: Duration = Duration::from_secs(10);
const VIDEO_PARTS: &str = "snippet,contentDetails,liveStreamingDetails";

pub struct YouTubeSource {
    config: YouTubeConfig,
    client: Client,
    video_regex: Regex,
    playlist_regex: Regex,
    isrc_regex: Regex,
}

impl YouTubeSource {
    pub fn new(config: YouTubeConfig, client: Client) -> AnyResult<Self> {
        if config.api_key.is_empty() {
            warn!("YouTube API key is not set, lookups will fail until one is configured");
        }
        Ok(Self {
            config,
            client,
            video_regex: Regex::new(
                r"(?i)^(?:https?://)?(?:www\.|m\.|music\.)?(?:youtube\.com/(?:watch\?(?:.*&)?v=|shorts/|live/|embed/)|youtu\.be/)([A-Za-z0-9_-]{11})",
            )?,
            playlist_regex: Regex::new(
                r"(?i)^(?:https?://)?(?:www\.|m\.|music\.)?(?:youtube\.com|youtu\.be)/.*[?&]list=([A-Za-z0-9_-]+)",
            )?,
            isrc_regex: Regex::new(r"(?i)([A-Z]{2}[A-Z0-9]{3}\d{2}\d{5})")?,
        })
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, params: &[(&str, &str)]) -> AnyResult<T> {
        let url = format!("{}/{}", self.config.api_endpoint.trim_end_matches('/'), endpoint);
        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&[("key", self.config.api_key.as_str())])
            .timeout(API_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| format!("{} ({})", b.error.message, b.error.code))
                .unwrap_or_else(|_| status.to_string());
            return Err(format!("YouTube API {} failed: {}", endpoint, message).into());
        }
        Ok(response.json::<T>().await?)
    }

    /// Full video resources for `ids`, in the order the ids were given.
    async fn videos(&self, ids: &[String]) -> AnyResult<Vec<Video>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids.join(",");
        let list: ListResponse<Video> = self
            .get("videos", &[("part", VIDEO_PARTS), ("id", &joined)])
            .await?;

        let mut videos = list.items;
        videos.sort_by_key(|v| ids.iter().position(|id| *id == v.id).unwrap_or(usize::MAX));
        Ok(videos)
    }

    fn tracks(&self, videos: &[Video]) -> Vec<Track> {
        videos.iter().filter_map(|v| self.build_track(v)).collect()
    }

    fn build_track(&self, video: &Video) -> Option<Track> {
        let length = video
            .content_details
            .duration
            .as_deref()
            .map(parse_iso8601_duration)
            .unwrap_or(0);
        let is_live = video.snippet.live_broadcast_content.as_deref() == Some("live")
            || video
                .live_streaming_details
                .as_ref()
                .is_some_and(|d| d.is_live_now());

        // without a known duration there is nothing to seek within
        let is_stream = is_live || length == 0;

        let isrc = video
            .snippet
            .tags
            .iter()
            .chain(std::iter::once(&video.snippet.description))
            .find_map(|text| self.isrc_regex.captures(text))
            .map(|c| c[1].to_uppercase());

        let title = if video.snippet.title.is_empty() {
            "Unknown Title".to_string()
        } else {
            video.snippet.title.clone()
        };
        let author = if video.snippet.channel_title.is_empty() {
            "Unknown Artist".to_string()
        } else {
            video.snippet.channel_title.clone()
        };

        Track::new(TrackInfo {
            identifier: video.id.clone(),
            is_seekable: !is_stream,
            author,
            length,
            is_stream,
            position: 0,
            title,
            uri: Some(watch_url(&video.id)),
            artwork_url: video.snippet.thumbnails.best().map(str::to_string),
            isrc,
            source_name: "youtube".to_string(),
        })
    }

    async fn load_video(&self, id: &str) -> AnyResult<LoadResult> {
        let videos = self.videos(&[id.to_string()]).await?;
        Ok(match videos.first().and_then(|v| self.build_track(v)) {
            Some(track) => LoadResult::Track(track),
            None => LoadResult::Empty {},
        })
    }

    async fn load_playlist(
        &self,
        playlist_id: &str,
        selected: Option<&str>,
        limit: usize,
    ) -> AnyResult<LoadResult> {
        let playlists: ListResponse<Playlist> = self
            .get("playlists", &[("part", "snippet"), ("id", playlist_id)])
            .await?;
        let Some(playlist) = playlists.items.into_iter().next() else {
            return Ok(LoadResult::Empty {});
        };

        let max_results = limit.to_string();
        let items: ListResponse<PlaylistItem> = self
            .get(
                "playlistItems",
                &[
                    ("part", "contentDetails"),
                    ("maxResults", &max_results),
                    ("playlistId", playlist_id),
                ],
            )
            .await?;
        let ids: Vec<String> = items
            .items
            .into_iter()
            .filter_map(|item| item.content_details.video_id)
            .collect();

        let tracks = self.tracks(&self.videos(&ids).await?);
        if tracks.is_empty() {
            return Ok(LoadResult::Empty {});
        }

        let selected_track = selected
            .and_then(|id| tracks.iter().position(|t| t.info.identifier == id))
            .unwrap_or(0) as i32;
        Ok(LoadResult::Playlist(PlaylistData {
            info: PlaylistInfo {
                name: playlist.snippet.title,
                selected_track,
            },
            plugin_info: serde_json::json!({}),
            tracks,
        }))
    }

    async fn search(&self, query: &str, limit: usize) -> AnyResult<LoadResult> {
        let max_results = limit.to_string();
        let results: ListResponse<SearchResult> = self
            .get(
                "search",
                &[
                    ("part", "snippet"),
                    ("type", "video"),
                    ("maxResults", &max_results),
                    ("q", query),
                ],
            )
            .await?;
        let ids: Vec<String> = results
            .items
            .into_iter()
            .filter_map(|r| r.id.video_id)
            .collect();

        let tracks = self.tracks(&self.videos(&ids).await?);
        Ok(if tracks.is_empty() {
            LoadResult::Empty {}
        } else {
            LoadResult::Search(tracks)
        })
    }

    async fn load_inner(&self, query: &str, options: &LoadOptions) -> AnyResult<LoadResult> {
        let limit = |default: usize| options.limit.unwrap_or(default).clamp(1, MAX_PAGE_SIZE);
        let video_id = self.video_regex.captures(query).map(|c| c[1].to_string());

        if let Some(list) = self.playlist_regex.captures(query) {
            return self
                .load_playlist(&list[1], video_id.as_deref(), limit(self.config.playlist_limit))
                .await;
        }
        if let Some(id) = video_id {
            return self.load_video(&id).await;
        }

        let terms = query.strip_prefix(SEARCH_PREFIX).unwrap_or(query).trim();
        if terms.is_empty() {
            return Ok(LoadResult::Empty {});
        }
        self.search(terms, limit(self.config.search_limit)).await
    }
}

fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

/// `P#DT#H#M#S` to milliseconds. Unknown designators are ignored.
pub fn parse_iso8601_duration(value: &str) -> u64 {
    let Some(body) = value.strip_prefix('P') else {
        return 0;
    };

    let mut total_ms = 0f64;
    let mut number = String::new();
    for c in body.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            'T' => number.clear(),
            unit => {
                let n: f64 = number.parse().unwrap_or(0.0);
                number.clear();
                total_ms += n * match unit {
                    'W' => 604_800_000.0,
                    'D' => 86_400_000.0,
                    'H' => 3_600_000.0,
                    'M' => 60_000.0,
                    'S' => 1_000.0,
                    _ => 0.0,
                };
            }
        }
    }
    total_ms as u64
}

#[async_trait]
impl SourcePlugin for YouTubeSource {
    fn name(&self) -> &str {
        "youtube"
    }

    fn can_handle(&self, query: &str) -> bool {
        query.starts_with(SEARCH_PREFIX)
            || self.video_regex.is_match(query)
            || self.playlist_regex.is_match(query)
            || !query.contains("://")
    }

    async fn load(&self, query: &str, options: &LoadOptions) -> LoadResult {
        if self.config.api_key.is_empty() {
            return LoadResult::error(
                "YouTube API key is not configured",
                Severity::Common,
                "MissingApiKey",
            );
        }

        debug!("YouTube lookup: {}", query);
        match self.load_inner(query, options).await {
            Ok(result) => result,
            Err(e) => {
                warn!("YouTube lookup failed for {}: {}", query, e);
                LoadResult::error("Failed to load from YouTube", Severity::Suspicious, e.to_string())
            }
        }
    }

    async fn resolve_stream_locator(&self, track: &TrackInfo) -> AnyResult<StreamLocator> {
        let page = track
            .uri
            .clone()
            .unwrap_or_else(|| watch_url(&track.identifier));
        let url = resolver::resolve_stream_url(&self.config.resolver, &page).await?;
        Ok(if is_hls(&url) {
            StreamLocator::Hls(url)
        } else {
            StreamLocator::Url(url)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    fn source_with(endpoint: &str, resolver: &[&str]) -> YouTubeSource {
        YouTubeSource::new(
            YouTubeConfig {
                api_key: "k".into(),
                api_endpoint: endpoint.to_string(),
                search_limit: 10,
                playlist_limit: 50,
                resolver: resolver.iter().map(|s| s.to_string()).collect(),
            },
            Client::new(),
        )
        .unwrap()
    }

    fn video(id: &str, duration: &str, live: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "snippet": {
                "title": format!("Video {id}"),
                "channelTitle": "Channel",
                "description": "isrc: gbaym0500001",
                "tags": ["music"],
                "liveBroadcastContent": live,
                "thumbnails": { "default": { "url": "https://i.ytimg.com/d.jpg" } }
            },
            "contentDetails": { "duration": duration }
        })
    }

    /// Minimal API double answering by path prefix. Records request lines.
    async fn fake_api() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).into_owned();
                let line = head.lines().next().unwrap_or_default().to_string();
                log.lock().push(line.clone());

                let body = if line.contains("/videos?") && line.contains("aaaaaaaaaaa") && line.contains("bbbbbbbbbbb") {
                    // deliberately out of request order
                    serde_json::json!({"items": [video("bbbbbbbbbbb", "PT1M", "none"), video("aaaaaaaaaaa", "PT3M5S", "none")]})
                } else if line.contains("/videos?") && line.contains("lllllllllll") {
                    serde_json::json!({"items": [video("lllllllllll", "P0D", "live")]})
                } else if line.contains("/videos?") && line.contains("vvvvvvvvvvv") {
                    serde_json::json!({"items": [video("vvvvvvvvvvv", "P0D", "none")]})
                } else if line.contains("/videos?") && line.contains("aaaaaaaaaaa") {
                    serde_json::json!({"items": [video("aaaaaaaaaaa", "PT3M5S", "none")]})
                } else if line.contains("/search?") {
                    serde_json::json!({"items": [
                        {"id": {"videoId": "aaaaaaaaaaa"}},
                        {"id": {"videoId": "bbbbbbbbbbb"}},
                        {"id": {"kind": "youtube#channel"}}
                    ]})
                } else if line.contains("/playlists?") {
                    serde_json::json!({"items": [{"snippet": {"title": "Mix"}}]})
                } else if line.contains("/playlistItems?") {
                    serde_json::json!({"items": [
                        {"contentDetails": {"videoId": "aaaaaaaaaaa"}},
                        {"contentDetails": {"videoId": "bbbbbbbbbbb"}}
                    ]})
                } else {
                    serde_json::json!({"items": []})
                };

                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://{}", addr), seen)
    }

    #[test]
    fn iso_durations() {
        assert_eq!(parse_iso8601_duration("PT1H2M3S"), 3_723_000);
        assert_eq!(parse_iso8601_duration("PT4M13S"), 253_000);
        assert_eq!(parse_iso8601_duration("P1DT1S"), 86_401_000);
        assert_eq!(parse_iso8601_duration("PT1.5S"), 1_500);
        assert_eq!(parse_iso8601_duration("P0D"), 0);
        assert_eq!(parse_iso8601_duration("garbage"), 0);
    }

    #[test]
    fn query_matching() {
        let source = source_with("http://unused", &["true"]);
        assert!(source.can_handle("ytsearch:lofi"));
        assert!(source.can_handle("https://youtu.be/dQw4w9WgXcQ"));
        assert!(source.can_handle("https://www.youtube.com/playlist?list=PL123"));
        assert!(source.can_handle("plain words"));
        assert!(!source.can_handle("https://cdn.example/a.mp3"));

        let id = source
            .video_regex
            .captures("https://www.youtube.com/watch?feature=share&v=dQw4w9WgXcQ&t=3")
            .map(|c| c[1].to_string());
        assert_eq!(id.as_deref(), Some("dQw4w9WgXcQ"));
    }

    #[tokio::test]
    async fn missing_api_key_is_an_error() {
        let source = YouTubeSource::new(YouTubeConfig::default(), Client::new()).unwrap();
        let result = source.load("anything", &LoadOptions::default()).await;
        assert!(matches!(result, LoadResult::Error(e) if e.cause == "MissingApiKey"));
    }

    #[tokio::test]
    async fn video_and_live_tracks() {
        let (endpoint, _) = fake_api().await;
        let source = source_with(&endpoint, &["true"]);

        let LoadResult::Track(track) = source
            .load("https://youtu.be/aaaaaaaaaaa", &LoadOptions::default())
            .await
        else {
            panic!("expected a track");
        };
        assert_eq!(track.info.length, 185_000);
        assert!(track.info.is_seekable);
        assert_eq!(track.info.author, "Channel");
        assert_eq!(track.info.isrc.as_deref(), Some("GBAYM0500001"));
        assert_eq!(track.info.uri.as_deref(), Some("https://www.youtube.com/watch?v=aaaaaaaaaaa"));
        assert_eq!(track.info.artwork_url.as_deref(), Some("https://i.ytimg.com/d.jpg"));

        let LoadResult::Track(live) = source
            .load("https://www.youtube.com/watch?v=lllllllllll", &LoadOptions::default())
            .await
        else {
            panic!("expected a live track");
        };
        assert!(live.info.is_stream);
        assert!(!live.info.is_seekable);
    }

    #[tokio::test]
    async fn unknown_duration_videos_load_as_streams() {
        let (endpoint, _) = fake_api().await;
        let source = source_with(&endpoint, &["true"]);

        let LoadResult::Track(track) = source
            .load("https://youtu.be/vvvvvvvvvvv", &LoadOptions::default())
            .await
        else {
            panic!("expected a track");
        };
        assert_eq!(track.info.length, 0);
        assert!(track.info.is_stream);
        assert!(!track.info.is_seekable);

        let decoded = Track::decode(&track.encoded).unwrap();
        assert_eq!(decoded.info, track.info);
    }

    #[tokio::test]
    async fn search_keeps_result_order_and_honours_limit() {
        let (endpoint, seen) = fake_api().await;
        let source = source_with(&endpoint, &["true"]);

        let result = source
            .load(
                "ytsearch:some song",
                &LoadOptions {
                    limit: Some(5),
                    ..Default::default()
                },
            )
            .await;
        let LoadResult::Search(tracks) = result else {
            panic!("expected search results");
        };
        let ids: Vec<_> = tracks.iter().map(|t| t.info.identifier.as_str()).collect();
        assert_eq!(ids, ["aaaaaaaaaaa", "bbbbbbbbbbb"]);

        let requests = seen.lock().clone();
        assert!(requests[0].contains("maxResults=5"));
        assert!(requests[0].contains("q=some+song") || requests[0].contains("q=some%20song"));
    }

    #[tokio::test]
    async fn playlists_select_the_linked_video() {
        let (endpoint, _) = fake_api().await;
        let source = source_with(&endpoint, &["true"]);

        let result = source
            .load(
                "https://www.youtube.com/watch?v=bbbbbbbbbbb&list=PLmix",
                &LoadOptions::default(),
            )
            .await;
        let LoadResult::Playlist(playlist) = result else {
            panic!("expected a playlist");
        };
        assert_eq!(playlist.info.name, "Mix");
        assert_eq!(playlist.info.selected_track, 1);
        assert_eq!(playlist.tracks.len(), 2);
    }

    #[tokio::test]
    async fn unknown_video_is_empty() {
        let (endpoint, _) = fake_api().await;
        let source = source_with(&endpoint, &["true"]);
        let result = source
            .load("https://youtu.be/zzzzzzzzzzz", &LoadOptions::default())
            .await;
        assert!(matches!(result, LoadResult::Empty {}));
    }

    #[tokio::test]
    async fn locator_comes_from_the_resolver() {
        let source = source_with(
            "http://unused",
            &["sh", "-c", "echo '{\"stream_url\":\"https://media.example/live/index.m3u8\"}'"],
        );
        let info = TrackInfo {
            identifier: "aaaaaaaaaaa".into(),
            source_name: "youtube".into(),
            ..Default::default()
        };
        let locator = source.resolve_stream_locator(&info).await.unwrap();
        assert_eq!(
            locator,
            StreamLocator::Hls("https://media.example/live/index.m3u8".into())
        );
    }
}
