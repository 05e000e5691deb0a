use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use reqwest::{Client, header};
use tracing::{debug, warn};

use crate::{
    audio::StreamLocator,
    common::{
        Severity,
        http::HttpClient,
        types::{AnyResult, AudioFormat},
    },
    protocol::tracks::{LoadResult, Track, TrackInfo},
    sources::plugin::{LoadOptions, SourcePlugin},
};

const SNIFF_BYTES: usize = 2048;
const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpSource {
    client: Client,
    url_regex: Regex,
}

impl HttpSource {
    pub fn new(client: Client) -> AnyResult<Self> {
        Ok(Self {
            client,
            url_regex: Regex::new(r"(?i)^https?://")?,
        })
    }

    /// Reads the first bytes of `url` and reports the codec they look like.
    async fn sniff(&self, url: &str) -> AnyResult<AudioFormat> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, format!("bytes=0-{}", SNIFF_BYTES - 1))
            .header(header::USER_AGENT, HttpClient::default_user_agent())
            .timeout(SNIFF_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // servers ignoring the range header would stream the whole body
        let mut head = Vec::with_capacity(SNIFF_BYTES);
        let mut body = response.bytes_stream();
        while head.len() < SNIFF_BYTES {
            match body.next().await {
                Some(chunk) => head.extend_from_slice(&chunk?),
                None => break,
            }
        }
        head.truncate(SNIFF_BYTES);

        Ok(detect_format(&head, &content_type))
    }
}

pub fn is_hls(url: &str) -> bool {
    url.to_ascii_lowercase().contains(".m3u8")
}

/// Magic-byte detection, falling back to the declared content type.
pub fn detect_format(head: &[u8], content_type: &str) -> AudioFormat {
    let contains = |needle: &[u8]| head.windows(needle.len()).any(|w| w == needle);

    if contains(b"OpusHead") {
        AudioFormat::Opus
    } else if contains(b"ftypM4A") || contains(b"isom") {
        AudioFormat::Aac
    } else if contains(b"vorbis") {
        AudioFormat::Vorbis
    } else if head.starts_with(b"RIFF") && head.get(8..12) == Some(b"WAVE") {
        AudioFormat::PcmS16le
    } else {
        AudioFormat::from_content_type(content_type)
    }
}

/// Last path segment without the query string.
fn title_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.trim_end_matches('/').rsplit('/').next())
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("Unknown Title")
        .to_string()
}

#[async_trait]
impl SourcePlugin for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn can_handle(&self, query: &str) -> bool {
        self.url_regex.is_match(query)
    }

    async fn load(&self, query: &str, _options: &LoadOptions) -> LoadResult {
        let url = query.trim().trim_start_matches('<').trim_end_matches('>');
        if !self.can_handle(url) {
            return LoadResult::error(
                format!("Invalid HTTP URL: {}", url),
                Severity::Common,
                "InvalidUrl",
            );
        }

        let live = is_hls(url);
        if !live {
            debug!("Probing HTTP source: {}", url);
            match self.sniff(url).await {
                Ok(format) if format.is_supported() => {
                    debug!("Detected {} for {}", format, url);
                }
                Ok(format) => {
                    return LoadResult::error(
                        format!("Unsupported codec: {}", format),
                        Severity::Common,
                        "UnsupportedCodec",
                    );
                }
                Err(e) => {
                    warn!("Probing failed for {}: {}", url, e);
                    return LoadResult::error(
                        format!("Failed to probe {}", url),
                        Severity::Suspicious,
                        e.to_string(),
                    );
                }
            }
        }

        let info = TrackInfo {
            identifier: url.to_string(),
            is_seekable: !live,
            author: "HTTP Stream".to_string(),
            length: 0,
            is_stream: live,
            position: 0,
            title: title_from_url(url),
            uri: Some(url.to_string()),
            artwork_url: None,
            isrc: None,
            source_name: "http".to_string(),
        };

        match Track::new(info) {
            Some(track) => LoadResult::Track(track),
            None => LoadResult::error("Failed to encode HTTP track", Severity::Fault, "EncodeFailed"),
        }
    }

    async fn resolve_stream_locator(&self, track: &TrackInfo) -> AnyResult<StreamLocator> {
        let url = track.uri.clone().unwrap_or_else(|| track.identifier.clone());
        if is_hls(&url) {
            Ok(StreamLocator::Hls(url))
        } else {
            Ok(StreamLocator::Url(url))
        }
    }
}
