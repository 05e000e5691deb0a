use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub youtube: bool,
    #[serde(default = "default_true")]
    pub http: bool,
    #[serde(default = "default_true")]
    pub local: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            youtube: true,
            http: true,
            local: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct YouTubeConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    #[serde(default = "default_playlist_limit")]
    pub playlist_limit: usize,
    /// Command printing a direct media URL for the video URL appended as last argument.
    #[serde(default = "default_resolver")]
    pub resolver: Vec<String>,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_endpoint: default_api_endpoint(),
            search_limit: default_search_limit(),
            playlist_limit: default_playlist_limit(),
            resolver: default_resolver(),
        }
    }
}

fn default_api_endpoint() -> String {
    "https://www.googleapis.com/youtube/v3".to_string()
}

fn default_search_limit() -> usize {
    10
}

fn default_playlist_limit() -> usize {
    50
}

fn default_resolver() -> Vec<String> {
    ["yt-dlp", "-f", "bestaudio", "--get-url"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalConfig {
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            extensions: default_extensions(),
        }
    }
}

fn default_base_path() -> String {
    ".".to_string()
}

fn default_extensions() -> Vec<String> {
    ["mp3", "wav", "ogg", "flac", "m4a"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_true() -> bool {
    true
}
