use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: String,
    /// Seconds between `stats` pushes on every control socket.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Seconds between `playerUpdate` pushes for each active player.
    #[serde(default = "default_player_update_interval")]
    pub player_update_interval_secs: u64,
    /// Resume window applied when a client enables resuming without a timeout.
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: "youshallnotpass".to_string(),
            stats_interval_secs: default_stats_interval(),
            player_update_interval_secs: default_player_update_interval(),
            resume_timeout_secs: default_resume_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2333
}

fn default_stats_interval() -> u64 {
    60
}

fn default_player_update_interval() -> u64 {
    5
}

fn default_resume_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub filters: Option<String>,
    pub file: Option<FileLoggingConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileLoggingConfig {
    pub path: String,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

fn default_max_lines() -> usize {
    10_000
}
