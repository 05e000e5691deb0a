use std::time::Duration;

use reqwest::{Client, Error};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36";

/// Shared outbound HTTP client for source lookups and media relays.
pub struct HttpClient;

impl HttpClient {
    pub fn default_user_agent() -> &'static str {
        DEFAULT_USER_AGENT
    }

    /// No whole-request timeout: relayed media bodies stay open for the
    /// length of a track. Short lookups set their own per-request timeout.
    pub fn new() -> Result<Client, Error> {
        Client::builder()
            .user_agent(Self::default_user_agent())
            .connect_timeout(Duration::from_secs(10))
            .build()
    }
}
