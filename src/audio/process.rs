use std::{path::PathBuf, process::Stdio};

use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::audio::{constants::TARGET_SAMPLE_RATE, pipeline::PipelineError};

/// Where the transcoder reads a track from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLocator {
    File(PathBuf),
    /// Plain HTTP(S) media, relayed into the transcoder by the node.
    Url(String),
    /// HLS playlist, handed to the transcoder directly.
    Hls(String),
}

impl StreamLocator {
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::File(_))
    }

    /// Input given to `-i`. Plain URLs starting at zero are piped through stdin.
    fn input(&self, start_ms: u64) -> String {
        match self {
            Self::File(path) => path.to_string_lossy().into_owned(),
            Self::Url(url) if start_ms > 0 => url.clone(),
            Self::Url(_) => "pipe:0".to_string(),
            Self::Hls(url) => url.clone(),
        }
    }

    fn relays_stdin(&self, start_ms: u64) -> bool {
        matches!(self, Self::Url(_)) && start_ms == 0
    }
}

/// Arguments producing 48 kHz stereo s16le PCM on stdout.
pub fn ffmpeg_args(locator: &StreamLocator, start_ms: u64) -> Vec<String> {
    let mut args: Vec<String> = ["-analyzeduration", "0", "-loglevel", "0"]
        .into_iter()
        .map(String::from)
        .collect();

    if start_ms > 0 {
        args.push("-ss".into());
        args.push(format!("{:.3}", start_ms as f64 / 1000.0));
    }

    if locator.is_remote() && !locator.relays_stdin(start_ms) {
        for arg in ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"] {
            args.push(arg.into());
        }
    }

    args.push("-i".into());
    args.push(locator.input(start_ms));

    for arg in ["-f", "s16le", "-ar"] {
        args.push(arg.into());
    }
    args.push(TARGET_SAMPLE_RATE.to_string());
    for arg in ["-ac", "2", "pipe:1"] {
        args.push(arg.into());
    }
    args
}

/// A running transcoder process. Killed when dropped.
pub struct TranscodeProcess {
    child: Child,
    feeder: Option<JoinHandle<()>>,
}

impl TranscodeProcess {
    pub fn spawn(
        ffmpeg: &str,
        locator: &StreamLocator,
        start_ms: u64,
        http: &reqwest::Client,
    ) -> Result<(Self, ChildStdout), PipelineError> {
        let relay = locator.relays_stdin(start_ms);
        let args = ffmpeg_args(locator, start_ms);
        debug!("Spawning {} {}", ffmpeg, args.join(" "));

        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(if relay { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(PipelineError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Closed("transcoder stdout unavailable".into()))?;

        let feeder = match (locator, child.stdin.take()) {
            (StreamLocator::Url(url), Some(stdin)) if relay => {
                Some(tokio::spawn(relay_http(http.clone(), url.clone(), stdin)))
            }
            _ => None,
        };

        Ok((Self { child, feeder }, stdout))
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

impl Drop for TranscodeProcess {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        let _ = self.child.start_kill();
    }
}

/// Downloads `url` into the transcoder's stdin until either side closes.
async fn relay_http(http: reqwest::Client, url: String, mut stdin: tokio::process::ChildStdin) {
    let response = match http.get(&url).send().await.and_then(|r| r.error_for_status()) {
        Ok(response) => response,
        Err(e) => {
            warn!("HTTP input {} failed: {}", url, e);
            return;
        }
    };

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("HTTP input {} interrupted: {}", url, e);
                break;
            }
        };
        if stdin.write_all(&chunk).await.is_err() {
            // transcoder exited
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(locator: &StreamLocator, start_ms: u64) -> String {
        ffmpeg_args(locator, start_ms).join(" ")
    }

    #[test]
    fn local_files_are_read_directly() {
        let locator = StreamLocator::File("/music/a b.flac".into());
        assert_eq!(
            joined(&locator, 0),
            "-analyzeduration 0 -loglevel 0 -i /music/a b.flac -f s16le -ar 48000 -ac 2 pipe:1"
        );
        assert_eq!(
            joined(&locator, 61_500),
            "-analyzeduration 0 -loglevel 0 -ss 61.500 -i /music/a b.flac -f s16le -ar 48000 -ac 2 pipe:1"
        );
    }

    #[test]
    fn plain_urls_are_relayed_until_seeked() {
        let locator = StreamLocator::Url("https://cdn.example/a.mp3".into());
        let args = ffmpeg_args(&locator, 0);
        assert!(args.windows(2).any(|w| w == ["-i", "pipe:0"]));
        assert!(!args.contains(&"-reconnect".to_string()));

        let seeked = ffmpeg_args(&locator, 5_000);
        assert!(seeked.windows(2).any(|w| w == ["-i", "https://cdn.example/a.mp3"]));
        assert!(seeked.windows(2).any(|w| w == ["-reconnect", "1"]));
        assert!(seeked.windows(2).any(|w| w == ["-ss", "5.000"]));
    }

    #[test]
    fn hls_reconnects_and_reads_url() {
        let locator = StreamLocator::Hls("https://live.example/index.m3u8".into());
        let args = ffmpeg_args(&locator, 0);
        let reconnect = args.iter().position(|a| a == "-reconnect").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(reconnect < input);
        assert_eq!(args[input + 1], "https://live.example/index.m3u8");
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }
}
