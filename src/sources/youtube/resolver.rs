use std::{process::Stdio, time::Duration};

use tokio::process::Command;
use tracing::debug;

use crate::common::types::AnyResult;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `command` with `video_url` appended and returns the media URL it prints.
pub async fn resolve_stream_url(command: &[String], video_url: &str) -> AnyResult<String> {
    let (program, args) = command
        .split_first()
        .ok_or("youtube resolver command is empty")?;

    debug!("Resolving {} with {}", video_url, program);
    let child = Command::new(program)
        .args(args)
        .arg(video_url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(RESOLVE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| format!("resolver timed out after {:?}", RESOLVE_TIMEOUT))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("resolver exited with {}: {}", output.status, stderr.trim()).into());
    }

    parse_resolver_output(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| "resolver printed no stream URL".into())
}

/// Accepts a JSON object with `stream_url` or plain text whose first URL wins.
pub fn parse_resolver_output(stdout: &str) -> Option<String> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        return value["stream_url"].as_str().map(str::to_string);
    }

    trimmed
        .split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(str::to_string)
}
