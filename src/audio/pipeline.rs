//! Transcoding pipeline: transcoder PCM -> volume -> Opus -> bounded frame queue.
//!
//! The reader task owns the transcoder process, so dropping a
//! [`TranscodePipeline`] aborts the task and kills the process with it.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::{io::AsyncReadExt, process::ChildStdout, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    audio::{
        constants::PCM_FRAME_BYTES,
        encoder::FrameEncoder,
        process::{StreamLocator, TranscodeProcess},
        volume::VolumeHandle,
    },
    configs::PlayerConfig,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to start transcoder: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("opus encoder error: {0}")]
    Encoder(#[from] audiopus::Error),
    #[error("{0}")]
    Closed(String),
}

/// Result of asking a frame source for the next 20 ms frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePoll {
    Frame(Bytes),
    /// Nothing buffered yet, the slot is skipped.
    Pending,
    Finished,
    Failed(String),
}

/// Supplier of encoded Opus frames for the pacing loop.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Never blocks.
    fn poll_frame(&mut self) -> FramePoll;

    /// Resolves once the first frame is available, or with the reason none will be.
    async fn wait_ready(&mut self) -> Result<(), PipelineError>;
}

enum PipelineItem {
    Frame(Bytes),
    Failed(String),
}

pub struct TranscodePipeline {
    frames: flume::Receiver<PipelineItem>,
    peeked: Option<Bytes>,
    reader: JoinHandle<()>,
}

impl TranscodePipeline {
    pub fn start(
        config: &PlayerConfig,
        http: &reqwest::Client,
        locator: &StreamLocator,
        start_ms: u64,
        volume: VolumeHandle,
    ) -> Result<Self, PipelineError> {
        let encoder = FrameEncoder::new(config.quality.preset())?;
        let (process, stdout) =
            TranscodeProcess::spawn(&config.ffmpeg_path, locator, start_ms, http)?;
        let (tx, rx) = flume::bounded(config.frame_buffer.max(1));

        let reader = tokio::spawn(read_frames(process, stdout, encoder, volume, tx));
        Ok(Self {
            frames: rx,
            peeked: None,
            reader,
        })
    }
}

impl Drop for TranscodePipeline {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl FrameSource for TranscodePipeline {
    fn poll_frame(&mut self) -> FramePoll {
        if let Some(frame) = self.peeked.take() {
            return FramePoll::Frame(frame);
        }
        match self.frames.try_recv() {
            Ok(PipelineItem::Frame(frame)) => FramePoll::Frame(frame),
            Ok(PipelineItem::Failed(e)) => FramePoll::Failed(e),
            Err(flume::TryRecvError::Empty) => FramePoll::Pending,
            Err(flume::TryRecvError::Disconnected) => FramePoll::Finished,
        }
    }

    async fn wait_ready(&mut self) -> Result<(), PipelineError> {
        if self.peeked.is_some() {
            return Ok(());
        }
        match self.frames.recv_async().await {
            Ok(PipelineItem::Frame(frame)) => {
                self.peeked = Some(frame);
                Ok(())
            }
            Ok(PipelineItem::Failed(e)) => Err(PipelineError::Closed(e)),
            Err(_) => Err(PipelineError::Closed(
                "stream ended before producing audio".into(),
            )),
        }
    }
}

/// Fills `buf` as far as the reader allows. Returns the byte count, short only at EOF.
async fn fill_frame(stdout: &mut ChildStdout, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stdout.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_frames(
    mut process: TranscodeProcess,
    mut stdout: ChildStdout,
    mut encoder: FrameEncoder,
    volume: VolumeHandle,
    tx: flume::Sender<PipelineItem>,
) {
    let mut raw = vec![0u8; PCM_FRAME_BYTES];
    let mut pcm = vec![0i16; PCM_FRAME_BYTES / 2];
    let mut produced = 0u64;

    loop {
        let filled = match fill_frame(&mut stdout, &mut raw).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tx
                    .send_async(PipelineItem::Failed(format!("transcoder read failed: {e}")))
                    .await;
                return;
            }
        };
        if filled == 0 {
            break;
        }
        // trailing partial frame is padded with silence
        raw[filled..].fill(0);

        for (sample, bytes) in pcm.iter_mut().zip(raw.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
        volume.apply(&mut pcm);

        let item = match encoder.encode(&pcm) {
            Ok(frame) => PipelineItem::Frame(frame),
            Err(e) => PipelineItem::Failed(format!("opus encoding failed: {e}")),
        };
        let failed = matches!(item, PipelineItem::Failed(_));
        if tx.send_async(item).await.is_err() || failed {
            return;
        }
        produced += 1;

        if filled < PCM_FRAME_BYTES {
            break;
        }
    }

    match process.wait().await {
        Ok(status) if status.success() => {
            debug!("Transcoder finished after {} frames", produced);
        }
        Ok(status) => {
            warn!("Transcoder exited with {} after {} frames", status, produced);
            let _ = tx
                .send_async(PipelineItem::Failed(format!("transcoder exited with {status}")))
                .await;
        }
        Err(e) => {
            let _ = tx
                .send_async(PipelineItem::Failed(format!("transcoder wait failed: {e}")))
                .await;
        }
    }
}

/// Builds frame sources for the player. Replaced by in-memory sources in tests.
pub trait PipelineFactory: Send + Sync {
    fn open(
        &self,
        locator: &StreamLocator,
        start_ms: u64,
        volume: VolumeHandle,
    ) -> Result<Box<dyn FrameSource>, PipelineError>;
}

pub struct FfmpegPipelineFactory {
    config: PlayerConfig,
    http: reqwest::Client,
}

impl FfmpegPipelineFactory {
    pub fn new(config: PlayerConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }
}

impl PipelineFactory for FfmpegPipelineFactory {
    fn open(
        &self,
        locator: &StreamLocator,
        start_ms: u64,
        volume: VolumeHandle,
    ) -> Result<Box<dyn FrameSource>, PipelineError> {
        let pipeline = TranscodePipeline::start(&self.config, &self.http, locator, start_ms, volume)?;
        Ok(Box::new(pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_from(items: Vec<PipelineItem>) -> TranscodePipeline {
        let (tx, rx) = flume::bounded(items.len().max(1));
        for item in items {
            tx.send(item).unwrap();
        }
        drop(tx);
        TranscodePipeline {
            frames: rx,
            peeked: None,
            reader: tokio::spawn(async {}),
        }
    }

    #[tokio::test]
    async fn wait_ready_keeps_the_first_frame() {
        let mut pipeline = pipeline_from(vec![
            PipelineItem::Frame(Bytes::from_static(b"a")),
            PipelineItem::Frame(Bytes::from_static(b"b")),
        ]);
        pipeline.wait_ready().await.unwrap();
        assert_eq!(pipeline.poll_frame(), FramePoll::Frame(Bytes::from_static(b"a")));
        assert_eq!(pipeline.poll_frame(), FramePoll::Frame(Bytes::from_static(b"b")));
        assert_eq!(pipeline.poll_frame(), FramePoll::Finished);
    }

    #[tokio::test]
    async fn empty_queue_is_pending_until_closed() {
        let (tx, rx) = flume::bounded(4);
        let mut pipeline = TranscodePipeline {
            frames: rx,
            peeked: None,
            reader: tokio::spawn(async {}),
        };
        assert_eq!(pipeline.poll_frame(), FramePoll::Pending);
        tx.send(PipelineItem::Failed("boom".into())).unwrap();
        assert_eq!(pipeline.poll_frame(), FramePoll::Failed("boom".into()));
        drop(tx);
        assert_eq!(pipeline.poll_frame(), FramePoll::Finished);
    }

    #[tokio::test]
    async fn wait_ready_reports_early_failure() {
        let mut pipeline = pipeline_from(vec![PipelineItem::Failed("404".into())]);
        let err = pipeline.wait_ready().await.unwrap_err();
        assert_eq!(err.to_string(), "404");

        let mut empty = pipeline_from(vec![]);
        assert!(matches!(empty.wait_ready().await, Err(PipelineError::Closed(_))));
    }
}
