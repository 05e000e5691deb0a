use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    audio::{FramePoll, FrameSource},
    common::types::Shared,
    gateway::{
        constants::{FRAME_DURATION, SILENCE_FRAME, SILENCE_FRAMES_ON_STOP},
        udp_link::{FrameCounters, PacketSink},
    },
};

/// The transport a pacing loop sends through. Swapped in place when the voice
/// session installs a new session description.
pub type SharedSink = Shared<Option<Box<dyn PacketSink>>>;

/// Time source of the pacing loop.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&self, deadline: Instant);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Instructions from the owning player, applied at a slot boundary.
pub enum PacingControl {
    /// Replace the frame source, optionally restarting RTP counters.
    Swap {
        source: Box<dyn FrameSource>,
        reset_counters: bool,
    },
    /// Stop sending until resumed.
    Suspend,
    /// Continue sending, re-anchoring the schedule at the current time.
    Resume,
}

/// Terminal notifications sent back to the owning player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacingEvent {
    Finished { generation: u64 },
    Failed { generation: u64, error: String },
}

/// Drives one track: pulls a frame every [`FRAME_DURATION`] and hands it to the sink.
///
/// Deadlines are absolute. Slot `n` is due at `anchor + n * FRAME_DURATION`
/// no matter how late slot `n - 1` fired, so scheduler jitter never accumulates.
/// A slot with no frame ready is skipped without touching RTP counters.
pub struct PacingLoop<C: Clock> {
    generation: u64,
    source: Box<dyn FrameSource>,
    sink: SharedSink,
    clock: C,
    control: mpsc::UnboundedReceiver<PacingControl>,
    events: mpsc::UnboundedSender<PacingEvent>,
    counters: Arc<FrameCounters>,
    frames_played: Arc<AtomicU64>,
    cancel: CancellationToken,
    suspended: bool,
}

pub struct PacingParts<C: Clock> {
    pub generation: u64,
    pub source: Box<dyn FrameSource>,
    pub sink: SharedSink,
    pub clock: C,
    pub control: mpsc::UnboundedReceiver<PacingControl>,
    pub events: mpsc::UnboundedSender<PacingEvent>,
    pub counters: Arc<FrameCounters>,
    pub frames_played: Arc<AtomicU64>,
    pub cancel: CancellationToken,
    pub suspended: bool,
}

impl<C: Clock> PacingLoop<C> {
    pub fn new(parts: PacingParts<C>) -> Self {
        Self {
            generation: parts.generation,
            source: parts.source,
            sink: parts.sink,
            clock: parts.clock,
            control: parts.control,
            events: parts.events,
            counters: parts.counters,
            frames_played: parts.frames_played,
            cancel: parts.cancel,
            suspended: parts.suspended,
        }
    }

    pub async fn run(mut self) {
        let mut next_send = self.clock.now();

        loop {
            while let Ok(control) = self.control.try_recv() {
                self.apply(control, &mut next_send).await;
            }

            if self.suspended {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    control = self.control.recv() => match control {
                        Some(control) => {
                            self.apply(control, &mut next_send).await;
                            continue;
                        }
                        None => return,
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.clock.sleep_until(next_send) => {}
            }

            match self.source.poll_frame() {
                FramePoll::Frame(frame) => {
                    self.send(&frame).await;
                    self.frames_played.fetch_add(1, Ordering::Relaxed);
                }
                FramePoll::Pending => {
                    self.counters.nulled.fetch_add(1, Ordering::Relaxed);
                    trace!("pacing slot skipped, no frame buffered");
                }
                FramePoll::Finished => {
                    self.send_silence().await;
                    let _ = self.events.send(PacingEvent::Finished {
                        generation: self.generation,
                    });
                    return;
                }
                FramePoll::Failed(error) => {
                    self.send_silence().await;
                    let _ = self.events.send(PacingEvent::Failed {
                        generation: self.generation,
                        error,
                    });
                    return;
                }
            }

            next_send += FRAME_DURATION;
        }
    }

    async fn apply(&mut self, control: PacingControl, next_send: &mut Instant) {
        match control {
            PacingControl::Swap {
                source,
                reset_counters,
            } => {
                debug!("pacing switched to a rebuilt frame source");
                self.source = source;
                if reset_counters {
                    if let Some(sink) = self.sink.lock().await.as_mut() {
                        sink.reset_counters();
                    }
                }
            }
            PacingControl::Suspend => {
                if !self.suspended {
                    self.suspended = true;
                    self.send_silence().await;
                }
            }
            PacingControl::Resume => {
                if self.suspended {
                    self.suspended = false;
                    *next_send = self.clock.now();
                }
            }
        }
    }

    async fn send(&self, frame: &[u8]) {
        match self.sink.lock().await.as_mut() {
            Some(sink) => sink.send_frame(frame).await,
            None => {
                // the slot still elapsed, so it counts against the deficit
                self.counters.expected.fetch_add(1, Ordering::Relaxed);
                self.counters.omitted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn send_silence(&self) {
        if let Some(sink) = self.sink.lock().await.as_mut() {
            for _ in 0..SILENCE_FRAMES_ON_STOP {
                sink.send_frame(&SILENCE_FRAME).await;
            }
        }
    }
}
