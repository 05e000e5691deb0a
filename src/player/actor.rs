//! The per-guild player task.
//!
//! Every mutation of a player happens here, in the order its inputs arrive:
//! commands from handles, events from the voice session, terminal events from
//! the pacing loop, and results of pipeline priming. Slow work (stream
//! resolution, transcoder start-up) runs in side tasks that report back, so a
//! lookup never holds up the actor.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audio::{FrameSource, VolumeHandle},
    common::{
        Severity,
        types::{GuildId, UserId},
    },
    gateway::{
        GatewayEvent, PacingControl, PacingEvent, PacingLoop, PacingParts, SharedSink, TokioClock,
        VoiceRequest, VoiceSessionHandle,
    },
    player::{
        context::{PlayOptions, PlayerDeps, PlayerEvent, PlayerShared, PlayerSnapshot, SpeakerStream},
        error::PlayerError,
        state::VoiceState,
        status::{ConnectionStatus, PlaybackMachine, PlaybackReason, PlaybackStatus, cross_transition},
    },
    protocol::{
        OutgoingMessage,
        events::{RenodeEvent, TrackException},
        tracks::{Track, TrackInfo},
    },
};

type SeekReply = oneshot::Sender<Result<bool, PlayerError>>;

pub enum PlayerCommand {
    Play {
        track: Track,
        options: PlayOptions,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Pause {
        reply: oneshot::Sender<bool>,
    },
    Resume {
        reply: oneshot::Sender<bool>,
    },
    SetVolume {
        volume: u16,
        reply: oneshot::Sender<u8>,
    },
    Seek {
        position: u64,
        reply: SeekReply,
    },
    UpdateVoice {
        voice: VoiceState,
        reply: oneshot::Sender<()>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

enum PrimePurpose {
    /// First source of a track. A seek issued before it was ready rides along.
    Start { seek_reply: Option<SeekReply> },
    Seek { position: u64, reply: SeekReply },
}

struct Primed {
    id: u64,
    purpose: PrimePurpose,
    result: Result<Box<dyn FrameSource>, PlayerError>,
}

struct PendingPrime {
    id: u64,
    cancel: CancellationToken,
}

impl Drop for PendingPrime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PacingHandle {
    generation: u64,
    control: mpsc::UnboundedSender<PacingControl>,
    cancel: CancellationToken,
    running: bool,
}

impl Drop for PacingHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct VoiceLink {
    handle: VoiceSessionHandle,
    events: mpsc::UnboundedReceiver<GatewayEvent>,
    speaking: bool,
}

pub(crate) struct PlayerActor {
    guild_id: GuildId,
    user_id: UserId,
    deps: PlayerDeps,
    shared: Arc<PlayerShared>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    snapshot: watch::Sender<PlayerSnapshot>,
    commands: mpsc::UnboundedReceiver<PlayerCommand>,

    machine: PlaybackMachine,
    connection: ConnectionStatus,
    track: Option<Track>,
    volume: VolumeHandle,
    voice: VoiceState,
    link: Option<VoiceLink>,
    sink: SharedSink,

    generation: u64,
    pacing: Option<PacingHandle>,
    pacing_tx: mpsc::UnboundedSender<PacingEvent>,
    pacing_rx: mpsc::UnboundedReceiver<PacingEvent>,

    next_prime_id: u64,
    start_prime: Option<PendingPrime>,
    seek_prime: Option<PendingPrime>,
    primed_tx: mpsc::UnboundedSender<Primed>,
    primed_rx: mpsc::UnboundedReceiver<Primed>,
}

pub(crate) struct ActorParts {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub deps: PlayerDeps,
    pub shared: Arc<PlayerShared>,
    pub events: mpsc::UnboundedSender<PlayerEvent>,
    pub snapshot: watch::Sender<PlayerSnapshot>,
    pub commands: mpsc::UnboundedReceiver<PlayerCommand>,
}

impl PlayerActor {
    pub fn new(parts: ActorParts) -> Self {
        let (pacing_tx, pacing_rx) = mpsc::unbounded_channel();
        let (primed_tx, primed_rx) = mpsc::unbounded_channel();
        Self {
            guild_id: parts.guild_id,
            user_id: parts.user_id,
            deps: parts.deps,
            shared: parts.shared,
            events: parts.events,
            snapshot: parts.snapshot,
            commands: parts.commands,
            machine: PlaybackMachine::default(),
            connection: ConnectionStatus::Disconnected,
            track: None,
            volume: VolumeHandle::default(),
            voice: VoiceState::default(),
            link: None,
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            generation: 0,
            pacing: None,
            pacing_tx,
            pacing_rx,
            next_prime_id: 0,
            start_prime: None,
            seek_prime: None,
            primed_tx,
            primed_rx,
        }
    }

    pub async fn run(mut self) {
        let mut updates = tokio::time::interval(self.deps.update_interval);
        updates.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PlayerCommand::Destroy { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                event = next_gateway_event(&mut self.link) => match event {
                    Some(event) => self.handle_gateway_event(event).await,
                    None => {
                        debug!("[{}] voice session task ended", self.guild_id);
                        self.drop_link();
                    }
                },
                Some(event) = self.pacing_rx.recv() => self.handle_pacing_event(event),
                Some(primed) = self.primed_rx.recv() => self.handle_primed(primed),
                _ = updates.tick() => self.push_player_update(),
            }
            self.publish();
        }
    }

    /// Replies go out after the snapshot is published, so a caller never
    /// observes its own request as not yet applied.
    async fn handle_command(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Play {
                track,
                options,
                reply,
            } => {
                let started = self.play(track, options);
                self.publish();
                let _ = reply.send(started);
            }
            PlayerCommand::Stop { reply } => {
                let stopped = self.end_track(PlaybackReason::Stopped);
                self.publish();
                let _ = reply.send(stopped);
            }
            PlayerCommand::Pause { reply } => {
                let paused = self.set_status(PlaybackStatus::Paused, PlaybackReason::Requested);
                self.publish();
                let _ = reply.send(paused);
            }
            PlayerCommand::Resume { reply } => {
                let resumed = self.set_status(PlaybackStatus::Playing, PlaybackReason::Requested);
                self.publish();
                let _ = reply.send(resumed);
            }
            PlayerCommand::SetVolume { volume, reply } => {
                let applied = self.volume.set(volume);
                debug!("[{}] volume set to {}", self.guild_id, applied);
                self.publish();
                let _ = reply.send(applied);
            }
            PlayerCommand::Seek { position, reply } => self.seek(position, reply),
            PlayerCommand::UpdateVoice { voice, reply } => {
                self.update_voice(voice).await;
                self.publish();
                let _ = reply.send(());
            }
            PlayerCommand::Destroy { reply } => {
                // the run loop intercepts destroy before dispatching here
                let _ = reply.send(());
            }
        }
    }

    fn play(&mut self, track: Track, options: PlayOptions) -> bool {
        if self.machine.status() != PlaybackStatus::Idle {
            if options.no_replace {
                debug!("[{}] play ignored, a track is active", self.guild_id);
                return false;
            }
            self.end_track(PlaybackReason::Replaced);
        }

        let start_ms = if track.info.is_stream { 0 } else { options.start_ms };
        info!(
            "[{}] Playing {} ({}) from {} ms",
            self.guild_id, track.info.title, track.info.source_name, start_ms
        );

        self.generation += 1;
        self.shared.restart_position(start_ms);
        self.track = Some(track);
        self.set_status(PlaybackStatus::Playing, PlaybackReason::Requested);
        if options.paused {
            self.set_status(PlaybackStatus::Paused, PlaybackReason::Requested);
        }

        self.start_prime = self.spawn_prime(start_ms, PrimePurpose::Start { seek_reply: None });
        true
    }

    fn seek(&mut self, position: u64, reply: SeekReply) {
        let Some(info) = self
            .track
            .as_ref()
            .filter(|_| self.machine.status() != PlaybackStatus::Idle)
            .map(|t| t.info.clone())
        else {
            let _ = reply.send(Ok(false));
            return;
        };
        if !info.is_seekable || info.is_stream {
            let _ = reply.send(Err(PlayerError::NotSeekable));
            return;
        }

        debug!("[{}] seeking to {} ms", self.guild_id, position);
        if self.pacing.is_none() {
            // the first source is not ready yet; restart it at the new offset
            self.shared.restart_position(position);
            self.start_prime = self.spawn_prime(
                position,
                PrimePurpose::Start {
                    seek_reply: Some(reply),
                },
            );
            return;
        }

        self.seek_prime = self.spawn_prime(position, PrimePurpose::Seek { position, reply });
    }

    /// Starts building a frame source for the current track in a side task.
    fn spawn_prime(&mut self, start_ms: u64, purpose: PrimePurpose) -> Option<PendingPrime> {
        let info = self.track.as_ref()?.info.clone();
        self.next_prime_id += 1;
        let id = self.next_prime_id;
        let cancel = CancellationToken::new();

        let deps = self.deps.clone();
        let volume = self.volume.clone();
        let done = self.primed_tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let result = prime_source(&deps, &info, start_ms, volume, token).await;
            let _ = done.send(Primed {
                id,
                purpose,
                result,
            });
        });

        Some(PendingPrime { id, cancel })
    }

    fn handle_primed(&mut self, primed: Primed) {
        let Primed {
            id,
            purpose,
            result,
        } = primed;

        match purpose {
            PrimePurpose::Start { seek_reply } => {
                if self.start_prime.as_ref().map(|p| p.id) != Some(id) {
                    if let Some(reply) = seek_reply {
                        let _ = reply.send(Err(PlayerError::Cancelled));
                    }
                    return;
                }
                self.start_prime = None;

                match result {
                    Ok(source) => {
                        self.start_pacing(source);
                        if let Some(track) = self.track.clone() {
                            self.emit_event(RenodeEvent::TrackStart {
                                guild_id: self.guild_id.clone(),
                                track,
                            });
                        }
                        if let Some(reply) = seek_reply {
                            let _ = reply.send(Ok(true));
                        }
                    }
                    Err(e) => {
                        if let Some(reply) = seek_reply {
                            let _ = reply.send(Err(e.clone()));
                        }
                        if e != PlayerError::Cancelled {
                            self.fail_track(&e.to_string(), Severity::Common);
                        }
                    }
                }
            }
            PrimePurpose::Seek { position, reply } => {
                if self.seek_prime.as_ref().map(|p| p.id) != Some(id) {
                    let _ = reply.send(Err(PlayerError::Cancelled));
                    return;
                }
                self.seek_prime = None;

                let Some(pacing) = self.pacing.as_ref() else {
                    let _ = reply.send(Err(PlayerError::Cancelled));
                    return;
                };
                match result {
                    Ok(source) => {
                        let swap = PacingControl::Swap {
                            source,
                            reset_counters: !self.deps.config.seek_timestamp_continuity,
                        };
                        if pacing.control.send(swap).is_err() {
                            let _ = reply.send(Err(PlayerError::Cancelled));
                            return;
                        }
                        self.shared.restart_position(position);
                        let _ = reply.send(Ok(true));
                    }
                    Err(e) => {
                        warn!("[{}] seek to {} ms failed: {}", self.guild_id, position, e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    fn start_pacing(&mut self, source: Box<dyn FrameSource>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let running = self.should_pace();

        let pacing = PacingLoop::new(PacingParts {
            generation: self.generation,
            source,
            sink: self.sink.clone(),
            clock: TokioClock,
            control: control_rx,
            events: self.pacing_tx.clone(),
            counters: self.shared.counters.clone(),
            frames_played: self.shared.frames_played.clone(),
            cancel: cancel.clone(),
            suspended: !running,
        });
        tokio::spawn(pacing.run());

        self.pacing = Some(PacingHandle {
            generation: self.generation,
            control: control_tx,
            cancel,
            running,
        });
        self.sync_pacing();
    }

    fn should_pace(&self) -> bool {
        self.machine.status() == PlaybackStatus::Playing && self.connection.is_connected()
    }

    /// Suspends or resumes pacing and the speaking flag to match the two state machines.
    fn sync_pacing(&mut self) {
        let desired = self.should_pace();

        if let Some(pacing) = self.pacing.as_mut() {
            if pacing.running != desired {
                let control = if desired {
                    PacingControl::Resume
                } else {
                    PacingControl::Suspend
                };
                let _ = pacing.control.send(control);
                pacing.running = desired;
            }
        }

        let speaking = desired && self.pacing.is_some();
        if let Some(link) = self.link.as_mut() {
            if link.speaking != speaking {
                link.handle.set_speaking(speaking);
                link.speaking = speaking;
            }
        }
    }

    /// Applies a legal playback transition. Transitions to idle go through [`Self::end_track`].
    fn set_status(&mut self, to: PlaybackStatus, reason: PlaybackReason) -> bool {
        let Some(transition) = self.machine.transition(to, reason) else {
            return false;
        };
        debug!(
            "[{}] playback {:?} -> {:?} ({:?})",
            self.guild_id, transition.from, transition.to, reason
        );
        let _ = self.events.send(PlayerEvent::Transition {
            guild_id: self.guild_id.clone(),
            transition,
        });
        self.sync_pacing();
        true
    }

    /// Tears down the active track and reports its end. Returns false when idle.
    fn end_track(&mut self, reason: PlaybackReason) -> bool {
        if self.machine.status() == PlaybackStatus::Idle {
            return false;
        }

        self.start_prime = None;
        self.seek_prime = None;
        self.pacing = None;

        if !self.set_status(PlaybackStatus::Idle, reason) {
            return false;
        }
        if let (Some(track), Some(end)) = (self.track.take(), reason.end_reason()) {
            self.emit_event(RenodeEvent::TrackEnd {
                guild_id: self.guild_id.clone(),
                track,
                reason: end,
            });
        }
        true
    }

    /// Reports a pipeline failure and ends the track with reason `error`.
    fn fail_track(&mut self, message: &str, severity: Severity) {
        warn!("[{}] track failed: {}", self.guild_id, message);
        if let Some(track) = self.track.clone() {
            self.emit_event(RenodeEvent::TrackException {
                guild_id: self.guild_id.clone(),
                track,
                exception: TrackException {
                    message: Some(message.to_string()),
                    severity,
                    cause: message.to_string(),
                },
            });
        }
        self.end_track(PlaybackReason::Error);
    }

    fn handle_pacing_event(&mut self, event: PacingEvent) {
        let current = self.pacing.as_ref().map(|p| p.generation);
        match event {
            PacingEvent::Finished { generation } if Some(generation) == current => {
                debug!("[{}] track finished", self.guild_id);
                self.end_track(PlaybackReason::Ended);
            }
            PacingEvent::Failed { generation, error } if Some(generation) == current => {
                self.fail_track(&error, Severity::Fault);
            }
            stale => debug!("[{}] ignoring stale pacing event {:?}", self.guild_id, stale),
        }
    }

    async fn update_voice(&mut self, voice: VoiceState) {
        if voice == self.voice && self.link.is_some() {
            return;
        }
        if !voice.is_complete() {
            warn!("[{}] incomplete voice state ignored", self.guild_id);
            return;
        }

        // the old session must be gone before the new one claims the ssrc
        self.drop_link();
        *self.sink.lock().await = None;
        self.voice = voice.clone();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let request = VoiceRequest {
            guild_id: self.guild_id.clone(),
            user_id: self.user_id,
            session_id: voice.session_id,
            token: voice.token,
            endpoint: voice.endpoint,
        };
        let handle = self.deps.connector.connect(
            request,
            events_tx,
            self.shared.counters.clone(),
            self.shared.ping.clone(),
        );
        self.link = Some(VoiceLink {
            handle,
            events: events_rx,
            speaking: false,
        });
        self.set_connection(ConnectionStatus::Connecting { resume: false });
    }

    async fn handle_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Connecting { resume } => {
                self.set_connection(ConnectionStatus::Connecting { resume });
            }
            GatewayEvent::Ready { ssrc, mode } => {
                debug!("[{}] voice ready, ssrc {} mode {}", self.guild_id, ssrc, mode);
            }
            GatewayEvent::SessionReady { transport } => {
                *self.sink.lock().await = Some(transport);
                // a fresh transport announces speaking from scratch
                if let Some(link) = self.link.as_mut() {
                    link.speaking = false;
                }
                self.set_connection(ConnectionStatus::Connected);
            }
            GatewayEvent::Resumed => self.set_connection(ConnectionStatus::Connected),
            GatewayEvent::SpeakingStarted {
                user_id,
                ssrc,
                stream,
            } => {
                debug!(
                    "[{}] user {:?} started speaking on ssrc {}",
                    self.guild_id, user_id, ssrc
                );
                self.shared.speakers.lock().insert(
                    ssrc,
                    SpeakerStream {
                        ssrc,
                        user_id,
                        frames: stream,
                    },
                );
            }
            GatewayEvent::SpeakerLeft { user_id } => {
                debug!("[{}] user {:?} left the channel", self.guild_id, user_id);
                self.shared
                    .speakers
                    .lock()
                    .retain(|_, s| s.user_id != Some(user_id));
            }
            GatewayEvent::Closed {
                code,
                reason,
                by_remote,
                action,
            } => {
                info!(
                    "[{}] voice socket closed ({} {}), next: {:?}",
                    self.guild_id, code, reason, action
                );
                self.emit_event(RenodeEvent::WebSocketClosed {
                    guild_id: self.guild_id.clone(),
                    code,
                    reason,
                    by_remote,
                });
            }
            GatewayEvent::Disconnected { code, reason } => {
                warn!("[{}] voice disconnected ({} {})", self.guild_id, code, reason);
                self.drop_link();
                *self.sink.lock().await = None;
                self.set_connection(ConnectionStatus::Disconnected);
            }
        }
    }

    fn set_connection(&mut self, next: ConnectionStatus) {
        let previous = self.connection;
        if previous == next {
            return;
        }
        self.connection = next;
        let _ = self.events.send(PlayerEvent::Connection {
            guild_id: self.guild_id.clone(),
            from: previous,
            to: next,
        });

        match cross_transition(previous, next, &self.machine) {
            Some((PlaybackStatus::Idle, reason)) => {
                self.end_track(reason);
            }
            Some((to, reason)) => {
                self.set_status(to, reason);
            }
            None => {}
        }
        self.sync_pacing();
    }

    fn push_player_update(&self) {
        if self.track.is_none() && !self.connection.is_connected() {
            return;
        }
        let state = self.snapshot.borrow().player_state(&self.shared);
        let _ = self.events.send(PlayerEvent::Message(OutgoingMessage::PlayerUpdate {
            guild_id: self.guild_id.clone(),
            state,
        }));
    }

    fn emit_event(&self, event: RenodeEvent) {
        let _ = self.events.send(PlayerEvent::Message(OutgoingMessage::Event { event }));
    }

    fn publish(&self) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.track = self.track.clone();
            snapshot.volume = self.volume.get();
            snapshot.status = self.machine.status();
            snapshot.reason = self.machine.reason();
            snapshot.connection = self.connection;
            snapshot.voice = self.voice.clone();
        });
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.shared.speakers.lock().clear();
    }

    /// Releases pipelines and the voice session before the actor exits.
    async fn shutdown(&mut self) {
        self.end_track(PlaybackReason::Destroyed);
        self.drop_link();
        *self.sink.lock().await = None;
        self.set_connection(ConnectionStatus::Disconnected);
        self.publish();
        debug!("[{}] player destroyed", self.guild_id);
    }
}

async fn next_gateway_event(link: &mut Option<VoiceLink>) -> Option<GatewayEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves the stream of `info` and waits until its pipeline yields a first frame.
async fn prime_source(
    deps: &PlayerDeps,
    info: &TrackInfo,
    start_ms: u64,
    volume: VolumeHandle,
    cancel: CancellationToken,
) -> Result<Box<dyn FrameSource>, PlayerError> {
    let timeout_ms = deps.config.seek_timeout_ms;
    let work = async {
        let locator = deps
            .sources
            .resolve(info)
            .await
            .map_err(|e| PlayerError::Resolve(e.to_string()))?;
        let mut source = deps
            .pipelines
            .open(&locator, start_ms, volume)
            .map_err(|e| PlayerError::Pipeline(e.to_string()))?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), source.wait_ready()).await {
            Err(_) => Err(PlayerError::Timeout(timeout_ms)),
            Ok(Err(e)) => Err(PlayerError::Pipeline(e.to_string())),
            Ok(Ok(())) => Ok(source),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(PlayerError::Cancelled),
        result = work => result,
    }
}
