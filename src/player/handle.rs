use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    common::types::{GuildId, UserId},
    gateway::FrameCounters,
    player::{
        actor::{ActorParts, PlayerActor, PlayerCommand},
        context::{PlayOptions, PlayerDeps, PlayerEvent, PlayerShared, PlayerSnapshot, SpeakerStream},
        error::PlayerError,
        state::{Player, PlayerState, VoiceState},
        status::PlaybackStatus,
    },
    protocol::tracks::Track,
};

/// Cheap, cloneable front of a player task.
#[derive(Clone)]
pub struct PlayerHandle {
    guild_id: GuildId,
    commands: mpsc::UnboundedSender<PlayerCommand>,
    snapshot: watch::Receiver<PlayerSnapshot>,
    shared: Arc<PlayerShared>,
}

impl PlayerHandle {
    /// Starts the player task for `guild_id`. Its events go to `events`.
    pub fn spawn(
        guild_id: GuildId,
        user_id: UserId,
        deps: PlayerDeps,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PlayerSnapshot::new(guild_id.clone()));
        let shared = Arc::new(PlayerShared::default());

        let actor = PlayerActor::new(ActorParts {
            guild_id: guild_id.clone(),
            user_id,
            deps,
            shared: shared.clone(),
            events,
            snapshot: snapshot_tx,
            commands: commands_rx,
        });
        let task = tokio::spawn(actor.run());

        (
            Self {
                guild_id,
                commands: commands_tx,
                snapshot: snapshot_rx,
                shared,
            },
            task,
        )
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PlayerCommand,
    ) -> Result<T, PlayerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| PlayerError::Gone)?;
        rx.await.map_err(|_| PlayerError::Gone)
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    /// Starts `track`, replacing the active one unless `no_replace` is set.
    /// Returns whether the track was accepted.
    pub async fn play(&self, track: Track, options: PlayOptions) -> Result<bool, PlayerError> {
        self.request(|reply| PlayerCommand::Play {
            track,
            options,
            reply,
        })
        .await
    }

    pub async fn stop(&self) -> Result<bool, PlayerError> {
        self.request(|reply| PlayerCommand::Stop { reply }).await
    }

    pub async fn pause(&self) -> Result<bool, PlayerError> {
        self.request(|reply| PlayerCommand::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<bool, PlayerError> {
        self.request(|reply| PlayerCommand::Resume { reply }).await
    }

    /// Returns the volume actually applied after clamping.
    pub async fn set_volume(&self, volume: u16) -> Result<u8, PlayerError> {
        self.request(|reply| PlayerCommand::SetVolume { volume, reply })
            .await
    }

    /// Resolves once the rebuilt pipeline produced audio and was swapped in.
    pub async fn seek(&self, position: u64) -> Result<bool, PlayerError> {
        self.request(|reply| PlayerCommand::Seek { position, reply })
            .await?
    }

    pub async fn update_voice(&self, voice: VoiceState) -> Result<(), PlayerError> {
        self.request(|reply| PlayerCommand::UpdateVoice { voice, reply })
            .await
    }

    /// Returns after the pipeline and the voice session are released.
    pub async fn destroy(&self) -> Result<(), PlayerError> {
        self.request(|reply| PlayerCommand::Destroy { reply }).await
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_playing(&self) -> bool {
        let snapshot = self.snapshot.borrow();
        snapshot.status == PlaybackStatus::Playing && snapshot.connection.is_connected()
    }

    pub fn state(&self) -> PlayerState {
        self.snapshot.borrow().player_state(&self.shared)
    }

    pub fn to_player_response(&self) -> Player {
        self.snapshot.borrow().to_player_response(&self.shared)
    }

    /// Inbound streams of users currently speaking in the channel.
    /// Streams whose session closed are dropped once drained.
    pub fn speakers(&self) -> Vec<SpeakerStream> {
        let mut speakers = self.shared.speakers.lock();
        speakers.retain(|_, s| !(s.frames.is_disconnected() && s.frames.is_empty()));
        speakers.values().cloned().collect()
    }

    pub fn counters(&self) -> &Arc<FrameCounters> {
        &self.shared.counters
    }
}
