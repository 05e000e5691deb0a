use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    audio::PipelineFactory,
    common::types::{GuildId, UserId, now_ms},
    configs::PlayerConfig,
    gateway::{FrameCounters, VoiceConnector, constants::FRAME_DURATION},
    player::{
        state::{Player, PlayerState, VoiceState},
        status::{ConnectionStatus, PlaybackReason, PlaybackStatus, Transition},
    },
    protocol::{OutgoingMessage, tracks::Track},
    sources::SourceManager,
};

/// Everything a player needs from the node, shared by all players.
#[derive(Clone)]
pub struct PlayerDeps {
    pub sources: Arc<SourceManager>,
    pub pipelines: Arc<dyn PipelineFactory>,
    pub connector: Arc<dyn VoiceConnector>,
    pub config: PlayerConfig,
    /// Period of `playerUpdate` pushes.
    pub update_interval: Duration,
}

/// Decrypted opus payloads of one remote speaker.
#[derive(Debug, Clone)]
pub struct SpeakerStream {
    pub ssrc: u32,
    pub user_id: Option<UserId>,
    pub frames: flume::Receiver<Vec<u8>>,
}

/// Counters written by the player's tasks and read by handles without a round trip.
#[derive(Debug)]
pub struct PlayerShared {
    pub frames_played: Arc<AtomicU64>,
    /// Track position the current frame source started at.
    pub position_offset: AtomicU64,
    pub counters: Arc<FrameCounters>,
    pub ping: Arc<AtomicI64>,
    /// Inbound streams of the current voice session, keyed by ssrc.
    pub speakers: parking_lot::Mutex<HashMap<u32, SpeakerStream>>,
}

impl Default for PlayerShared {
    fn default() -> Self {
        Self {
            frames_played: Arc::new(AtomicU64::new(0)),
            position_offset: AtomicU64::new(0),
            counters: Arc::new(FrameCounters::default()),
            ping: Arc::new(AtomicI64::new(-1)),
            speakers: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

impl PlayerShared {
    /// Restarts position tracking at `offset_ms`.
    pub fn restart_position(&self, offset_ms: u64) {
        self.position_offset.store(offset_ms, Ordering::Relaxed);
        self.frames_played.store(0, Ordering::Relaxed);
    }

    pub fn position(&self) -> u64 {
        let played = self.frames_played.load(Ordering::Relaxed) * FRAME_DURATION.as_millis() as u64;
        self.position_offset.load(Ordering::Relaxed) + played
    }
}

/// Last published state of a player.
#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub guild_id: GuildId,
    pub track: Option<Track>,
    pub volume: u8,
    pub status: PlaybackStatus,
    pub reason: PlaybackReason,
    pub connection: ConnectionStatus,
    pub voice: VoiceState,
}

impl PlayerSnapshot {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            track: None,
            volume: 100,
            status: PlaybackStatus::Idle,
            reason: PlaybackReason::Requested,
            connection: ConnectionStatus::Disconnected,
            voice: VoiceState::default(),
        }
    }

    /// Paused on request, as opposed to held while the voice link reconnects.
    pub fn paused(&self) -> bool {
        self.status == PlaybackStatus::Paused && self.reason == PlaybackReason::Requested
    }

    pub fn player_state(&self, shared: &PlayerShared) -> PlayerState {
        let mut position = if self.track.is_some() { shared.position() } else { 0 };
        if let Some(track) = self.track.as_ref().filter(|t| t.info.length > 0) {
            position = position.min(track.info.length);
        }
        PlayerState {
            time: now_ms(),
            position,
            connected: self.connection.is_connected(),
            ping: shared.ping.load(Ordering::Relaxed),
        }
    }

    pub fn to_player_response(&self, shared: &PlayerShared) -> Player {
        Player {
            guild_id: self.guild_id.clone(),
            track: self.track.clone(),
            volume: self.volume,
            paused: self.paused(),
            state: self.player_state(shared),
            voice: self.voice.clone(),
            filters: serde_json::json!({}),
        }
    }
}

/// Extra options of a play request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayOptions {
    pub start_ms: u64,
    /// Ignore the request when a track is already active.
    pub no_replace: bool,
    pub paused: bool,
}

/// Upward notifications of a player, consumed by its owning session.
#[derive(Debug)]
pub enum PlayerEvent {
    Transition {
        guild_id: GuildId,
        transition: Transition,
    },
    Connection {
        guild_id: GuildId,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// Ready to forward to the client as is.
    Message(OutgoingMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tracks::TrackInfo;

    #[test]
    fn position_is_offset_plus_played_frames() {
        let shared = PlayerShared::default();
        shared.restart_position(10_000);
        shared.frames_played.store(50, Ordering::Relaxed);
        assert_eq!(shared.position(), 11_000);

        let mut snapshot = PlayerSnapshot::new(GuildId("1".into()));
        assert_eq!(snapshot.player_state(&shared).position, 0);

        snapshot.track = Track::new(TrackInfo {
            identifier: "x".into(),
            is_seekable: true,
            length: 10_500,
            source_name: "local".into(),
            ..Default::default()
        });
        let state = snapshot.player_state(&shared);
        assert_eq!(state.position, 10_500);
        assert!(!state.connected);
        assert_eq!(state.ping, -1);
    }

    #[test]
    fn reconnect_hold_is_not_reported_as_paused() {
        let mut snapshot = PlayerSnapshot::new(GuildId("1".into()));
        snapshot.status = PlaybackStatus::Paused;
        snapshot.reason = PlaybackReason::Reconnecting;
        assert!(!snapshot.paused());
        snapshot.reason = PlaybackReason::Requested;
        assert!(snapshot.paused());
    }
}
