use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::{
    common::types::{GuildId, SessionId, UserId},
    player::{PlayerDeps, PlayerEvent, PlayerHandle},
    protocol::{OutgoingMessage, SessionInfo},
};

/// Events kept for a resumable session while no socket is attached.
pub const MAX_QUEUED_EVENTS: usize = 1000;

/// One control-socket session and the players it owns.
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    deps: PlayerDeps,
    players: DashMap<GuildId, PlayerHandle>,
    /// Serializes creation and removal per guild.
    guild_locks: DashMap<GuildId, Arc<tokio::sync::Mutex<()>>>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    /// Sender for outgoing WS messages. Swapped on resume.
    sender: Mutex<flume::Sender<String>>,
    resumable: AtomicBool,
    resume_timeout: AtomicU64,
    /// True when the socket is gone but the session waits for a resume.
    paused: AtomicBool,
    detachments: AtomicU64,
    event_queue: Mutex<VecDeque<String>>,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        sender: flume::Sender<String>,
        deps: PlayerDeps,
        resume_timeout_secs: u64,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            session_id,
            user_id,
            deps,
            players: DashMap::new(),
            guild_locks: DashMap::new(),
            events: events_tx,
            sender: Mutex::new(sender),
            resumable: AtomicBool::new(false),
            resume_timeout: AtomicU64::new(resume_timeout_secs),
            paused: AtomicBool::new(false),
            detachments: AtomicU64::new(0),
            event_queue: Mutex::new(VecDeque::new()),
        });
        tokio::spawn(forward_player_events(Arc::downgrade(&session), events_rx));
        session
    }

    /// Sends a JSON message, or queues it while the session waits for a resume.
    pub fn send_json(&self, json: String) {
        let mut queue = self.event_queue.lock();
        if self.paused.load(Ordering::Acquire) {
            if queue.len() >= MAX_QUEUED_EVENTS {
                queue.pop_front();
            }
            queue.push_back(json);
            return;
        }
        drop(queue);
        let _ = self.sender.lock().send(json);
    }

    pub fn send_message(&self, msg: &OutgoingMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => self.send_json(json),
            Err(e) => tracing::error!("failed to serialize outgoing message: {}", e),
        }
    }

    /// Attaches a new socket and returns the events queued since the last one left.
    pub fn attach(&self, sender: flume::Sender<String>) -> Vec<String> {
        let mut queue = self.event_queue.lock();
        *self.sender.lock() = sender;
        self.paused.store(false, Ordering::Release);
        queue.drain(..).collect()
    }

    /// Starts queueing events until the next [`Self::attach`]. Returns a token
    /// for [`Self::still_detached`].
    pub fn detach(&self) -> u64 {
        let _queue = self.event_queue.lock();
        self.paused.store(true, Ordering::Release);
        self.detachments.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether no socket attached since the detach that returned `token`.
    pub fn still_detached(&self, token: u64) -> bool {
        self.paused.load(Ordering::Acquire) && self.detachments.load(Ordering::Acquire) == token
    }

    /// Whether `sender` is still the socket this session writes to.
    pub fn is_attached_to(&self, sender: &flume::Sender<String>) -> bool {
        self.sender.lock().same_channel(sender)
    }

    pub fn queued_events(&self) -> usize {
        self.event_queue.lock().len()
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable.load(Ordering::Relaxed)
    }

    pub fn resume_timeout(&self) -> u64 {
        self.resume_timeout.load(Ordering::Relaxed)
    }

    pub fn configure_resuming(&self, resuming: Option<bool>, timeout: Option<u64>) -> SessionInfo {
        if let Some(resuming) = resuming {
            self.resumable.store(resuming, Ordering::Relaxed);
        }
        if let Some(timeout) = timeout {
            self.resume_timeout.store(timeout, Ordering::Relaxed);
        }
        self.info()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            resuming: self.is_resumable(),
            timeout: self.resume_timeout(),
        }
    }

    pub fn player(&self, guild_id: &GuildId) -> Option<PlayerHandle> {
        self.players.get(guild_id).map(|p| p.value().clone())
    }

    pub fn players(&self) -> Vec<PlayerHandle> {
        self.players.iter().map(|p| p.value().clone()).collect()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    fn guild_lock(&self, guild_id: &GuildId) -> Arc<tokio::sync::Mutex<()>> {
        self.guild_locks.entry(guild_id.clone()).or_default().clone()
    }

    /// Returns the guild's player, starting one if there is none.
    pub async fn get_or_create_player(&self, guild_id: &GuildId) -> PlayerHandle {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        if let Some(player) = self.player(guild_id) {
            return player;
        }

        debug!("[{}] creating player for session {}", guild_id, self.session_id);
        let (player, _task) = PlayerHandle::spawn(
            guild_id.clone(),
            self.user_id,
            self.deps.clone(),
            self.events.clone(),
        );
        self.players.insert(guild_id.clone(), player.clone());
        player
    }

    /// Tears the player down and only then removes it, so a following create
    /// never overlaps a half-released predecessor. Returns false if there was none.
    pub async fn destroy_player(&self, guild_id: &GuildId) -> bool {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let destroyed = match self.player(guild_id) {
            Some(player) => {
                let _ = player.destroy().await;
                self.players.remove(guild_id);
                true
            }
            None => false,
        };
        // the map entry and `lock` are the only holders unless someone is waiting
        self.guild_locks.remove_if(guild_id, |_, held| {
            Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2
        });
        destroyed
    }

    /// Destroys every player of this session.
    pub async fn shutdown(&self) {
        info!("Shutting down session: {}", self.session_id);
        let guilds: Vec<GuildId> = self.players.iter().map(|p| p.key().clone()).collect();
        for guild_id in guilds {
            self.destroy_player(&guild_id).await;
        }
        self.guild_locks.clear();
    }
}

/// Relays wire messages of all players to the socket and logs state changes.
async fn forward_player_events(
    session: Weak<Session>,
    mut events: mpsc::UnboundedReceiver<PlayerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        match event {
            PlayerEvent::Message(msg) => session.send_message(&msg),
            PlayerEvent::Transition {
                guild_id,
                transition,
            } => trace!(
                "[{}] {:?} -> {:?} ({:?})",
                guild_id, transition.from, transition.to, transition.reason
            ),
            PlayerEvent::Connection { guild_id, from, to } => {
                debug!("[{}] voice connection {:?} -> {:?}", guild_id, from, to)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        audio::FfmpegPipelineFactory,
        configs::PlayerConfig,
        gateway::{GatewayConnector, GatewaySettings},
        sources::SourceManager,
    };

    pub(crate) fn test_deps() -> PlayerDeps {
        let config = PlayerConfig::default();
        PlayerDeps {
            sources: Arc::new(SourceManager::with_sources(Vec::new())),
            pipelines: Arc::new(FfmpegPipelineFactory::new(
                config.clone(),
                reqwest::Client::new(),
            )),
            connector: Arc::new(GatewayConnector::new(GatewaySettings::from(&config))),
            config,
            update_interval: Duration::from_secs(3600),
        }
    }

    fn session() -> (Arc<Session>, flume::Receiver<String>) {
        let (tx, rx) = flume::unbounded();
        let session = Session::new(SessionId::generate(), UserId(1), tx, test_deps(), 60);
        (session, rx)
    }

    #[tokio::test]
    async fn detached_sessions_queue_a_bounded_backlog() {
        let (session, rx) = session();
        session.send_json("live".into());
        assert_eq!(rx.try_recv().unwrap(), "live");

        let token = session.detach();
        assert!(session.still_detached(token));
        for i in 0..MAX_QUEUED_EVENTS + 5 {
            session.send_json(i.to_string());
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(session.queued_events(), MAX_QUEUED_EVENTS);

        let (tx, rx) = flume::unbounded();
        let queued = session.attach(tx.clone());
        assert_eq!(queued.len(), MAX_QUEUED_EVENTS);
        assert_eq!(queued[0], "5");
        assert!(session.is_attached_to(&tx));
        assert!(!session.still_detached(token));
        let again = session.detach();
        assert_ne!(again, token);
        session.attach(tx.clone());

        session.send_json("after".into());
        assert_eq!(rx.try_recv().unwrap(), "after");
    }

    #[tokio::test]
    async fn resuming_settings_are_partial_updates() {
        let (session, _rx) = session();
        let info = session.configure_resuming(Some(true), None);
        assert!(info.resuming);
        assert_eq!(info.timeout, 60);
        let info = session.configure_resuming(None, Some(5));
        assert!(info.resuming);
        assert_eq!(info.timeout, 5);
    }

    #[tokio::test]
    async fn one_player_per_guild() {
        let (session, _rx) = session();
        let guild = GuildId("10".into());

        let (a, b) = tokio::join!(
            session.get_or_create_player(&guild),
            session.get_or_create_player(&guild)
        );
        assert_eq!(a.guild_id(), b.guild_id());
        assert_eq!(session.player_count(), 1);

        assert!(session.destroy_player(&guild).await);
        assert_eq!(session.player_count(), 0);
        assert!(a.pause().await.is_err());
        assert!(!session.destroy_player(&guild).await);
        assert!(session.guild_locks.is_empty());

        for id in 0..20 {
            let guild = GuildId(id.to_string());
            session.get_or_create_player(&guild).await;
            session.destroy_player(&guild).await;
        }
        assert!(session.guild_locks.is_empty());

        session.get_or_create_player(&guild).await;
        session.shutdown().await;
        assert_eq!(session.player_count(), 0);
    }
}
