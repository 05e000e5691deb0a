use std::{sync::Arc, time::Instant};

use dashmap::DashMap;

use crate::{
    common::types::SessionId, configs::Config, monitoring::StatsCollector, player::PlayerDeps,
    server::Session, sources::SourceManager,
};

/// Top-level application state.
pub struct AppState {
    pub config: Config,
    pub sessions: DashMap<SessionId, Arc<Session>>,
    /// Sessions whose socket closed but which may still be resumed.
    pub resumable_sessions: DashMap<SessionId, Arc<Session>>,
    pub sources: Arc<SourceManager>,
    pub player_deps: PlayerDeps,
    pub stats: StatsCollector,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config, player_deps: PlayerDeps) -> Self {
        Self {
            sources: player_deps.sources.clone(),
            stats: StatsCollector::new(config.server.stats_interval_secs),
            config,
            sessions: DashMap::new(),
            resumable_sessions: DashMap::new(),
            player_deps,
            start_time: Instant::now(),
        }
    }

    /// Looks a session up whether or not a socket is attached to it.
    pub fn session(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .or_else(|| self.resumable_sessions.get(session_id))
            .map(|s| s.value().clone())
    }

    /// Every session, attached or waiting for a resume.
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .chain(self.resumable_sessions.iter())
            .map(|s| s.value().clone())
            .collect()
    }

    /// Destroys all players of all sessions.
    pub async fn shutdown(&self) {
        for session in self.all_sessions() {
            session.shutdown().await;
        }
        self.sessions.clear();
        self.resumable_sessions.clear();
    }
}
