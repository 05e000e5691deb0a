use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Json,
};

use super::session_or_404;
use crate::{
    common::{
        RenodeError,
        types::{GuildId, SessionId},
    },
    player::Player,
    server::AppState,
};

/// GET /v4/sessions/{sessionId}/players
pub async fn get_players(
    Path(session_id): Path<SessionId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Player>>, RenodeError> {
    tracing::info!("GET /v4/sessions/{}/players", session_id);
    let path = format!("/v4/sessions/{}/players", session_id);
    let session = session_or_404(&state, &session_id, &path)?;

    Ok(Json(
        session
            .players()
            .iter()
            .map(|p| p.to_player_response())
            .collect(),
    ))
}

/// GET /v4/sessions/{sessionId}/players/{guildId}
pub async fn get_player(
    Path((session_id, guild_id)): Path<(SessionId, GuildId)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Player>, RenodeError> {
    tracing::info!("GET /v4/sessions/{}/players/{}", session_id, guild_id);
    let path = format!("/v4/sessions/{}/players/{}", session_id, guild_id);
    let session = session_or_404(&state, &session_id, &path)?;

    Ok(Json(match session.player(&guild_id) {
        Some(player) => player.to_player_response(),
        None => Player::idle(guild_id),
    }))
}
