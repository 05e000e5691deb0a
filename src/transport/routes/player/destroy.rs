use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
};

use super::session_or_404;
use crate::{
    common::{
        RenodeError,
        types::{GuildId, SessionId},
    },
    server::AppState,
};

/// DELETE /v4/sessions/{sessionId}/players/{guildId}
///
/// Responds once the player's pipeline and voice session are released.
pub async fn destroy_player(
    Path((session_id, guild_id)): Path<(SessionId, GuildId)>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, RenodeError> {
    tracing::info!("DELETE /v4/sessions/{}/players/{}", session_id, guild_id);
    let path = format!("/v4/sessions/{}/players/{}", session_id, guild_id);
    let session = session_or_404(&state, &session_id, &path)?;

    session.destroy_player(&guild_id).await;
    Ok(StatusCode::NO_CONTENT)
}
