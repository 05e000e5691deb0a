use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;

use super::session_or_404;
use crate::{
    common::{
        RenodeError,
        types::{GuildId, SessionId},
    },
    player::{PlayOptions, Player, PlayerError, PlayerHandle, PlayerUpdate, TrackRequest},
    protocol::{
        SessionInfo, SessionUpdate,
        tracks::{LoadResult, Track},
    },
    server::AppState,
    sources::LoadOptions,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerQuery {
    #[serde(default)]
    pub no_replace: bool,
}

/// PATCH /v4/sessions/{sessionId}/players/{guildId}
pub async fn update_player(
    Path((session_id, guild_id)): Path<(SessionId, GuildId)>,
    Query(query): Query<UpdatePlayerQuery>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PlayerUpdate>,
) -> Result<Json<Player>, RenodeError> {
    tracing::info!(
        "PATCH /v4/sessions/{}/players/{} {:?}",
        session_id,
        guild_id,
        body
    );
    let path = format!("/v4/sessions/{}/players/{}", session_id, guild_id);
    let session = session_or_404(&state, &session_id, &path)?;

    if body.track.is_some() && (body.encoded_track.is_some() || body.identifier.is_some()) {
        return Err(RenodeError::bad_request(
            "Cannot specify both 'track' and top-level 'encodedTrack'/'identifier'",
            path,
        ));
    }
    let volume = match body.volume {
        Some(v) if !(0..=1000).contains(&v) => {
            return Err(RenodeError::bad_request(
                "Volume must be between 0 and 1000",
                path,
            ));
        }
        Some(v) => Some(v as u16),
        None => None,
    };

    // decode before touching the player so a bad track changes nothing
    let mut next_track = match body.track_request() {
        None => None,
        Some(TrackRequest::Stop) => Some(None),
        Some(TrackRequest::Encoded(encoded)) => {
            let track = Track::decode(&encoded).map_err(|e| {
                RenodeError::bad_request(format!("Invalid encoded track: {}", e), path.as_str())
            })?;
            Some(Some(track))
        }
        Some(TrackRequest::Identifier(identifier)) => {
            Some(Some(resolve_identifier(&state, &identifier, &path).await?))
        }
    };
    if let (Some(Some(track)), Some(user_data)) = (
        next_track.as_mut(),
        body.track.as_ref().and_then(|t| t.user_data.clone()),
    ) {
        track.user_data = user_data;
    }

    let is_empty = next_track.is_none()
        && body.voice.is_none()
        && volume.is_none()
        && body.position.is_none()
        && body.paused.is_none();
    let player = match session.player(&guild_id) {
        Some(player) => player,
        None if is_empty => return Ok(Json(Player::idle(guild_id))),
        None => session.get_or_create_player(&guild_id).await,
    };

    if let Some(voice) = body.voice {
        player
            .update_voice(voice)
            .await
            .map_err(|e| player_error(e, &path))?;
    }
    if let Some(volume) = volume {
        player
            .set_volume(volume)
            .await
            .map_err(|e| player_error(e, &path))?;
    }

    let started = match next_track {
        Some(None) => {
            player.stop().await.map_err(|e| player_error(e, &path))?;
            false
        }
        Some(Some(track)) => {
            let options = PlayOptions {
                start_ms: body.position.unwrap_or(0),
                no_replace: query.no_replace,
                paused: body.paused.unwrap_or(false),
            };
            player
                .play(track, options)
                .await
                .map_err(|e| player_error(e, &path))?
        }
        None => false,
    };

    // a started track already took position and paused as start options
    if !started {
        apply_controls(&player, body.position, body.paused, &path).await?;
    }

    Ok(Json(player.to_player_response()))
}

async fn apply_controls(
    player: &PlayerHandle,
    position: Option<u64>,
    paused: Option<bool>,
    path: &str,
) -> Result<(), RenodeError> {
    if let Some(position) = position {
        match player.seek(position).await {
            Ok(_) | Err(PlayerError::Cancelled) => {}
            Err(e) => return Err(player_error(e, path)),
        }
    }
    match paused {
        Some(true) => {
            player.pause().await.map_err(|e| player_error(e, path))?;
        }
        Some(false) => {
            player.resume().await.map_err(|e| player_error(e, path))?;
        }
        None => {}
    }
    Ok(())
}

async fn resolve_identifier(
    state: &AppState,
    identifier: &str,
    path: &str,
) -> Result<Track, RenodeError> {
    match state.sources.load(identifier, &LoadOptions::default()).await {
        LoadResult::Track(track) => Ok(track),
        LoadResult::Error(e) => Err(RenodeError::bad_request(
            format!(
                "Failed to load identifier '{}': {}",
                identifier,
                e.message.unwrap_or(e.cause)
            ),
            path,
        )),
        _ => Err(RenodeError::bad_request(
            format!("No single track found for identifier '{}'", identifier),
            path,
        )),
    }
}

fn player_error(e: PlayerError, path: &str) -> RenodeError {
    match e {
        PlayerError::NotSeekable => RenodeError::bad_request(e.to_string(), path),
        PlayerError::Gone => RenodeError::not_found(e.to_string(), path),
        _ => RenodeError::internal(e.to_string(), path),
    }
}

/// PATCH /v4/sessions/{sessionId}
pub async fn update_session(
    Path(session_id): Path<SessionId>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionUpdate>,
) -> Result<Json<SessionInfo>, RenodeError> {
    tracing::info!("PATCH /v4/sessions/{} {:?}", session_id, body);
    let path = format!("/v4/sessions/{}", session_id);
    let session = session_or_404(&state, &session_id, &path)?;
    Ok(Json(session.configure_resuming(body.resuming, body.timeout)))
}
