use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json, Response},
};

use crate::{
    common::RenodeError,
    protocol::{
        DecodeTrackQuery, EncodedTracks, LoadTracksQuery,
        tracks::{LoadResult, Track},
    },
    server::AppState,
    sources::LoadOptions,
};

/// GET /v4/loadtracks?identifier=...
pub async fn load_tracks(
    Query(params): Query<LoadTracksQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<LoadResult>, RenodeError> {
    let identifier = params
        .identifier
        .filter(|i| !i.trim().is_empty())
        .ok_or_else(|| RenodeError::bad_request("Missing identifier", "/v4/loadtracks"))?;
    tracing::info!("GET /v4/loadtracks: identifier='{}'", identifier);

    Ok(Json(
        state
            .sources
            .load(identifier.trim(), &LoadOptions::default())
            .await,
    ))
}

/// GET /v4/decodetrack?encodedTrack=...
pub async fn decode_track(Query(params): Query<DecodeTrackQuery>) -> Response {
    let encoded = params.encoded_track.or(params.track);
    tracing::info!("GET /v4/decodetrack: encodedTrack={:?}", encoded);

    let Some(encoded) = encoded else {
        return RenodeError::bad_request("No track to decode provided", "/v4/decodetrack")
            .into_response();
    };

    match Track::decode(&encoded) {
        Ok(track) => Json(track).into_response(),
        Err(e) => RenodeError::bad_request(
            format!("Invalid track encoding: {}", e),
            "/v4/decodetrack",
        )
        .into_response(),
    }
}

/// POST /v4/decodetracks
pub async fn decode_tracks(Json(body): Json<EncodedTracks>) -> Response {
    let encoded = body.into_vec();
    tracing::info!("POST /v4/decodetracks: count={}", encoded.len());

    if encoded.is_empty() {
        return RenodeError::bad_request("No tracks to decode provided", "/v4/decodetracks")
            .into_response();
    }

    let mut tracks = Vec::with_capacity(encoded.len());
    for item in &encoded {
        match Track::decode(item) {
            Ok(track) => tracks.push(track),
            Err(e) => {
                return RenodeError::bad_request(
                    format!("Invalid track encoding '{}': {}", item, e),
                    "/v4/decodetracks",
                )
                .into_response();
            }
        }
    }

    Json(tracks).into_response()
}
