use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{common::RenodeError, server::AppState};

pub const API_VERSION_HEADER: &str = "Renode-Api-Version";

/// Runs `next` only when `Authorization` carries the configured password.
/// Websocket upgrades pass through here as well.
pub async fn check_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, RenodeError> {
    let path = req.uri().path().to_string();
    let provided = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok());

    match provided {
        Some(auth) if auth == state.config.server.password => Ok(next.run(req).await),
        Some(_) => {
            warn!("Rejected {}: invalid password", path);
            Err(RenodeError::unauthorized("Invalid password", path))
        }
        None => {
            warn!("Rejected {}: missing Authorization header", path);
            Err(RenodeError::unauthorized("Missing Authorization header", path))
        }
    }
}

/// Stamps every response with the control API version.
pub async fn add_response_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static("4"));
    response
}
