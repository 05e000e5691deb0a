use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, info, warn};

use crate::{
    common::types::{SessionId, UserId},
    protocol::{IncomingMessage, OutgoingMessage},
    server::{AppState, Session},
};

/// GET /v4/websocket. Authorization is checked by the router middleware.
pub async fn websocket_handler(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Result<Response, (StatusCode, &'static str)> {
    let user_id = headers
        .get("user-id")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|id| *id != 0)
        .map(UserId)
        .ok_or((StatusCode::BAD_REQUEST, "Missing or invalid User-Id header"))?;

    match headers.get("client-name").and_then(|h| h.to_str().ok()) {
        Some(name) => info!("Incoming connection from client: {}", name),
        None => warn!("Client connected without 'Client-Name' header"),
    }

    let client_session_id = headers
        .get("session-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| SessionId(s.to_string()));
    let resuming = client_session_id
        .as_ref()
        .is_some_and(|sid| state.resumable_sessions.contains_key(sid));

    let mut response = ws
        .on_upgrade(move |socket| handle_socket(socket, state, user_id, client_session_id))
        .into_response();
    response.headers_mut().insert(
        "Session-Resumed",
        HeaderValue::from_static(if resuming { "true" } else { "false" }),
    );
    Ok(response)
}

pub async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    user_id: UserId,
    client_session_id: Option<SessionId>,
) {
    let (tx, rx) = flume::unbounded::<String>();

    let resumed = client_session_id
        .and_then(|sid| state.resumable_sessions.remove(&sid))
        .map(|(_, session)| session);
    let (session, queued) = match resumed {
        Some(session) => {
            info!("Resuming session: {}", session.session_id);
            let queued = session.attach(tx.clone());
            (session, Some(queued))
        }
        None => {
            let session = Session::new(
                SessionId::generate(),
                user_id,
                tx.clone(),
                state.player_deps.clone(),
                state.config.server.resume_timeout_secs,
            );
            (session, None)
        }
    };
    let session_id = session.session_id.clone();
    state.sessions.insert(session_id.clone(), session.clone());
    info!(
        "WebSocket connected: session={} resumed={}",
        session_id,
        queued.is_some()
    );

    let ready = OutgoingMessage::Ready {
        resumed: queued.is_some(),
        session_id: session_id.clone(),
    };
    if !send_message(&mut socket, &ready).await {
        close_session(&state, &session, &tx).await;
        return;
    }

    if let Some(queued) = queued {
        debug!("Replaying {} queued events for {}", queued.len(), session_id);
        for json in queued {
            if socket.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        for player in session.players() {
            let update = OutgoingMessage::PlayerUpdate {
                guild_id: player.guild_id().clone(),
                state: player.state(),
            };
            send_message(&mut socket, &update).await;
        }
    }

    let period = Duration::from_secs(state.config.server.stats_interval_secs.max(1));
    let mut stats_interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stats_interval.tick() => {
                let stats = OutgoingMessage::Stats {
                    stats: state.stats.collect(&state, Some(session.as_ref())),
                };
                if !send_message(&mut socket, &stats).await {
                    break;
                }
            }
            Ok(json) = rx.recv_async() => {
                if let Err(e) = socket.send(Message::Text(json.into())).await {
                    error!("Socket send error: session={} err={}", session_id, e);
                    break;
                }
            }
            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket error: session={} err={}", session_id, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => match serde_json::from_str::<IncomingMessage>(&text) {
                        Ok(IncomingMessage::Stats) => {
                            let stats = OutgoingMessage::Stats {
                                stats: state.stats.collect(&state, Some(session.as_ref())),
                            };
                            if !send_message(&mut socket, &stats).await {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring websocket message on {}: {}", session_id, e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    close_session(&state, &session, &tx).await;
}

async fn send_message(socket: &mut WebSocket, msg: &OutgoingMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialize outgoing message: {}", e);
            return true;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

/// Parks a resumable session for its resume window, or destroys it.
async fn close_session(state: &Arc<AppState>, session: &Arc<Session>, tx: &flume::Sender<String>) {
    let session_id = session.session_id.clone();
    if !session.is_attached_to(tx) {
        info!("Session {} moved to a newer connection", session_id);
        return;
    }

    state.sessions.remove(&session_id);

    if !session.is_resumable() {
        info!("Connection closed (not resumable): {}", session_id);
        state.stats.forget(&session_id);
        session.shutdown().await;
        return;
    }

    let token = session.detach();
    if let Some(previous) = state
        .resumable_sessions
        .insert(session_id.clone(), session.clone())
        .filter(|previous| !Arc::ptr_eq(previous, session))
    {
        warn!(
            "Shutting down resumable session {} replaced by a newly disconnected one",
            previous.session_id
        );
        previous.shutdown().await;
    }

    let timeout = session.resume_timeout();
    info!(
        "Connection closed (resumable). Session {} can be resumed within {} seconds.",
        session_id, timeout
    );

    let state = state.clone();
    let session = session.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout)).await;
        if !session.still_detached(token) {
            return;
        }
        let removed = state
            .resumable_sessions
            .remove_if(&session.session_id, |_, s| Arc::ptr_eq(s, &session));
        if removed.is_some() {
            info!("Session resume timeout expired: {}", session.session_id);
            state.stats.forget(&session.session_id);
            session.shutdown().await;
        }
    });
}
