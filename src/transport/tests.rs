//! Control API round trips against a server bound to a loopback port.

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

use crate::{
    configs::Config,
    protocol::tracks::{Track, TrackInfo},
    server::{AppState, session::tests::test_deps},
    transport::{http_server::router, middleware::API_VERSION_HEADER},
};

const PASSWORD: &str = "hunter2";

async fn serve() -> (SocketAddr, Arc<AppState>) {
    let config = Config::parse(&format!("[server]\npassword = \"{PASSWORD}\"\n")).unwrap();
    let state = Arc::new(AppState::new(config, test_deps()));
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn sample_track() -> Track {
    Track::new(TrackInfo {
        identifier: "/music/a.mp3".into(),
        is_seekable: true,
        author: "Someone".into(),
        length: 180_000,
        title: "A".into(),
        source_name: "local".into(),
        ..Default::default()
    })
    .unwrap()
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, session_id: Option<&str>) -> (Socket, Value) {
    let mut request = format!("ws://{addr}/v4/websocket")
        .into_client_request()
        .unwrap();
    let headers = request.headers_mut();
    headers.insert("Authorization", PASSWORD.parse().unwrap());
    headers.insert("User-Id", "1234".parse().unwrap());
    headers.insert("Client-Name", "tests/1.0".parse().unwrap());
    if let Some(id) = session_id {
        headers.insert("Session-Id", id.parse().unwrap());
    }

    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let ready = next_json(&mut socket).await;
    (socket, ready)
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .expect("no message from server")
            .unwrap()
            .unwrap();
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn requests_need_the_password() {
    let (addr, _) = serve().await;

    let res = client()
        .get(format!("http://{addr}/version"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = client()
        .get(format!("http://{addr}/version"))
        .header("Authorization", PASSWORD)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()[API_VERSION_HEADER], "4");
    assert_eq!(res.text().await.unwrap(), env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn track_endpoints() {
    let (addr, _) = serve().await;
    let get = |path: String| {
        client()
            .get(format!("http://{addr}{path}"))
            .header("Authorization", PASSWORD)
            .send()
    };

    let res = get("/v4/loadtracks".into()).await.unwrap();
    assert_eq!(res.status(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["path"], "/v4/loadtracks");

    // no provider is registered, so nothing matches
    let body: Value = get("/v4/loadtracks?identifier=anything".into())
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["loadType"], "empty");

    let track = sample_track();
    let res = get(format!("/v4/decodetrack?encodedTrack={}", track.encoded.replace('+', "%2B")))
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["info"]["title"], "A");
    assert_eq!(body["info"]["isSeekable"], true);

    let res = get("/v4/decodetrack?encodedTrack=bm9wZQ".into()).await.unwrap();
    assert_eq!(res.status(), 400);

    let res = client()
        .post(format!("http://{addr}/v4/decodetracks"))
        .header("Authorization", PASSWORD)
        .json(&json!({ "tracks": [track.encoded] }))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body[0]["info"]["length"], 180_000);

    let body: Value = get("/v4/info".into()).await.unwrap().json().await.unwrap();
    assert_eq!(body["version"]["semver"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["sourceManagers"], json!([]));

    let body: Value = get("/v4/stats".into()).await.unwrap().json().await.unwrap();
    assert_eq!(body["players"], 0);
    assert!(body.get("frameStats").is_none());
}

#[tokio::test]
async fn unknown_sessions_are_404() {
    let (addr, _) = serve().await;
    let res = client()
        .get(format!("http://{addr}/v4/sessions/nope/players"))
        .header("Authorization", PASSWORD)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "Not Found");
}

#[tokio::test]
async fn websocket_requires_a_user_id() {
    let (addr, _) = serve().await;
    let mut request = format!("ws://{addr}/v4/websocket")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", PASSWORD.parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_err());
}

#[tokio::test]
async fn session_lifecycle() {
    let (addr, state) = serve().await;
    let (mut socket, ready) = connect(addr, None).await;
    assert_eq!(ready["op"], "ready");
    assert_eq!(ready["resumed"], false);
    let session_id = ready["sessionId"].as_str().unwrap().to_string();
    assert_eq!(session_id.len(), 16);

    socket
        .send(tungstenite::Message::Text(r#"{"op":"stats"}"#.into()))
        .await
        .unwrap();
    let stats = next_json(&mut socket).await;
    assert_eq!(stats["op"], "stats");
    assert!(stats["memory"]["used"].is_u64());

    let player_url = format!("http://{addr}/v4/sessions/{session_id}/players/99");
    let body: Value = client()
        .patch(&player_url)
        .header("Authorization", PASSWORD)
        .json(&json!({ "volume": 250 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["guildId"], "99");
    assert_eq!(body["volume"], 100);
    assert_eq!(body["track"], Value::Null);

    let res = client()
        .patch(&player_url)
        .header("Authorization", PASSWORD)
        .json(&json!({ "encodedTrack": "not a track" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);

    let players: Value = client()
        .get(format!("http://{addr}/v4/sessions/{session_id}/players"))
        .header("Authorization", PASSWORD)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(players.as_array().unwrap().len(), 1);

    let res = client()
        .delete(&player_url)
        .header("Authorization", PASSWORD)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);
    let session = state.session(&crate::common::SessionId(session_id.clone())).unwrap();
    assert_eq!(session.player_count(), 0);

    let body: Value = client()
        .patch(format!("http://{addr}/v4/sessions/{session_id}"))
        .header("Authorization", PASSWORD)
        .json(&json!({ "resuming": true, "timeout": 30 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({ "resuming": true, "timeout": 30 }));

    // a resumable session survives its socket and queues events meanwhile
    socket.close(None).await.unwrap();
    drop(socket);
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !state
            .resumable_sessions
            .contains_key(&crate::common::SessionId(session_id.clone()))
        {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    session.send_json(r#"{"op":"queued"}"#.to_string());

    let (mut socket, ready) = connect(addr, Some(&session_id)).await;
    assert_eq!(ready["resumed"], true);
    assert_eq!(ready["sessionId"], session_id.as_str());
    assert_eq!(next_json(&mut socket).await["op"], "queued");
}
