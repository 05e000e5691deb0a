//! Voice gateway session: identify/resume handshake, heartbeats, transport
//! handoff and the close-code reconnect policy.

use futures::{SinkExt, StreamExt};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::{
    constants::WRITE_TASK_SHUTDOWN_MS,
    crypto::CipherMode,
    udp_link::{FrameCounters, SharedInbound},
};

pub mod connector;
pub mod handler;
pub mod heartbeat;
pub mod types;

pub use connector::{GatewayConnector, VoiceConnector, VoiceSessionHandle};
pub use types::{
    CloseAction, GatewayError, GatewayEvent, GatewaySettings, VoiceCommand, VoiceRequest,
    classify_close, gateway_url,
};

use self::{
    handler::SessionState,
    types::{SessionOutcome, VoiceGatewayMessage, op},
};

/// Read-only inputs shared by every connection of one session.
pub(crate) struct SessionContext {
    pub request: VoiceRequest,
    pub settings: GatewaySettings,
    pub events: mpsc::UnboundedSender<GatewayEvent>,
    pub counters: Arc<FrameCounters>,
    pub ping: Arc<AtomicI64>,
}

impl SessionContext {
    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }
}

/// Transport state that outlives a single WS connection.
pub(crate) struct LinkState {
    pub socket: Option<Arc<UdpSocket>>,
    pub remote: Option<SocketAddr>,
    pub ssrc: Option<u32>,
    pub mode: Option<CipherMode>,
    pub inbound: SharedInbound,
    pub receive_cancel: Option<CancellationToken>,
    pub speaking: bool,
    pub seq_ack: Arc<AtomicI64>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            socket: None,
            remote: None,
            ssrc: None,
            mode: None,
            inbound: SharedInbound::default(),
            receive_cancel: None,
            speaking: false,
            seq_ack: Arc::new(AtomicI64::new(-1)),
        }
    }

    pub fn stop_receiving(&mut self) {
        if let Some(cancel) = self.receive_cancel.take() {
            cancel.cancel();
        }
    }

    /// Forgets everything negotiated; used before a fresh identify.
    fn reset(&mut self) {
        self.stop_receiving();
        self.inbound.lock().clear();
        self.socket = None;
        self.remote = None;
        self.ssrc = None;
        self.mode = None;
        self.seq_ack.store(-1, Ordering::Relaxed);
    }
}

impl Drop for LinkState {
    fn drop(&mut self) {
        self.stop_receiving();
    }
}

pub struct VoiceGateway {
    ctx: SessionContext,
    commands: mpsc::UnboundedReceiver<VoiceCommand>,
    cancel_token: CancellationToken,
}

impl VoiceGateway {
    pub fn new(
        request: VoiceRequest,
        settings: GatewaySettings,
        events: mpsc::UnboundedSender<GatewayEvent>,
        commands: mpsc::UnboundedReceiver<VoiceCommand>,
        counters: Arc<FrameCounters>,
        ping: Arc<AtomicI64>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            ctx: SessionContext {
                request,
                settings,
                events,
                counters,
                ping,
            },
            commands,
            cancel_token,
        }
    }

    /// Runs connections until a terminal close or cancellation.
    ///
    /// Transient closes get exactly one immediate reconnect each; there is no
    /// backoff because the voice server enforces its own.
    pub async fn run(mut self) {
        let mut link = LinkState::new();
        let mut resume = false;
        let guild_id = self.ctx.request.guild_id.clone();

        loop {
            if self.cancel_token.is_cancelled() {
                return;
            }
            self.ctx.emit(GatewayEvent::Connecting { resume });

            let outcome = connect(
                &self.ctx,
                &mut self.commands,
                &self.cancel_token,
                &mut link,
                resume,
            )
            .await;

            let SessionOutcome::Close {
                code,
                reason,
                by_remote,
                action,
            } = outcome
            else {
                debug!("[{}] Gateway shutting down cleanly", guild_id);
                return;
            };

            if self.cancel_token.is_cancelled() {
                return;
            }

            self.ctx.emit(GatewayEvent::Closed {
                code,
                reason: reason.clone(),
                by_remote,
                action,
            });

            match action {
                CloseAction::Resume => {
                    debug!("[{}] Reconnecting (resume=true)", guild_id);
                    resume = true;
                }
                CloseAction::Identify => {
                    debug!("[{}] Session invalid; identifying fresh", guild_id);
                    link.reset();
                    resume = false;
                }
                CloseAction::Terminal => {
                    info!(
                        "[{}] Voice session ended: code={}, reason='{}'",
                        guild_id, code, reason
                    );
                    self.ctx.emit(GatewayEvent::Disconnected { code, reason });
                    return;
                }
            }
        }
    }
}

async fn connect(
    ctx: &SessionContext,
    commands: &mut mpsc::UnboundedReceiver<VoiceCommand>,
    cancel: &CancellationToken,
    link: &mut LinkState,
    resume: bool,
) -> SessionOutcome {
    let guild_id = ctx.request.guild_id.clone();
    let url = gateway_url(&ctx.request.endpoint, ctx.settings.version);
    debug!("[{}] Connecting to voice gateway: {}", guild_id, url);

    let ws_stream = tokio::select! {
        _ = cancel.cancelled() => return SessionOutcome::Shutdown,
        res = tokio_tungstenite::connect_async(&url) => match res {
            Ok((ws, _)) => ws,
            Err(e) => {
                let error = GatewayError::Connect(e.to_string());
                warn!("[{}] {}", guild_id, error);
                return SessionOutcome::Close {
                    code: error.close_code(),
                    reason: error.to_string(),
                    by_remote: false,
                    action: CloseAction::Terminal,
                };
            }
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let hello = if resume {
        resume_message(&ctx.request, link.seq_ack.load(Ordering::Relaxed))
    } else {
        identify_message(&ctx.request)
    };
    if let Ok(json) = serde_json::to_string(&hello) {
        let _ = tx.send(Message::Text(json.into()));
    }

    let write_cancel = cancel.child_token();
    let write_task = {
        let write_cancel = write_cancel.clone();
        let guild_id = guild_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(msg).await {
                            warn!("[{}] WS write error: {}", guild_id, e);
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        })
    };

    let mut state = SessionState::new(ctx, link, tx.clone());

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break SessionOutcome::Shutdown;
            }
            command = commands.recv() => match command {
                Some(VoiceCommand::Speaking(speaking)) => state.set_speaking(speaking),
                None => break SessionOutcome::Shutdown,
            },
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("[{}] WS read error: {}", guild_id, e);
                        break SessionOutcome::Close {
                            code: 1006,
                            reason: format!("IO error: {}", e),
                            by_remote: true,
                            action: CloseAction::Resume,
                        };
                    }
                    None => {
                        debug!("[{}] WS stream ended", guild_id);
                        break SessionOutcome::Close {
                            code: 1006,
                            reason: "Stream ended".into(),
                            by_remote: true,
                            action: CloseAction::Resume,
                        };
                    }
                };

                match msg {
                    Message::Text(text) => {
                        // ready runs IP discovery, which must not outlive a cancel
                        let handled = tokio::select! {
                            _ = cancel.cancelled() => Some(SessionOutcome::Shutdown),
                            outcome = state.handle_text(text.as_str()) => outcome,
                        };
                        if let Some(outcome) = handled {
                            break outcome;
                        }
                    }
                    Message::Close(frame) => {
                        let (code, reason) = frame
                            .map(|cf| (cf.code.into(), cf.reason.to_string()))
                            .unwrap_or((1000u16, "No reason".into()));

                        info!(
                            "[{}] WS closed: code={}, reason='{}'",
                            guild_id, code, reason
                        );
                        break SessionOutcome::Close {
                            code,
                            reason,
                            by_remote: true,
                            action: classify_close(code),
                        };
                    }
                    _ => {}
                }
            }
        }
    };

    let handshake_done = state.handshake_done;
    drop(state);
    drop(tx);
    let _ = tokio::time::timeout(
        std::time::Duration::from_millis(WRITE_TASK_SHUTDOWN_MS),
        write_task,
    )
    .await;
    write_cancel.cancel();

    match outcome {
        SessionOutcome::Close {
            code,
            reason,
            by_remote,
            action: CloseAction::Resume,
        } if resume && !handshake_done => {
            warn!("[{}] Resume handshake failed ({})", guild_id, code);
            SessionOutcome::Close {
                code,
                reason,
                by_remote,
                action: CloseAction::Terminal,
            }
        }
        other => other,
    }
}

fn identify_message(request: &VoiceRequest) -> VoiceGatewayMessage {
    VoiceGatewayMessage {
        op: op::IDENTIFY,
        d: serde_json::json!({
            "server_id": request.guild_id,
            "user_id": request.user_id.to_string(),
            "session_id": request.session_id,
            "token": request.token,
        }),
        seq: None,
    }
}

fn resume_message(request: &VoiceRequest, seq_ack: i64) -> VoiceGatewayMessage {
    VoiceGatewayMessage {
        op: op::RESUME,
        d: serde_json::json!({
            "server_id": request.guild_id,
            "session_id": request.session_id,
            "token": request.token,
            "seq_ack": seq_ack,
        }),
        seq: None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{
        WebSocketStream, accept_async,
        tungstenite::protocol::{CloseFrame, frame::coding::CloseCode},
    };

    use super::*;
    use crate::{
        common::types::{GuildId, UserId},
        gateway::{
            crypto::PacketCipher,
            udp_link::{PacketSink, parse_discovery_response},
        },
    };

    type ServerWs = WebSocketStream<TcpStream>;

    const SSRC: u32 = 4242;
    const KEY: [u8; 32] = [9; 32];

    /// Voice server stand-in: a WS listener plus a UDP socket that answers
    /// IP discovery and collects everything else.
    struct FakeVoiceServer {
        listener: TcpListener,
        udp_port: u16,
        rtp: flume::Receiver<Vec<u8>>,
    }

    impl FakeVoiceServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let udp_port = udp.local_addr().unwrap().port();
            let (tx, rx) = flume::unbounded();

            tokio::spawn(async move {
                let mut buf = [0u8; 1500];
                loop {
                    let Ok((n, from)) = udp.recv_from(&mut buf).await else {
                        break;
                    };
                    if n == 74 && buf[..2] == [0, 1] {
                        let mut resp = [0u8; 74];
                        resp[..2].copy_from_slice(&[0, 2]);
                        resp[2..4].copy_from_slice(&70u16.to_be_bytes());
                        resp[4..8].copy_from_slice(&buf[4..8]);
                        let ip = from.ip().to_string();
                        resp[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
                        resp[72..].copy_from_slice(&from.port().to_be_bytes());
                        assert!(parse_discovery_response(&resp).is_some());
                        let _ = udp.send_to(&resp, from).await;
                    } else {
                        let _ = tx.send(buf[..n].to_vec());
                    }
                }
            });

            Self {
                listener,
                udp_port,
                rtp: rx,
            }
        }

        fn endpoint(&self) -> String {
            format!("ws://{}", self.listener.local_addr().unwrap())
        }

        async fn accept(&self) -> ServerWs {
            let (stream, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
                .await
                .unwrap()
                .unwrap();
            accept_async(stream).await.unwrap()
        }

        async fn next_sequence(&self) -> u16 {
            let packet = tokio::time::timeout(Duration::from_secs(5), self.rtp.recv_async())
                .await
                .unwrap()
                .unwrap();
            let cipher = PacketCipher::new(CipherMode::Lite, &KEY).unwrap();
            assert_eq!(cipher.open(&packet).unwrap(), b"frame");
            u16::from_be_bytes([packet[2], packet[3]])
        }
    }

    async fn send(ws: &mut ServerWs, op: u8, d: Value) {
        let text = json!({ "op": op, "d": d }).to_string();
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn close(ws: &mut ServerWs, code: u16) {
        ws.close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "test".into(),
        }))
        .await
        .unwrap();
    }

    /// Waits for the next client message with `op`, skipping heartbeats and the like.
    async fn expect_op(ws: &mut ServerWs, op: u8) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["op"] == op {
                    return value["d"].clone();
                }
            }
        }
    }

    async fn handshake(ws: &mut ServerWs, udp_port: u16) {
        send(ws, op::HELLO, json!({ "heartbeat_interval": 30000.0 })).await;
        send(
            ws,
            op::READY,
            json!({
                "ssrc": SSRC,
                "ip": "127.0.0.1",
                "port": udp_port,
                "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_lite"]
            }),
        )
        .await;
        let select = expect_op(ws, op::SELECT_PROTOCOL).await;
        assert_eq!(select["protocol"], "udp");
        assert_eq!(select["data"]["mode"], "xsalsa20_poly1305_lite");
        assert_eq!(select["data"]["address"], "127.0.0.1");
        send(
            ws,
            op::SESSION_DESCRIPTION,
            json!({ "mode": "xsalsa20_poly1305_lite", "secret_key": KEY }),
        )
        .await;
    }

    fn start_gateway(endpoint: String) -> (VoiceSessionHandle, mpsc::UnboundedReceiver<GatewayEvent>) {
        let settings = GatewaySettings {
            version: 8,
            cipher_modes: CipherMode::ALL.to_vec(),
            discovery_timeout: Duration::from_secs(2),
            timestamp_modulus: 1 << 32,
        };
        let request = VoiceRequest {
            guild_id: GuildId("1".into()),
            user_id: UserId(2),
            session_id: "voice-session".into(),
            token: "voice-token".into(),
            endpoint,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let handle =
            GatewayConnector::new(settings).connect(
            request,
            tx,
            Arc::new(FrameCounters::default()),
            Arc::new(std::sync::atomic::AtomicI64::new(-1)),
        );
        (handle, rx)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> GatewayEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_transport(events: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> Box<dyn PacketSink> {
        loop {
            if let GatewayEvent::SessionReady { transport } = next_event(events).await {
                return transport;
            }
        }
    }

    async fn wait_closed(events: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> (u16, CloseAction) {
        loop {
            if let GatewayEvent::Closed { code, action, .. } = next_event(events).await {
                return (code, action);
            }
        }
    }

    #[tokio::test]
    async fn transient_close_resumes_and_new_description_resets_counters() {
        let server = FakeVoiceServer::start().await;
        let (handle, mut events) = start_gateway(server.endpoint());

        let mut ws = server.accept().await;
        let identify = expect_op(&mut ws, op::IDENTIFY).await;
        assert_eq!(identify["server_id"], "1");
        assert_eq!(identify["user_id"], "2");
        assert_eq!(identify["session_id"], "voice-session");
        assert_eq!(identify["token"], "voice-token");
        handshake(&mut ws, server.udp_port).await;

        let mut first = wait_transport(&mut events).await;
        for _ in 0..3 {
            first.send_frame(b"frame").await;
        }
        for expected in 0..3 {
            assert_eq!(server.next_sequence().await, expected);
        }

        close(&mut ws, 4015).await;
        assert_eq!(wait_closed(&mut events).await, (4015, CloseAction::Resume));

        // the close alone does not touch the counters
        first.send_frame(b"frame").await;
        assert_eq!(server.next_sequence().await, 3);

        let mut ws = server.accept().await;
        let resume = expect_op(&mut ws, op::RESUME).await;
        assert_eq!(resume["server_id"], "1");
        assert_eq!(resume["session_id"], "voice-session");
        assert_eq!(resume["token"], "voice-token");
        send(&mut ws, op::RESUMED, Value::Null).await;
        loop {
            if matches!(next_event(&mut events).await, GatewayEvent::Resumed) {
                break;
            }
        }

        handshake(&mut ws, server.udp_port).await;
        let mut second = wait_transport(&mut events).await;
        second.send_frame(b"frame").await;
        assert_eq!(server.next_sequence().await, 0);

        drop(handle);
    }

    #[tokio::test]
    async fn terminal_close_disconnects_without_retry() {
        let server = FakeVoiceServer::start().await;
        let (_handle, mut events) = start_gateway(server.endpoint());

        let mut ws = server.accept().await;
        expect_op(&mut ws, op::IDENTIFY).await;
        close(&mut ws, 4014).await;

        assert_eq!(wait_closed(&mut events).await, (4014, CloseAction::Terminal));
        match next_event(&mut events).await {
            GatewayEvent::Disconnected { code, .. } => assert_eq!(code, 4014),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(300), server.listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cancel_interrupts_ip_discovery() {
        let server = FakeVoiceServer::start().await;
        // never answers discovery
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let settings = GatewaySettings {
            version: 8,
            cipher_modes: CipherMode::ALL.to_vec(),
            discovery_timeout: Duration::from_secs(30),
            timestamp_modulus: 1 << 32,
        };
        let request = VoiceRequest {
            guild_id: GuildId("1".into()),
            user_id: UserId(2),
            session_id: "voice-session".into(),
            token: "voice-token".into(),
            endpoint: server.endpoint(),
        };
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            VoiceGateway::new(
                request,
                settings,
                events_tx,
                commands_rx,
                Arc::new(FrameCounters::default()),
                Arc::new(std::sync::atomic::AtomicI64::new(-1)),
                cancel.clone(),
            )
            .run(),
        );

        let mut ws = server.accept().await;
        expect_op(&mut ws, op::IDENTIFY).await;
        send(&mut ws, op::HELLO, json!({ "heartbeat_interval": 30000.0 })).await;
        send(
            &mut ws,
            op::READY,
            json!({
                "ssrc": SSRC,
                "ip": "127.0.0.1",
                "port": silent.local_addr().unwrap().port(),
                "modes": ["xsalsa20_poly1305_lite"]
            }),
        )
        .await;

        let mut buf = [0u8; 128];
        let n = tokio::time::timeout(Duration::from_secs(5), silent.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 74);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("gateway still waiting on discovery")
            .unwrap();
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, GatewayEvent::Closed { .. } | GatewayEvent::Disconnected { .. }),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn failed_resume_handshake_is_terminal() {
        let server = FakeVoiceServer::start().await;
        let (_handle, mut events) = start_gateway(server.endpoint());

        let mut ws = server.accept().await;
        expect_op(&mut ws, op::IDENTIFY).await;
        close(&mut ws, 4009).await;
        assert_eq!(wait_closed(&mut events).await, (4009, CloseAction::Resume));

        let mut ws = server.accept().await;
        expect_op(&mut ws, op::RESUME).await;
        close(&mut ws, 4015).await;

        assert_eq!(wait_closed(&mut events).await, (4015, CloseAction::Terminal));
        assert!(matches!(
            next_event(&mut events).await,
            GatewayEvent::Disconnected { code: 4015, .. }
        ));
    }

    #[tokio::test]
    async fn speaking_flows_both_ways_and_garbage_is_ignored() {
        let server = FakeVoiceServer::start().await;
        let (handle, mut events) = start_gateway(server.endpoint());

        let mut ws = server.accept().await;
        expect_op(&mut ws, op::IDENTIFY).await;
        ws.send(Message::Text("definitely not json".into()))
            .await
            .unwrap();
        handshake(&mut ws, server.udp_port).await;
        let _transport = wait_transport(&mut events).await;

        handle.set_speaking(true);
        let speaking = expect_op(&mut ws, op::SPEAKING).await;
        assert_eq!(speaking["speaking"], 1);
        assert_eq!(speaking["ssrc"], SSRC);

        send(
            &mut ws,
            op::SPEAKING,
            json!({ "user_id": "77", "ssrc": 99, "speaking": 1 }),
        )
        .await;
        loop {
            if let GatewayEvent::SpeakingStarted { user_id, ssrc, .. } = next_event(&mut events).await {
                assert_eq!(user_id, Some(UserId(77)));
                assert_eq!(ssrc, 99);
                break;
            }
        }
    }
}
