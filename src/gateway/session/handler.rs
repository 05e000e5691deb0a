use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    LinkState, SessionContext,
    heartbeat::{ack_latency, spawn_heartbeat},
    types::{GatewayError, GatewayEvent, SessionOutcome, VoiceGatewayMessage, op},
};
use crate::{
    common::types::{UserId, now_ms},
    gateway::{
        crypto::{CipherMode, KEY_SIZE, PacketCipher},
        udp_link::{CipherContext, UdpBackend, discover_ip, receive_loop},
    },
};

/// Per-connection message handling. Anything that must survive a reconnect
/// lives in [`LinkState`].
pub(crate) struct SessionState<'a> {
    ctx: &'a SessionContext,
    link: &'a mut LinkState,
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    heartbeat_handle: Option<tokio::task::JoinHandle<()>>,
    last_heartbeat: Arc<AtomicU64>,
    /// Set once the server answered our identify or resume.
    pub handshake_done: bool,
}

impl<'a> SessionState<'a> {
    pub fn new(
        ctx: &'a SessionContext,
        link: &'a mut LinkState,
        tx: tokio::sync::mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            ctx,
            link,
            tx,
            heartbeat_handle: None,
            last_heartbeat: Arc::new(AtomicU64::new(0)),
            handshake_done: false,
        }
    }

    pub async fn handle_text(&mut self, text: &str) -> Option<SessionOutcome> {
        let msg: VoiceGatewayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "[{}] Failed to parse voice gateway message: {} - Text: {}",
                    self.ctx.request.guild_id, e, text
                );
                return None;
            }
        };

        if let Some(seq) = msg.seq {
            self.link.seq_ack.store(seq, Ordering::Relaxed);
        }

        match msg.op {
            op::HELLO => self.handle_hello(&msg.d),
            op::READY => self.handle_ready(&msg.d).await,
            op::SESSION_DESCRIPTION => self.handle_session_description(&msg.d),
            op::HEARTBEAT_ACK => self.handle_heartbeat_ack(&msg.d),
            op::RESUMED => self.handle_resumed(),
            op::SPEAKING => self.handle_speaking(&msg.d),
            op::CLIENT_DISCONNECT => self.handle_client_disconnect(&msg.d),
            _ => {
                debug!(
                    "[{}] Received voice op {}: {:?}",
                    self.ctx.request.guild_id, msg.op, msg.d
                );
                None
            }
        }
    }

    fn handle_hello(&mut self, d: &Value) -> Option<SessionOutcome> {
        let interval = d["heartbeat_interval"]
            .as_f64()
            .map(|ms| ms as u64)
            .filter(|ms| *ms > 0)
            .unwrap_or(30_000);
        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }

        debug!(
            "[{}] Heartbeat interval set to {}ms",
            self.ctx.request.guild_id, interval
        );
        self.heartbeat_handle = Some(spawn_heartbeat(
            self.tx.clone(),
            self.link.seq_ack.clone(),
            self.last_heartbeat.clone(),
            interval,
        ));
        None
    }

    async fn handle_ready(&mut self, d: &Value) -> Option<SessionOutcome> {
        self.handshake_done = true;
        match self.prepare_transport(d).await {
            Ok(()) => None,
            Err(e) => {
                warn!("[{}] {}", self.ctx.request.guild_id, e);
                Some(SessionOutcome::Close {
                    code: e.close_code(),
                    reason: e.to_string(),
                    by_remote: false,
                    action: super::types::CloseAction::Terminal,
                })
            }
        }
    }

    async fn prepare_transport(&mut self, d: &Value) -> Result<(), GatewayError> {
        let (ssrc, remote) = parse_ready(d)?;
        let (ip, port) = (remote.ip(), remote.port());

        let offered: Vec<String> = d["modes"]
            .as_array()
            .map(|modes| {
                modes
                    .iter()
                    .filter_map(|m| m.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let mode = CipherMode::negotiate(&self.ctx.settings.cipher_modes, &offered)
            .ok_or_else(|| GatewayError::NoCipherMode(offered.clone()))?;

        debug!(
            "[{}] Ready! IP: {}, Port: {}, SSRC: {}, Mode: {}",
            self.ctx.request.guild_id, ip, port, ssrc, mode
        );

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| GatewayError::Discovery(e.to_string()))?;
        let (my_ip, my_port) =
            discover_ip(&socket, remote, ssrc, self.ctx.settings.discovery_timeout)
                .await
                .map_err(|e| GatewayError::Discovery(e.to_string()))?;

        self.send_json(
            op::SELECT_PROTOCOL,
            serde_json::json!({
                "protocol": "udp",
                "data": { "address": my_ip, "port": my_port, "mode": mode.name() }
            }),
        );

        self.link.stop_receiving();
        self.link.socket = Some(Arc::new(socket));
        self.link.remote = Some(remote);
        self.link.ssrc = Some(ssrc);
        self.link.mode = Some(mode);

        self.ctx.emit(GatewayEvent::Ready { ssrc, mode });
        Ok(())
    }

    fn handle_session_description(&mut self, d: &Value) -> Option<SessionOutcome> {
        let guild_id = &self.ctx.request.guild_id;
        let (Some(socket), Some(remote), Some(ssrc)) =
            (self.link.socket.clone(), self.link.remote, self.link.ssrc)
        else {
            warn!("[{}] Session description before ready, ignoring", guild_id);
            return None;
        };

        let Some(mode) = d["mode"]
            .as_str()
            .and_then(CipherMode::from_name)
            .or(self.link.mode)
        else {
            warn!("[{}] Session description with unknown mode: {}", guild_id, d["mode"]);
            return None;
        };

        let key: Option<Vec<u8>> = d["secret_key"].as_array().and_then(|ka| {
            ka.iter()
                .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect()
        });
        let cipher = match key
            .filter(|k| k.len() == KEY_SIZE)
            .map(|k| PacketCipher::new(mode, &k))
        {
            Some(Ok(cipher)) => cipher,
            _ => {
                warn!(
                    "[{}] Missing or invalid secret_key in session description",
                    guild_id
                );
                return None;
            }
        };

        info!("[{}] Voice session ready (mode {})", guild_id, mode);
        self.link.mode = Some(mode);

        let context = CipherContext::new(cipher.clone(), ssrc, self.ctx.settings.timestamp_modulus);
        let transport = UdpBackend::new(socket.clone(), remote, context, self.ctx.counters.clone());
        self.ctx.emit(GatewayEvent::SessionReady {
            transport: Box::new(transport),
        });

        self.link.inbound.lock().set_cipher(cipher);
        self.link.stop_receiving();
        let cancel = CancellationToken::new();
        tokio::spawn(receive_loop(socket, self.link.inbound.clone(), cancel.clone()));
        self.link.receive_cancel = Some(cancel);

        if self.link.speaking {
            self.send_speaking(true);
        }
        None
    }

    fn handle_heartbeat_ack(&self, d: &Value) -> Option<SessionOutcome> {
        let echoed = d["t"].as_u64().or_else(|| d.as_u64());
        if let Some(latency) = ack_latency(echoed, self.last_heartbeat.load(Ordering::Relaxed), now_ms()) {
            self.ctx.ping.store(latency, Ordering::Relaxed);
        }
        None
    }

    fn handle_resumed(&mut self) -> Option<SessionOutcome> {
        info!(
            "[{}] Voice session resumed successfully",
            self.ctx.request.guild_id
        );
        self.handshake_done = true;
        self.ctx.emit(GatewayEvent::Resumed);
        None
    }

    fn handle_speaking(&mut self, d: &Value) -> Option<SessionOutcome> {
        let Some(ssrc) = parse_ssrc(&d["ssrc"]) else {
            warn!(
                "[{}] Speaking event without a valid ssrc: {}",
                self.ctx.request.guild_id, d["ssrc"]
            );
            return None;
        };
        if Some(ssrc) == self.link.ssrc {
            return None;
        }
        let user_id = parse_user_id(&d["user_id"]);

        let stream = {
            let mut inbound = self.link.inbound.lock();
            if inbound.is_registered(ssrc) {
                return None;
            }
            inbound.register(ssrc, user_id)
        };
        debug!(
            "[{}] Opened inbound stream for ssrc {} (user {:?})",
            self.ctx.request.guild_id, ssrc, user_id
        );
        self.ctx.emit(GatewayEvent::SpeakingStarted {
            user_id,
            ssrc,
            stream,
        });
        None
    }

    fn handle_client_disconnect(&mut self, d: &Value) -> Option<SessionOutcome> {
        if let Some(user_id) = parse_user_id(&d["user_id"]) {
            self.link.inbound.lock().remove_user(user_id);
            self.ctx.emit(GatewayEvent::SpeakerLeft { user_id });
        }
        None
    }

    /// Records the desired speaking flag and tells the server once a transport exists.
    pub fn set_speaking(&mut self, speaking: bool) {
        self.link.speaking = speaking;
        if self.link.receive_cancel.is_some() {
            self.send_speaking(speaking);
        }
    }

    fn send_speaking(&self, speaking: bool) {
        let Some(ssrc) = self.link.ssrc else {
            return;
        };
        self.send_json(
            op::SPEAKING,
            serde_json::json!({"speaking": u8::from(speaking), "delay": 0, "ssrc": ssrc}),
        );
    }

    pub fn send_json(&self, op: u8, d: Value) {
        let msg = VoiceGatewayMessage { op, d, seq: None };
        if let Ok(json) = serde_json::to_string(&msg) {
            let _ = self.tx.send(Message::Text(json.into()));
        }
    }
}

impl Drop for SessionState<'_> {
    fn drop(&mut self) {
        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }
    }
}

fn parse_ssrc(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|v| u32::try_from(v).ok())
}

/// Extracts the ssrc and the voice server address from a ready payload.
fn parse_ready(d: &Value) -> Result<(u32, SocketAddr), GatewayError> {
    let ssrc = parse_ssrc(&d["ssrc"]).ok_or(GatewayError::Malformed("ssrc"))?;
    let port = d["port"]
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or(GatewayError::Malformed("port"))?;
    let ip = d["ip"].as_str().ok_or(GatewayError::Malformed("ip"))?;
    let remote = format!("{}:{}", ip, port)
        .parse()
        .map_err(|_| GatewayError::Address(format!("{}:{}", ip, port)))?;
    Ok((ssrc, remote))
}

fn parse_user_id(value: &Value) -> Option<UserId> {
    value
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| value.as_u64())
        .map(UserId)
}
