use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use tokio_tungstenite::tungstenite::protocol::Message;

use crate::{
    common::types::now_ms,
    gateway::session::types::{VoiceGatewayMessage, op},
};

pub fn heartbeat_payload(nonce: u64, seq_ack: i64) -> VoiceGatewayMessage {
    VoiceGatewayMessage {
        op: op::HEARTBEAT,
        d: serde_json::json!({
            "t": nonce,
            "seq_ack": seq_ack
        }),
        seq: None,
    }
}

pub fn spawn_heartbeat(
    tx_hb: tokio::sync::mpsc::UnboundedSender<Message>,
    seq_ack: Arc<AtomicI64>,
    last_heartbeat: Arc<AtomicU64>,
    interval_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            let now = now_ms();
            last_heartbeat.store(now, Ordering::Relaxed);

            let hb = heartbeat_payload(now, seq_ack.load(Ordering::Relaxed));
            if let Ok(json) = serde_json::to_string(&hb) {
                if tx_hb.send(Message::Text(json.into())).is_err() {
                    break;
                }
            }
        }
    })
}

/// Round trip of an acknowledged heartbeat, preferring the echoed nonce.
pub fn ack_latency(echoed: Option<u64>, last_sent: u64, now: u64) -> Option<i64> {
    let sent = echoed.filter(|t| *t > 0 && *t <= now).unwrap_or(last_sent);
    (sent > 0).then(|| now.saturating_sub(sent) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_uses_echo_then_last_sent() {
        assert_eq!(ack_latency(Some(1_000), 900, 1_042), Some(42));
        assert_eq!(ack_latency(None, 1_000, 1_010), Some(10));
        assert_eq!(ack_latency(None, 0, 1_010), None);
        // a nonce from the future is not trusted
        assert_eq!(ack_latency(Some(5_000), 1_000, 1_010), Some(10));
    }

    #[tokio::test]
    async fn beats_carry_seq_ack() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let seq_ack = Arc::new(AtomicI64::new(17));
        let last = Arc::new(AtomicU64::new(0));
        let handle = spawn_heartbeat(tx, seq_ack, last.clone(), 1_000);

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected a text heartbeat");
        };
        let msg: VoiceGatewayMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(msg.op, op::HEARTBEAT);
        assert_eq!(msg.d["seq_ack"], 17);
        assert_eq!(msg.d["t"].as_u64(), Some(last.load(Ordering::Relaxed)));
        handle.abort();
    }
}
