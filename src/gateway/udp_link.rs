use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    common::types::{AnyResult, UserId, map_boxed_err},
    gateway::{
        constants::{
            DISCOVERY_PACKET_LEN, FRAME_SAMPLES, INBOUND_STREAM_CAPACITY, RTP_EXTENSION_BIT,
            RTP_HEADER_LEN, RTP_OPUS_PAYLOAD_TYPE, RTP_VERSION_BYTE, UDP_PACKET_BUF_CAPACITY,
        },
        crypto::{CipherMode, CryptoError, PacketCipher},
    },
};

/// Transport counters of one player, shared with the stats collector.
#[derive(Debug, Default)]
pub struct FrameCounters {
    /// Frames handed to the transport.
    pub expected: AtomicU64,
    /// Frames that reached the socket.
    pub transmitted: AtomicU64,
    /// Frames lost to encryption or socket errors.
    pub omitted: AtomicU64,
    /// Pacing slots with no frame ready.
    pub nulled: AtomicU64,
}

impl FrameCounters {
    pub fn snapshot(&self) -> FrameCountersSnapshot {
        FrameCountersSnapshot {
            expected: self.expected.load(Ordering::Relaxed),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            omitted: self.omitted.load(Ordering::Relaxed),
            nulled: self.nulled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCountersSnapshot {
    pub expected: u64,
    pub transmitted: u64,
    pub omitted: u64,
    pub nulled: u64,
}

/// Builds the 74-byte IP discovery request for `ssrc`.
pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[0..2].copy_from_slice(&1u16.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Parses an IP discovery response into the external address and port.
pub fn parse_discovery_response(packet: &[u8]) -> Option<(String, u16)> {
    if packet.len() < DISCOVERY_PACKET_LEN || packet[0..2] != 2u16.to_be_bytes() {
        return None;
    }
    let field = &packet[8..DISCOVERY_PACKET_LEN - 2];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let address = std::str::from_utf8(&field[..end]).ok()?.to_string();
    if address.is_empty() {
        return None;
    }
    let port = u16::from_be_bytes([
        packet[DISCOVERY_PACKET_LEN - 2],
        packet[DISCOVERY_PACKET_LEN - 1],
    ]);
    Some((address, port))
}

/// Asks the voice server which address and port it sees for this socket.
///
/// Datagrams that are not discovery responses are skipped until `timeout` expires.
pub async fn discover_ip(
    socket: &UdpSocket,
    server: SocketAddr,
    ssrc: u32,
    timeout: Duration,
) -> AnyResult<(String, u16)> {
    socket
        .send_to(&discovery_request(ssrc), server)
        .await
        .map_err(map_boxed_err)?;

    match tokio::time::timeout(timeout, await_discovery_response(socket)).await {
        Ok(result) => result.map_err(map_boxed_err),
        Err(_) => Err(map_boxed_err(format!(
            "IP discovery timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

async fn await_discovery_response(socket: &UdpSocket) -> std::io::Result<(String, u16)> {
    let mut buf = [0u8; 512];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if let Some(found) = parse_discovery_response(&buf[..n]) {
            return Ok(found);
        }
        trace!("ignoring {n} byte datagram from {from} during IP discovery");
    }
}

/// Negotiated encryption state plus the rolling RTP counters.
pub struct CipherContext {
    cipher: PacketCipher,
    ssrc: u32,
    sequence: u16,
    timestamp: u64,
    timestamp_modulus: u64,
    nonce: u32,
}

impl CipherContext {
    pub fn new(cipher: PacketCipher, ssrc: u32, timestamp_modulus: u64) -> Self {
        Self {
            cipher,
            ssrc,
            sequence: 0,
            timestamp: 0,
            timestamp_modulus: timestamp_modulus.clamp(1, 1 << 32),
            nonce: 0,
        }
    }

    pub fn mode(&self) -> CipherMode {
        self.cipher.mode()
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp as u32
    }

    fn header(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION_BYTE;
        header[1] = RTP_OPUS_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&(self.timestamp as u32).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Encrypts one frame into `out` and advances sequence, timestamp and nonce.
    pub fn seal_frame(&mut self, frame: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.nonce.wrapping_add(1);
        self.cipher.seal_into(&self.header(), frame, nonce, out)?;

        self.nonce = nonce;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = (self.timestamp + u64::from(FRAME_SAMPLES)) % self.timestamp_modulus;
        Ok(())
    }

    /// Restarts sequence and timestamp. The nonce keeps counting: it must never
    /// repeat under the same key.
    pub fn reset_counters(&mut self) {
        self.sequence = 0;
        self.timestamp = 0;
    }
}

/// Destination of paced frames.
#[async_trait]
pub trait PacketSink: Send {
    /// Sends one encoded frame. Failures are counted, never returned.
    async fn send_frame(&mut self, frame: &[u8]);

    /// Restarts the RTP sequence and timestamp.
    fn reset_counters(&mut self);
}

/// Outbound half of the voice UDP transport.
pub struct UdpBackend {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    context: CipherContext,
    counters: Arc<FrameCounters>,
    packet_buf: Vec<u8>,
}

impl UdpBackend {
    pub fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        context: CipherContext,
        counters: Arc<FrameCounters>,
    ) -> Self {
        Self {
            socket,
            remote,
            context,
            counters,
            packet_buf: Vec::with_capacity(UDP_PACKET_BUF_CAPACITY),
        }
    }

    pub fn context(&self) -> &CipherContext {
        &self.context
    }
}

#[async_trait]
impl PacketSink for UdpBackend {
    async fn send_frame(&mut self, frame: &[u8]) {
        self.counters.expected.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.context.seal_frame(frame, &mut self.packet_buf) {
            self.counters.omitted.fetch_add(1, Ordering::Relaxed);
            warn!("failed to encrypt voice frame: {e}");
            return;
        }

        match self.socket.send_to(&self.packet_buf, self.remote).await {
            Ok(_) => {
                self.counters.transmitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.omitted.fetch_add(1, Ordering::Relaxed);
                debug!("voice packet to {} dropped: {e}", self.remote);
            }
        }
    }

    fn reset_counters(&mut self) {
        self.context.reset_counters();
    }
}

/// Skips an RTP header extension at the start of a decrypted payload.
pub fn strip_header_extension(first_header_byte: u8, payload: &[u8]) -> &[u8] {
    if first_header_byte & RTP_EXTENSION_BIT == 0 || payload.len() < 4 {
        return payload;
    }
    let words = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    payload.get(4 + words * 4..).unwrap_or(&[])
}

struct InboundStream {
    user_id: Option<UserId>,
    tx: flume::Sender<Vec<u8>>,
}

/// Demultiplexes inbound voice datagrams into one queue per remote SSRC.
#[derive(Default)]
pub struct InboundStreams {
    cipher: Option<PacketCipher>,
    streams: HashMap<u32, InboundStream>,
}

pub type SharedInbound = Arc<parking_lot::Mutex<InboundStreams>>;

impl InboundStreams {
    pub fn set_cipher(&mut self, cipher: PacketCipher) {
        self.cipher = Some(cipher);
    }

    /// Opens the stream for `ssrc`, replacing any previous one.
    pub fn register(&mut self, ssrc: u32, user_id: Option<UserId>) -> flume::Receiver<Vec<u8>> {
        let (tx, rx) = flume::bounded(INBOUND_STREAM_CAPACITY);
        self.streams.insert(ssrc, InboundStream { user_id, tx });
        rx
    }

    pub fn is_registered(&self, ssrc: u32) -> bool {
        self.streams.contains_key(&ssrc)
    }

    pub fn remove_user(&mut self, user_id: UserId) {
        self.streams.retain(|_, s| s.user_id != Some(user_id));
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    /// Routes one datagram. Returns whether it was delivered.
    pub fn dispatch(&self, datagram: &[u8]) -> bool {
        if datagram.len() < RTP_HEADER_LEN {
            return false;
        }
        // RTCP shares the socket; its packet types occupy 200..=204.
        if (200..=204).contains(&datagram[1]) {
            return false;
        }
        let ssrc = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
        let (Some(stream), Some(cipher)) = (self.streams.get(&ssrc), self.cipher.as_ref()) else {
            return false;
        };
        let Ok(plain) = cipher.open(datagram) else {
            return false;
        };
        let payload = strip_header_extension(datagram[0], &plain);
        stream.tx.try_send(payload.to_vec()).is_ok()
    }
}

/// Reads the voice socket until cancelled, feeding [`InboundStreams`].
pub async fn receive_loop(socket: Arc<UdpSocket>, inbound: SharedInbound, cancel: CancellationToken) {
    let mut buf = vec![0u8; UDP_PACKET_BUF_CAPACITY];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv(&mut buf) => match res {
                Ok(n) => {
                    inbound.lock().dispatch(&buf[..n]);
                }
                Err(e) => {
                    debug!("voice socket receive failed: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::crypto::KEY_SIZE;

    const KEY: [u8; KEY_SIZE] = [3; KEY_SIZE];

    fn context(mode: CipherMode, modulus: u64) -> CipherContext {
        CipherContext::new(PacketCipher::new(mode, &KEY).unwrap(), 0xABCD, modulus)
    }

    fn seq_ts(packet: &[u8]) -> (u16, u32) {
        (
            u16::from_be_bytes([packet[2], packet[3]]),
            u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
        )
    }

    #[test]
    fn discovery_request_layout() {
        let packet = discovery_request(0x0102_0304);
        assert_eq!(&packet[0..8], &[0, 1, 0, 70, 1, 2, 3, 4]);
        assert!(packet[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn discovery_response_parsing() {
        let mut packet = [0u8; DISCOVERY_PACKET_LEN];
        packet[0..2].copy_from_slice(&2u16.to_be_bytes());
        packet[2..4].copy_from_slice(&70u16.to_be_bytes());
        packet[8..8 + 11].copy_from_slice(b"203.0.113.9");
        packet[72..74].copy_from_slice(&50_004u16.to_be_bytes());
        assert_eq!(
            parse_discovery_response(&packet),
            Some(("203.0.113.9".to_string(), 50_004))
        );

        packet[1] = 1;
        assert_eq!(parse_discovery_response(&packet), None);
        assert_eq!(parse_discovery_response(&packet[..40]), None);
    }

    #[test]
    fn sequence_and_timestamp_advance_by_one_frame() {
        let mut ctx = context(CipherMode::Lite, 1 << 32);
        let mut out = Vec::new();
        let mut last: Option<(u16, u32)> = None;
        for _ in 0..70_000 {
            ctx.seal_frame(b"frame", &mut out).unwrap();
            let (seq, ts) = seq_ts(&out);
            if let Some((prev_seq, prev_ts)) = last {
                assert_eq!(seq, prev_seq.wrapping_add(1));
                assert_eq!(ts, prev_ts.wrapping_add(FRAME_SAMPLES));
            }
            last = Some((seq, ts));
        }
    }

    #[test]
    fn timestamp_wraps_at_configured_modulus() {
        let modulus = u64::from(FRAME_SAMPLES) * 3;
        let mut ctx = context(CipherMode::Normal, modulus);
        let mut out = Vec::new();
        let stamps: Vec<u32> = (0..5)
            .map(|_| {
                ctx.seal_frame(b"x", &mut out).unwrap();
                seq_ts(&out).1
            })
            .collect();
        assert_eq!(stamps, vec![0, 960, 1920, 0, 960]);
    }

    #[test]
    fn lite_nonce_keeps_counting_across_reset() {
        let mut ctx = context(CipherMode::Lite, 1 << 32);
        let mut out = Vec::new();
        ctx.seal_frame(b"a", &mut out).unwrap();
        ctx.seal_frame(b"b", &mut out).unwrap();
        ctx.reset_counters();
        ctx.seal_frame(b"c", &mut out).unwrap();

        assert_eq!(seq_ts(&out), (0, 0));
        assert_eq!(&out[out.len() - 4..], &3u32.to_be_bytes());
    }

    #[test]
    fn inbound_demux_routes_by_ssrc() {
        let cipher = PacketCipher::new(CipherMode::Suffix, &KEY).unwrap();
        let mut remote = CipherContext::new(cipher.clone(), 77, 1 << 32);
        let mut packet = Vec::new();
        remote.seal_frame(b"hello", &mut packet).unwrap();

        let mut inbound = InboundStreams::default();
        assert!(!inbound.dispatch(&packet), "no cipher yet");

        inbound.set_cipher(cipher);
        assert!(!inbound.dispatch(&packet), "unknown ssrc");

        let rx = inbound.register(77, Some(UserId(5)));
        assert!(inbound.dispatch(&packet));
        assert_eq!(rx.try_recv().unwrap(), b"hello");

        assert!(!inbound.dispatch(&packet[..8]), "shorter than a header");
        let mut corrupt = packet.clone();
        corrupt[20] ^= 0xFF;
        assert!(!inbound.dispatch(&corrupt));

        inbound.remove_user(UserId(5));
        assert!(!inbound.is_registered(77));
    }

    #[test]
    fn header_extension_is_stripped() {
        let payload = [0xBE, 0xDE, 0, 1, 9, 9, 9, 9, b'o', b'p', b'u', b's'];
        assert_eq!(strip_header_extension(0x90, &payload), b"opus");
        assert_eq!(strip_header_extension(0x80, &payload), &payload);
        assert_eq!(strip_header_extension(0x90, &[0xBE, 0xDE, 0, 9]), &[] as &[u8]);
    }

    #[tokio::test]
    async fn udp_backend_counts_and_sends() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let counters = Arc::new(FrameCounters::default());
        let cipher = PacketCipher::new(CipherMode::Lite, &KEY).unwrap();
        let mut backend = UdpBackend::new(
            sender,
            receiver.local_addr().unwrap(),
            CipherContext::new(cipher.clone(), 1, 1 << 32),
            counters.clone(),
        );

        backend.send_frame(b"opus").await;
        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).await.unwrap();

        assert_eq!(cipher.open(&buf[..n]).unwrap(), b"opus");
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.expected, 1);
        assert_eq!(snapshot.transmitted, 1);
        assert_eq!(snapshot.omitted, 0);
    }

    #[tokio::test]
    async fn discovery_skips_unrelated_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; DISCOVERY_PACKET_LEN];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[4..8], &9u32.to_be_bytes());
            server.send_to(b"noise", from).await.unwrap();
            let mut reply = [0u8; DISCOVERY_PACKET_LEN];
            reply[0..2].copy_from_slice(&2u16.to_be_bytes());
            reply[8..17].copy_from_slice(b"127.0.0.1");
            reply[72..74].copy_from_slice(&4000u16.to_be_bytes());
            server.send_to(&reply, from).await.unwrap();
        });

        let found = discover_ip(&client, server_addr, 9, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(found, ("127.0.0.1".to_string(), 4000));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn discovery_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = discover_ip(
            &client,
            silent.local_addr().unwrap(),
            1,
            Duration::from_millis(50),
        )
        .await;
        assert!(result.is_err());
    }
}
