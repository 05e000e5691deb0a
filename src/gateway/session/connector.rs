use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{GatewayEvent, GatewaySettings, VoiceCommand, VoiceGateway, VoiceRequest};
use crate::gateway::udp_link::FrameCounters;

/// Opens voice sessions for players.
pub trait VoiceConnector: Send + Sync {
    fn connect(
        &self,
        request: VoiceRequest,
        events: mpsc::UnboundedSender<GatewayEvent>,
        counters: Arc<FrameCounters>,
        ping: Arc<AtomicI64>,
    ) -> VoiceSessionHandle;
}

/// Owning handle of a running voice session. Dropping it ends the session.
pub struct VoiceSessionHandle {
    commands: mpsc::UnboundedSender<VoiceCommand>,
    ping: Arc<AtomicI64>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl VoiceSessionHandle {
    pub fn new(
        commands: mpsc::UnboundedSender<VoiceCommand>,
        ping: Arc<AtomicI64>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            commands,
            ping,
            cancel,
            task,
        }
    }

    pub fn set_speaking(&self, speaking: bool) {
        let _ = self.commands.send(VoiceCommand::Speaking(speaking));
    }

    /// Last heartbeat round trip in ms, `-1` before the first ack.
    pub fn ping(&self) -> i64 {
        self.ping.load(Ordering::Relaxed)
    }
}

impl Drop for VoiceSessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connects to the real voice gateway.
pub struct GatewayConnector {
    settings: GatewaySettings,
}

impl GatewayConnector {
    pub fn new(settings: GatewaySettings) -> Self {
        Self { settings }
    }
}

impl VoiceConnector for GatewayConnector {
    fn connect(
        &self,
        request: VoiceRequest,
        events: mpsc::UnboundedSender<GatewayEvent>,
        counters: Arc<FrameCounters>,
        ping: Arc<AtomicI64>,
    ) -> VoiceSessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        ping.store(-1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let gateway = VoiceGateway::new(
            request,
            self.settings.clone(),
            events,
            commands_rx,
            counters,
            ping.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(gateway.run());

        VoiceSessionHandle::new(commands_tx, ping, cancel, Some(task))
    }
}
