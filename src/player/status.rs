//! The two independent state machines of a player and the table linking them.

use serde::Serialize;

use crate::protocol::events::TrackEndReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
}

/// Why the playback status last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackReason {
    Requested,
    Ended,
    Stopped,
    Replaced,
    Error,
    /// The voice connection dropped and is being re-established.
    Reconnecting,
    /// The voice connection ended for good.
    Destroyed,
}

impl PlaybackReason {
    /// Wire reason of the track-ended event for a transition to idle.
    pub fn end_reason(self) -> Option<TrackEndReason> {
        match self {
            Self::Ended => Some(TrackEndReason::Finished),
            Self::Stopped => Some(TrackEndReason::Stopped),
            Self::Replaced => Some(TrackEndReason::Replaced),
            Self::Error => Some(TrackEndReason::LoadFailed),
            Self::Destroyed => Some(TrackEndReason::Cleanup),
            Self::Requested | Self::Reconnecting => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting { resume: bool },
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PlaybackStatus,
    pub to: PlaybackStatus,
    pub reason: PlaybackReason,
}

/// Whether `from -> to` may happen for `reason`.
pub fn is_legal(from: PlaybackStatus, to: PlaybackStatus, reason: PlaybackReason) -> bool {
    use PlaybackReason as R;
    use PlaybackStatus as S;

    match (from, to) {
        (S::Idle, S::Playing) => reason == R::Requested,
        (S::Playing, S::Paused) => matches!(reason, R::Requested | R::Reconnecting),
        (S::Paused, S::Playing) => reason == R::Requested,
        (S::Playing | S::Paused, S::Idle) => reason.end_reason().is_some(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackMachine {
    status: PlaybackStatus,
    reason: PlaybackReason,
}

impl Default for PlaybackMachine {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Idle,
            reason: PlaybackReason::Requested,
        }
    }
}

impl PlaybackMachine {
    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn reason(&self) -> PlaybackReason {
        self.reason
    }

    /// Applies a legal transition; illegal ones leave the machine untouched.
    pub fn transition(&mut self, to: PlaybackStatus, reason: PlaybackReason) -> Option<Transition> {
        if !is_legal(self.status, to, reason) {
            return None;
        }
        let from = self.status;
        self.status = to;
        self.reason = reason;
        Some(Transition { from, to, reason })
    }
}

/// Playback effect of a connection change.
///
/// | connection change                | playback effect                       |
/// |----------------------------------|---------------------------------------|
/// | connected -> connecting          | playing -> paused(reconnecting)       |
/// | connecting -> connected          | paused(reconnecting) -> playing       |
/// | any -> disconnected              | non-idle -> idle(destroyed)           |
pub fn cross_transition(
    previous: ConnectionStatus,
    next: ConnectionStatus,
    playback: &PlaybackMachine,
) -> Option<(PlaybackStatus, PlaybackReason)> {
    use PlaybackStatus as S;

    match (previous, next) {
        (ConnectionStatus::Connected, ConnectionStatus::Connecting { .. })
            if playback.status() == S::Playing =>
        {
            Some((S::Paused, PlaybackReason::Reconnecting))
        }
        (ConnectionStatus::Connecting { .. }, ConnectionStatus::Connected)
            if playback.status() == S::Paused
                && playback.reason() == PlaybackReason::Reconnecting =>
        {
            Some((S::Playing, PlaybackReason::Requested))
        }
        (_, ConnectionStatus::Disconnected)
            if previous != ConnectionStatus::Disconnected && playback.status() != S::Idle =>
        {
            Some((S::Idle, PlaybackReason::Destroyed))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use PlaybackReason as R;
    use PlaybackStatus as S;

    #[test]
    fn legality_table() {
        assert!(is_legal(S::Idle, S::Playing, R::Requested));
        assert!(!is_legal(S::Idle, S::Paused, R::Requested));
        assert!(!is_legal(S::Idle, S::Idle, R::Stopped));

        assert!(is_legal(S::Playing, S::Paused, R::Requested));
        assert!(!is_legal(S::Paused, S::Paused, R::Requested));

        assert!(is_legal(S::Paused, S::Playing, R::Requested));
        assert!(!is_legal(S::Playing, S::Playing, R::Requested));

        for reason in [R::Ended, R::Stopped, R::Replaced, R::Error, R::Destroyed] {
            assert!(is_legal(S::Playing, S::Idle, reason));
            assert!(is_legal(S::Paused, S::Idle, reason));
        }
        assert!(!is_legal(S::Playing, S::Idle, R::Requested));
    }

    #[test]
    fn machine_reports_old_and_new() {
        let mut machine = PlaybackMachine::default();
        assert_eq!(machine.transition(S::Paused, R::Requested), None);
        assert_eq!(machine.status(), S::Idle);

        let t = machine.transition(S::Playing, R::Requested).unwrap();
        assert_eq!((t.from, t.to), (S::Idle, S::Playing));
        let t = machine.transition(S::Idle, R::Ended).unwrap();
        assert_eq!((t.from, t.to, t.reason), (S::Playing, S::Idle, R::Ended));
    }

    #[test]
    fn end_reasons_on_the_wire() {
        assert_eq!(R::Ended.end_reason(), Some(TrackEndReason::Finished));
        assert_eq!(R::Error.end_reason(), Some(TrackEndReason::LoadFailed));
        assert_eq!(R::Destroyed.end_reason(), Some(TrackEndReason::Cleanup));
        assert_eq!(R::Reconnecting.end_reason(), None);
    }

    #[test]
    fn connection_changes_drive_playback() {
        let mut playing = PlaybackMachine::default();
        playing.transition(S::Playing, R::Requested);

        let connecting = ConnectionStatus::Connecting { resume: true };
        assert_eq!(
            cross_transition(ConnectionStatus::Connected, connecting, &playing),
            Some((S::Paused, R::Reconnecting))
        );

        let mut reconnecting = playing;
        reconnecting.transition(S::Paused, R::Reconnecting);
        assert_eq!(
            cross_transition(connecting, ConnectionStatus::Connected, &reconnecting),
            Some((S::Playing, R::Requested))
        );

        // a user pause survives the reconnect
        let mut user_paused = playing;
        user_paused.transition(S::Paused, R::Requested);
        assert_eq!(
            cross_transition(connecting, ConnectionStatus::Connected, &user_paused),
            None
        );

        assert_eq!(
            cross_transition(connecting, ConnectionStatus::Disconnected, &user_paused),
            Some((S::Idle, R::Destroyed))
        );
        assert_eq!(
            cross_transition(
                connecting,
                ConnectionStatus::Disconnected,
                &PlaybackMachine::default()
            ),
            None
        );
    }
}
