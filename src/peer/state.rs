use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use crate::peer::ice::RemoteCandidates;
use crate::transport::TransportEvent;

/// Lifecycle of the single peer connection owned by a negotiator.
///
/// `Failed` and `Closed` are left only through `close()` or a fresh
/// `initialize()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Uninitialized,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl NegotiatorState {
    /// Whether descriptions may still be produced or consumed.
    pub fn can_negotiate(self) -> bool {
        matches!(self, Self::Negotiating)
    }

    /// A fresh connection replaces whatever came before.
    pub fn on_initialize(self) -> Option<Self> {
        Some(Self::Negotiating)
    }

    /// Channel open. Only valid while negotiating; late opens after
    /// close/failure are ignored.
    pub fn on_channel_open(self) -> Option<Self> {
        match self {
            Self::Negotiating => Some(Self::Connected),
            _ => None,
        }
    }

    pub fn on_channel_close(self) -> Option<Self> {
        match self {
            Self::Connected => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn on_failure(self) -> Option<Self> {
        match self {
            Self::Negotiating | Self::Connected => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn on_close(self) -> Option<Self> {
        match self {
            Self::Closed => None,
            _ => Some(Self::Closed),
        }
    }
}

/// Everything one negotiator shares with its connection callbacks.
///
/// Callbacks capture the generation they were registered under and go quiet
/// once `initialize()` replaces the connection.
pub(crate) struct PeerContext {
    state: Mutex<NegotiatorState>,
    generation: AtomicU64,
    peer: Mutex<Option<Arc<RTCPeerConnection>>>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    candidates: Mutex<RemoteCandidates>,
    connected_task: Mutex<Option<JoinHandle<()>>>,
    disconnect_task: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PeerContext {
    pub(crate) fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            state: Mutex::new(NegotiatorState::Uninitialized),
            generation: AtomicU64::new(0),
            peer: Mutex::new(None),
            data_channel: Mutex::new(None),
            candidates: Mutex::new(RemoteCandidates::default()),
            connected_task: Mutex::new(None),
            disconnect_task: Mutex::new(None),
            events,
        }
    }

    pub(crate) fn state(&self) -> NegotiatorState {
        *lock(&self.state)
    }

    /// Applies `step` to the current state; `None` from `step` rejects the
    /// transition and leaves the state untouched.
    pub(crate) fn transition(
        &self,
        step: impl FnOnce(NegotiatorState) -> Option<NegotiatorState>,
    ) -> Option<NegotiatorState> {
        let mut state = lock(&self.state);
        let next = step(*state)?;
        debug!(from = ?*state, to = ?next, "negotiator state");
        *state = next;
        Some(next)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub(crate) fn peer(&self) -> Option<Arc<RTCPeerConnection>> {
        lock(&self.peer).clone()
    }

    pub(crate) fn set_peer(
        &self,
        pc: Option<Arc<RTCPeerConnection>>,
    ) -> Option<Arc<RTCPeerConnection>> {
        std::mem::replace(&mut *lock(&self.peer), pc)
    }

    pub(crate) fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        lock(&self.data_channel).clone()
    }

    pub(crate) fn set_data_channel(
        &self,
        dc: Option<Arc<RTCDataChannel>>,
    ) -> Option<Arc<RTCDataChannel>> {
        std::mem::replace(&mut *lock(&self.data_channel), dc)
    }

    pub(crate) fn candidates(&self) -> MutexGuard<'_, RemoteCandidates> {
        lock(&self.candidates)
    }

    pub(crate) fn set_connected_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = lock(&self.connected_task).replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn has_disconnect_task(&self) -> bool {
        lock(&self.disconnect_task).is_some()
    }

    pub(crate) fn set_disconnect_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = lock(&self.disconnect_task).replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn cancel_disconnect_task(&self) {
        if let Some(handle) = lock(&self.disconnect_task).take() {
            debug!("aborting pending disconnect watchdog");
            handle.abort();
        }
    }

    /// Cancels every deferred action tied to the current connection.
    pub(crate) fn abort_tasks(&self) {
        if let Some(handle) = lock(&self.connected_task).take() {
            handle.abort();
        }
        self.cancel_disconnect_task();
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_status(&self, connected: bool, reason: &str) {
        self.emit(TransportEvent::StatusChanged {
            connected,
            reason: reason.to_string(),
        });
    }

    /// Moves to `Failed` (if allowed) and reports the channel as down.
    pub(crate) fn fail(&self, generation: u64, reason: &str) {
        if !self.is_current(generation) {
            return;
        }
        if self.transition(NegotiatorState::on_failure).is_some() {
            if let Some(handle) = lock(&self.connected_task).take() {
                handle.abort();
            }
            self.emit_status(false, reason);
        }
    }
}

/// Data channel label shared by both participants.
pub const DATA_CHANNEL_LABEL: &str = "textEditor";

/// Default delay between channel open and the `Connected` event.
pub const CONNECTED_NOTIFY_DELAY: Duration = Duration::from_secs(2);

/// Default wait before a `disconnected` connection is declared failed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::NegotiatorState::*;

    #[test]
    fn channel_open_only_from_negotiating() {
        assert_eq!(Negotiating.on_channel_open(), Some(Connected));
        assert_eq!(Uninitialized.on_channel_open(), None);
        assert_eq!(Closed.on_channel_open(), None);
        assert_eq!(Failed.on_channel_open(), None);
    }

    #[test]
    fn failure_is_absorbing() {
        assert_eq!(Negotiating.on_failure(), Some(Failed));
        assert_eq!(Connected.on_failure(), Some(Failed));
        assert_eq!(Failed.on_failure(), None);
        assert_eq!(Failed.on_channel_close(), None);
        assert!(!Failed.can_negotiate());
    }

    #[test]
    fn initialize_restarts_from_any_state() {
        for state in [Uninitialized, Negotiating, Connected, Closed, Failed] {
            assert_eq!(state.on_initialize(), Some(Negotiating));
        }
    }

    #[test]
    fn close_is_idempotent() {
        assert_eq!(Connected.on_close(), Some(Closed));
        assert_eq!(Failed.on_close(), Some(Closed));
        assert_eq!(Closed.on_close(), None);
    }
}
