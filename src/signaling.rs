//! Pairing coordinator: drives the shared session document through the
//! offer/answer/candidate exchange and disposes of it once the channel is up.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::PairingConfig;
use crate::error::{PairingError, RelayError};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::relay::{ChildStream, FieldStream, RelayStore};
use crate::session::{
    decide_role, CandidateEntry, PairingDecision, SessionDocument, FIELD_ANSWER, FIELD_CANDIDATES,
};
use crate::transport::{Transport, TransportEvent};
use crate::utils::{now_millis, random_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Where the coordinator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    /// Reading the document, or waiting out an eviction backoff.
    AwaitingDocument,
    /// Own description is being produced; local candidates are held back.
    Describing(Role),
    /// Own description is on the relay; candidates flow both ways.
    Signaling(Role),
    /// Channel confirmed; relay listeners are gone and deletion is scheduled.
    CleanedUp,
    Closed,
}

struct Inner {
    phase: PairingPhase,
    buffered: Vec<IceCandidate>,
    listeners: Vec<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
    attempt: Option<JoinHandle<()>>,
}

/// One participant's side of the pairing handshake.
pub struct PairingCoordinator<R, T> {
    relay: Arc<R>,
    transport: Arc<T>,
    participant: String,
    config: PairingConfig,
    inner: Mutex<Inner>,
}

impl<R, T> fmt::Debug for PairingCoordinator<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingCoordinator")
            .field("participant", &self.participant)
            .field("session_key", &self.config.session_key)
            .field("phase", &self.lock().phase)
            .finish()
    }
}

impl<R, T> PairingCoordinator<R, T> {
    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn phase(&self) -> PairingPhase {
        self.lock().phase
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.lock().phase == PairingPhase::Closed
    }

    /// Closed is terminal; later phase changes are ignored.
    fn set_phase(&self, phase: PairingPhase) {
        let mut inner = self.lock();
        if inner.phase != PairingPhase::Closed {
            debug!(from = ?inner.phase, to = ?phase, "pairing phase");
            inner.phase = phase;
        }
    }
}

impl<R, T> PairingCoordinator<R, T>
where
    R: RelayStore + 'static,
    T: Transport + 'static,
{
    /// A coordinator with a fresh random participant id.
    pub fn new(relay: Arc<R>, transport: Arc<T>, config: PairingConfig) -> Self {
        Self::with_participant(relay, transport, config, random_id())
    }

    pub fn with_participant(
        relay: Arc<R>,
        transport: Arc<T>,
        config: PairingConfig,
        participant: impl Into<String>,
    ) -> Self {
        Self {
            relay,
            transport,
            participant: participant.into(),
            config,
            inner: Mutex::new(Inner {
                phase: PairingPhase::Idle,
                buffered: Vec::new(),
                listeners: Vec::new(),
                cleanup: None,
                attempt: None,
            }),
        }
    }

    /// Reads the session document once and takes the role it implies.
    ///
    /// Returns once the local description is on the relay and the listeners
    /// are running. A stale offer+answer document is deleted and the read is
    /// retried after the configured backoff.
    pub async fn attempt_pairing(&self) -> Result<Role, PairingError> {
        let key = self.config.session_key.as_str();
        loop {
            self.ensure_open().await?;
            self.set_phase(PairingPhase::AwaitingDocument);
            let observed = self.relay.read(key).await?;
            self.ensure_open().await?;

            match decide_role(observed) {
                PairingDecision::Offer => {
                    info!(key, participant = %self.participant, "no live offer, becoming offerer");
                    self.set_phase(PairingPhase::Describing(Role::Offerer));
                    self.transport.initialize().await?;
                    let offer = self.transport.create_offer().await?;
                    self.ensure_open().await?;

                    let document =
                        SessionDocument::new_offer(offer, &self.participant, now_millis());
                    self.relay.write(key, to_value(&document)?).await?;
                    debug!(key, "offer document written");

                    let answers = self.relay.subscribe_field(key, FIELD_ANSWER).await?;
                    self.ensure_open().await?;
                    self.spawn_listener(answer_listener(Arc::clone(&self.transport), answers));
                    self.start_signaling(Role::Offerer).await?;
                    return Ok(Role::Offerer);
                }

                PairingDecision::Answer(offer) => {
                    info!(
                        key,
                        participant = %self.participant,
                        "found waiting offer, becoming answerer"
                    );
                    self.set_phase(PairingPhase::Describing(Role::Answerer));
                    self.transport.initialize().await?;
                    let answer = self.transport.receive_offer(offer).await?;
                    self.ensure_open().await?;

                    self.relay
                        .write_field(key, FIELD_ANSWER, to_value(&answer)?)
                        .await?;
                    debug!(key, "answer written");

                    self.start_signaling(Role::Answerer).await?;
                    return Ok(Role::Answerer);
                }

                PairingDecision::Evict => {
                    info!(
                        key,
                        backoff_ms = self.config.retry_backoff_ms,
                        "stale session document, evicting and retrying"
                    );
                    self.relay.delete(key).await?;
                    sleep(self.config.retry_backoff()).await;
                }
            }
        }
    }

    /// Fails the attempt once `close()` has run. A transport call that raced
    /// `close()` may have brought the connection back, so close it again.
    async fn ensure_open(&self) -> Result<(), PairingError> {
        if self.is_closed() {
            self.transport.close().await;
            return Err(PairingError::Closed);
        }
        Ok(())
    }

    /// Keeps the background attempt so `close()` can cancel it.
    fn track_attempt(&self, handle: JoinHandle<()>) {
        let mut inner = self.lock();
        if inner.phase == PairingPhase::Closed {
            handle.abort();
        } else if let Some(old) = inner.attempt.replace(handle) {
            old.abort();
        }
    }

    /// Subscribes to remote candidates and publishes everything buffered.
    async fn start_signaling(&self, role: Role) -> Result<(), PairingError> {
        let key = self.config.session_key.as_str();
        let candidates = self.relay.subscribe_child_added(key, FIELD_CANDIDATES).await?;
        self.spawn_listener(candidate_listener(
            Arc::clone(&self.transport),
            candidates,
            self.participant.clone(),
        ));

        let buffered = {
            let mut inner = self.lock();
            match inner.phase {
                PairingPhase::Describing(current) if current == role => {}
                PairingPhase::Closed => return Err(PairingError::Closed),
                // channel already confirmed
                _ => return Ok(()),
            }
            inner.phase = PairingPhase::Signaling(role);
            std::mem::take(&mut inner.buffered)
        };
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "publishing buffered local candidates");
        }
        for candidate in buffered {
            self.publish_candidate(candidate).await;
        }
        Ok(())
    }

    fn spawn_listener<F>(&self, listener: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(listener);
        let mut inner = self.lock();
        match inner.phase {
            PairingPhase::CleanedUp | PairingPhase::Closed => handle.abort(),
            _ => inner.listeners.push(handle),
        }
    }

    /// Feeds one negotiator event into the handshake.
    pub async fn handle_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                let publish_now = {
                    let mut inner = self.lock();
                    match inner.phase {
                        PairingPhase::Signaling(_) => true,
                        PairingPhase::CleanedUp | PairingPhase::Closed => {
                            debug!("local candidate after cleanup dropped");
                            false
                        }
                        _ => {
                            inner.buffered.push(candidate.clone());
                            false
                        }
                    }
                };
                if publish_now {
                    self.publish_candidate(candidate.clone()).await;
                }
            }
            TransportEvent::Connected => self.cleanup().await,
            TransportEvent::StatusChanged { connected, reason } => {
                info!(connected, %reason, "transport status");
            }
            TransportEvent::Message(_) => {}
        }
    }

    async fn publish_candidate(&self, candidate: IceCandidate) {
        let entry = CandidateEntry {
            candidate,
            from: self.participant.clone(),
            timestamp: now_millis(),
        };
        let value = match serde_json::to_value(&entry) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "local candidate could not be encoded");
                return;
            }
        };
        match self
            .relay
            .append_child(&self.config.session_key, FIELD_CANDIDATES, value)
            .await
        {
            Ok(id) => debug!(%id, candidate = %entry.candidate.candidate, "local candidate published"),
            Err(e) => warn!(error = %e, "local candidate not published"),
        }
    }

    /// Stops listening and schedules deletion of the session document.
    /// Runs once; later calls are no-ops.
    async fn cleanup(&self) {
        let listeners = {
            let mut inner = self.lock();
            if matches!(inner.phase, PairingPhase::CleanedUp | PairingPhase::Closed) {
                return;
            }
            inner.phase = PairingPhase::CleanedUp;
            inner.buffered.clear();
            std::mem::take(&mut inner.listeners)
        };
        for handle in listeners {
            handle.abort();
        }

        let key = self.config.session_key.clone();
        if let Err(e) = self.relay.unsubscribe_all(&key).await {
            warn!(error = %e, "unsubscribe before cleanup failed");
        }

        let grace = self.config.cleanup_grace();
        info!(key, grace_ms = self.config.cleanup_grace_ms, "scheduling session document deletion");
        let relay = Arc::clone(&self.relay);
        let handle = tokio::spawn(async move {
            sleep(grace).await;
            match relay.delete(&key).await {
                Ok(()) => debug!(key, "session document deleted"),
                Err(e) => debug!(key, error = %e, "session document deletion failed, ignoring"),
            }
        });

        let mut inner = self.lock();
        if inner.phase == PairingPhase::Closed {
            handle.abort();
        } else if let Some(old) = inner.cleanup.replace(handle) {
            old.abort();
        }
    }

    /// Cancels the running attempt and any pending deletion, drops relay
    /// listeners and closes the transport. Idempotent.
    pub async fn close(&self) {
        let (listeners, deferred) = {
            let mut inner = self.lock();
            if inner.phase == PairingPhase::Closed {
                return;
            }
            inner.phase = PairingPhase::Closed;
            inner.buffered.clear();
            let deferred = [inner.cleanup.take(), inner.attempt.take()];
            (std::mem::take(&mut inner.listeners), deferred)
        };
        for handle in listeners.into_iter().chain(deferred.into_iter().flatten()) {
            handle.abort();
        }
        if let Err(e) = self.relay.unsubscribe_all(&self.config.session_key).await {
            debug!(error = %e, "unsubscribe on close failed");
        }
        self.transport.close().await;
        info!(participant = %self.participant, "pairing closed");
    }
}

/// Applies the first non-null answer, then stops.
async fn answer_listener<T: Transport>(transport: Arc<T>, mut answers: FieldStream) {
    while let Some(value) = answers.recv().await {
        if value.is_null() {
            continue;
        }
        let answer: SessionDescription = match serde_json::from_value(value) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "undecodable answer on relay, waiting for another");
                continue;
            }
        };
        match transport.receive_answer(answer).await {
            Ok(true) => info!("answer received"),
            Ok(false) => debug!("answer already applied"),
            Err(e) => warn!(error = %e, "answer rejected"),
        }
        return;
    }
}

/// Forwards the peer's candidates; own and malformed entries are dropped.
async fn candidate_listener<T: Transport>(
    transport: Arc<T>,
    mut candidates: ChildStream,
    participant: String,
) {
    while let Some((id, value)) = candidates.recv().await {
        match decode_entry(value) {
            Some(entry) if entry.from == participant => {
                debug!(%id, "own candidate filtered");
            }
            Some(entry) => {
                debug!(%id, from = %entry.from, "remote candidate received");
                transport.add_ice_candidate(entry.candidate).await;
            }
            None => warn!(%id, "malformed candidate entry dropped"),
        }
    }
}

fn to_value<S: Serialize>(value: &S) -> Result<Value, RelayError> {
    Ok(serde_json::to_value(value)?)
}

fn decode_entry(value: Value) -> Option<CandidateEntry> {
    serde_json::from_value(value).ok()
}

/// Top-level entry point: runs one pairing attempt in the background and
/// drives the coordinator from the negotiator's events.
///
/// Every negotiator event is forwarded on the returned receiver for the
/// application layer. A failed attempt is logged and not retried.
pub fn start_pairing<R, T>(
    coordinator: Arc<PairingCoordinator<R, T>>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) -> mpsc::UnboundedReceiver<TransportEvent>
where
    R: RelayStore + 'static,
    T: Transport + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    let pump = Arc::clone(&coordinator);
    tokio::spawn(async move {
        while let Some(event) = transport_events.recv().await {
            pump.handle_transport_event(&event).await;
            // a dropped receiver only means nobody is watching
            let _ = tx.send(event);
        }
    });

    let attempt = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move {
            match coordinator.attempt_pairing().await {
                Ok(role) => info!(?role, "pairing in progress"),
                Err(PairingError::Closed) => debug!("pairing attempt cancelled by close"),
                Err(e) => error!(error = %e, "pairing attempt failed"),
            }
        }
    });
    coordinator.track_attempt(attempt);

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::message::AppMessage;
    use crate::relay::MemoryRelay;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Records calls; descriptions are canned.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        ingested: Mutex<Vec<IceCandidate>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn initialize(&self) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push("initialize".into());
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            self.calls.lock().unwrap().push("create_offer".into());
            Ok(SessionDescription::offer("v=0 offer"))
        }
        async fn receive_offer(
            &self,
            offer: SessionDescription,
        ) -> Result<SessionDescription, TransportError> {
            self.calls.lock().unwrap().push(format!("receive_offer {}", offer.sdp));
            Ok(SessionDescription::answer("v=0 answer"))
        }
        async fn receive_answer(&self, answer: SessionDescription) -> Result<bool, TransportError> {
            self.calls.lock().unwrap().push(format!("receive_answer {}", answer.sdp));
            Ok(true)
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) {
            self.ingested.lock().unwrap().push(candidate);
        }
        async fn send_message(&self, _message: &AppMessage) -> bool {
            false
        }
        fn is_open(&self) -> bool {
            false
        }
        async fn close(&self) {
            self.calls.lock().unwrap().push("close".into());
        }
    }

    fn config() -> PairingConfig {
        PairingConfig {
            session_key: "room".into(),
            ..PairingConfig::default()
        }
    }

    fn coordinator(
        relay: &MemoryRelay,
        name: &str,
    ) -> PairingCoordinator<crate::relay::MemoryRelayClient, Recorder> {
        PairingCoordinator::with_participant(
            Arc::new(relay.client()),
            Arc::new(Recorder::default()),
            config(),
            name,
        )
    }

    fn candidate(n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 192.0.2.{n} 9 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_relay_makes_offerer() {
        let relay = MemoryRelay::new();
        let a = coordinator(&relay, "user_a");
        assert_eq!(a.attempt_pairing().await.unwrap(), Role::Offerer);
        assert_eq!(a.phase(), PairingPhase::Signaling(Role::Offerer));

        let doc = relay.snapshot("room").unwrap();
        assert_eq!(doc["offer"]["type"], "offer");
        assert_eq!(doc["answer"], Value::Null);
        assert_eq!(doc["offerer"], "user_a");
        assert_eq!(a.transport().calls(), vec!["initialize", "create_offer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn offer_only_document_makes_answerer() {
        let relay = MemoryRelay::new();
        let a = coordinator(&relay, "user_a");
        let b = coordinator(&relay, "user_b");
        a.attempt_pairing().await.unwrap();

        assert_eq!(b.attempt_pairing().await.unwrap(), Role::Answerer);
        let doc = relay.snapshot("room").unwrap();
        assert_eq!(doc["answer"]["sdp"], "v=0 answer");
        assert_eq!(doc["offerer"], "user_a");
        assert_eq!(
            b.transport().calls(),
            vec!["initialize", "receive_offer v=0 offer"]
        );

        // a's subscription picks the answer up
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(a.transport().calls().contains(&"receive_answer v=0 answer".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_wait_for_own_description() {
        let relay = MemoryRelay::new();
        let a = coordinator(&relay, "user_a");

        // reported before the offer document exists
        a.handle_transport_event(&TransportEvent::IceCandidate(candidate(1)))
            .await;
        assert!(relay.snapshot("room").is_none());

        a.attempt_pairing().await.unwrap();
        let doc = relay.snapshot("room").unwrap();
        let published = doc["candidates"].as_object().unwrap();
        assert_eq!(published.len(), 1);
        let entry = published.values().next().unwrap();
        assert_eq!(entry["from"], "user_a");
        assert_eq!(entry["candidate"]["candidate"], candidate(1).candidate);

        a.handle_transport_event(&TransportEvent::IceCandidate(candidate(2)))
            .await;
        let doc = relay.snapshot("room").unwrap();
        assert_eq!(doc["candidates"].as_object().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_candidate_entries_are_skipped() {
        let relay = MemoryRelay::new();
        let a = coordinator(&relay, "user_a");
        a.attempt_pairing().await.unwrap();

        let other = relay.client();
        other
            .append_child("room", FIELD_CANDIDATES, json!({"bogus": true}))
            .await
            .unwrap();
        let good = CandidateEntry {
            candidate: candidate(7),
            from: "user_b".into(),
            timestamp: 1,
        };
        other
            .append_child("room", FIELD_CANDIDATES, serde_json::to_value(&good).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*a.transport().ingested.lock().unwrap(), vec![candidate(7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_unsubscribes_then_deletes_after_grace() {
        let relay = MemoryRelay::new();
        let a = coordinator(&relay, "user_a");
        a.attempt_pairing().await.unwrap();
        assert_eq!(relay.subscriber_count(), 2);

        a.handle_transport_event(&TransportEvent::Connected).await;
        assert_eq!(a.phase(), PairingPhase::CleanedUp);
        assert_eq!(relay.subscriber_count(), 0);
        assert!(relay.snapshot("room").is_some());

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(relay.snapshot("room").is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(relay.snapshot("room").is_none());

        // a second confirmation does not schedule another deletion
        a.handle_transport_event(&TransportEvent::Connected).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(relay.delete_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_deletion() {
        let relay = MemoryRelay::new();
        let a = coordinator(&relay, "user_a");
        a.attempt_pairing().await.unwrap();
        a.handle_transport_event(&TransportEvent::Connected).await;

        a.close().await;
        a.close().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(relay.snapshot("room").is_some());
        assert_eq!(relay.delete_count(), 0);
        let closes = a.transport().calls().iter().filter(|c| *c == "close").count();
        assert_eq!(closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_eviction_backoff_ends_the_attempt() {
        let relay = MemoryRelay::new();
        relay
            .client()
            .write(
                "room",
                json!({
                    "offer": {"type": "offer", "sdp": "v=0 old"},
                    "answer": {"type": "answer", "sdp": "v=0 old"},
                    "offerer": "user_gone"
                }),
            )
            .await
            .unwrap();
        let a = Arc::new(coordinator(&relay, "user_a"));

        let attempt = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.attempt_pairing().await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(a.phase(), PairingPhase::AwaitingDocument);
        a.close().await;

        let result = attempt.await.unwrap();
        assert!(matches!(result, Err(PairingError::Closed)));
        assert_eq!(a.phase(), PairingPhase::Closed);
        assert!(!a.transport().calls().contains(&"initialize".to_string()));
        assert!(relay.snapshot("room").is_none());
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_failure_is_swallowed() {
        let relay = MemoryRelay::new();
        let a = coordinator(&relay, "user_a");
        a.attempt_pairing().await.unwrap();
        a.handle_transport_event(&TransportEvent::Connected).await;

        relay.set_offline(true);
        tokio::time::sleep(Duration::from_secs(4)).await;
        relay.set_offline(false);
        assert!(relay.snapshot("room").is_some());
        assert_eq!(a.phase(), PairingPhase::CleanedUp);
    }
}
