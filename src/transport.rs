//! The narrow handle the pairing coordinator holds on a negotiator.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::AppMessage;
use crate::peer::types::{IceCandidate, SessionDescription};

/// Events a negotiator reports to its owner, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Channel availability with a human-readable reason.
    StatusChanged { connected: bool, reason: String },
    /// A whole application message from the peer.
    Message(AppMessage),
    /// A locally discovered network path to publish to the peer.
    IceCandidate(IceCandidate),
    /// Fired once, a short while after the channel opened, so relay state
    /// can be disposed of.
    Connected,
}

/// Capability-limited view of a point-to-point connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Allocates a fresh connection, replacing any previous one.
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Opens the data channel and produces the local offer.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Applies the remote offer and produces the local answer.
    async fn receive_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Applies the remote answer.
    ///
    /// Returns `Ok(false)` without touching the connection unless a local
    /// offer is outstanding, so duplicate deliveries are harmless.
    async fn receive_answer(&self, answer: SessionDescription) -> Result<bool, TransportError>;

    /// Best-effort; failures are logged and discarded.
    async fn add_ice_candidate(&self, candidate: IceCandidate);

    /// Sends only while the channel is open. Never queues.
    async fn send_message(&self, message: &AppMessage) -> bool;

    fn is_open(&self) -> bool;

    /// Tears everything down. Idempotent.
    async fn close(&self);
}
