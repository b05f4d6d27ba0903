use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::PeerConfig;
use crate::error::TransportError;
use crate::message::AppMessage;
use crate::peer::connection::new_peer;
use crate::peer::data_channel::attach_dc;
use crate::peer::ice::{add_ice_candidate, apply_pending_candidates};
use crate::peer::state::{NegotiatorState, PeerContext, DATA_CHANNEL_LABEL};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::transport::{Transport, TransportEvent};

/// Transport negotiator over one `webrtc` peer connection.
///
/// Events are delivered on the receiver returned by [`WebRtcPeer::new`].
pub struct WebRtcPeer {
    config: PeerConfig,
    ctx: Arc<PeerContext>,
    // serialises description changes; candidates and sends bypass it
    negotiation: Mutex<()>,
}

impl WebRtcPeer {
    pub fn new(config: PeerConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Self {
            config,
            ctx: Arc::new(PeerContext::new(tx)),
            negotiation: Mutex::new(()),
        };
        (peer, rx)
    }

    pub fn state(&self) -> NegotiatorState {
        self.ctx.state()
    }

    /// Remote candidates the ICE agent accepted, in a stable order.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.ctx.candidates().applied()
    }

    /// Remote candidates still waiting for a remote description.
    pub fn pending_candidates(&self) -> usize {
        self.ctx.candidates().pending_len()
    }

    fn negotiating_peer(&self, op: &'static str) -> Result<Arc<RTCPeerConnection>, TransportError> {
        match self.ctx.state() {
            NegotiatorState::Uninitialized => Err(TransportError::NotInitialized),
            state if !state.can_negotiate() => Err(TransportError::InvalidState { op, state }),
            _ => self.ctx.peer().ok_or(TransportError::NotInitialized),
        }
    }

    async fn teardown(&self) {
        self.ctx.abort_tasks();
        if let Some(dc) = self.ctx.set_data_channel(None) {
            if let Err(e) = dc.close().await {
                debug!(error = %e, "data channel close");
            }
        }
        if let Some(pc) = self.ctx.set_peer(None) {
            if let Err(e) = pc.close().await {
                debug!(error = %e, "peer connection close");
            }
        }
        self.ctx.candidates().clear();
    }
}

#[async_trait]
impl Transport for WebRtcPeer {
    async fn initialize(&self) -> Result<(), TransportError> {
        let _guard = self.negotiation.lock().await;

        // silence the old connection's callbacks before tearing it down
        let generation = self.ctx.next_generation();
        self.teardown().await;

        let pc = new_peer(&self.ctx, &self.config, generation).await?;
        self.ctx.set_peer(Some(pc));
        self.ctx.transition(NegotiatorState::on_initialize);
        info!(generation, "peer connection initialized");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let _guard = self.negotiation.lock().await;
        let pc = self.negotiating_peer("create_offer")?;

        if self.ctx.data_channel().is_none() {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
            attach_dc(
                &self.ctx,
                &dc,
                self.ctx.generation(),
                self.config.connected_notify_delay(),
            );
        }

        debug!("creating offer");
        let offer = pc.create_offer(None).await?;
        let local = SessionDescription::from_rtc(&offer)?;
        pc.set_local_description(offer).await?;
        Ok(local)
    }

    async fn receive_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let _guard = self.negotiation.lock().await;
        let pc = self.negotiating_peer("receive_offer")?;

        let remote = offer.to_rtc()?;
        pc.set_remote_description(remote).await?;
        apply_pending_candidates(&self.ctx, &pc).await;

        debug!("creating answer");
        let answer = pc.create_answer(None).await?;
        let local = SessionDescription::from_rtc(&answer)?;
        pc.set_local_description(answer).await?;
        Ok(local)
    }

    async fn receive_answer(&self, answer: SessionDescription) -> Result<bool, TransportError> {
        let _guard = self.negotiation.lock().await;
        let pc = match self.ctx.state() {
            NegotiatorState::Uninitialized => return Err(TransportError::NotInitialized),
            NegotiatorState::Negotiating => self.ctx.peer().ok_or(TransportError::NotInitialized)?,
            state => {
                debug!(?state, "answer ignored, not negotiating");
                return Ok(false);
            }
        };

        let signaling = pc.signaling_state();
        if signaling != RTCSignalingState::HaveLocalOffer {
            debug!(%signaling, "answer ignored, no outstanding local offer");
            return Ok(false);
        }

        let remote = answer.to_rtc()?;
        pc.set_remote_description(remote).await?;
        apply_pending_candidates(&self.ctx, &pc).await;
        info!("remote answer applied");
        Ok(true)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) {
        match self.ctx.state() {
            NegotiatorState::Negotiating | NegotiatorState::Connected => {
                add_ice_candidate(&self.ctx, candidate).await
            }
            state => debug!(?state, candidate = %candidate.candidate, "remote candidate discarded"),
        }
    }

    async fn send_message(&self, message: &AppMessage) -> bool {
        if self.ctx.state() != NegotiatorState::Connected {
            debug!("send skipped, channel not open");
            return false;
        }
        let Some(dc) = self.ctx.data_channel() else {
            return false;
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return false;
        }
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "message could not be encoded");
                return false;
            }
        };
        match dc.send_text(text).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "data channel send failed");
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.ctx.state() == NegotiatorState::Connected
            && self
                .ctx
                .data_channel()
                .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    async fn close(&self) {
        let _guard = self.negotiation.lock().await;
        // the peer may already have moved us to Closed by closing the
        // channel; the connection is still ours to release
        let reported = self.ctx.transition(NegotiatorState::on_close).is_some();
        if self.ctx.peer().is_some() || self.ctx.data_channel().is_some() {
            self.teardown().await;
        }
        if reported {
            info!("transport closed");
            self.ctx.emit_status(false, "Disconnected");
        }
    }
}
