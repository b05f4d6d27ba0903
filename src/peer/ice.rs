use std::collections::BTreeSet;

use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;

use crate::peer::state::PeerContext;
use crate::peer::types::{CandidateKind, IceCandidate};

/// Remote candidates seen by one connection.
///
/// `pending` holds candidates that arrived before any remote description;
/// `applied` is the deduplicated set the ICE agent accepted, so the final
/// set does not depend on delivery order.
///
/// `remote_ready` flips under the same lock that drains `pending`, so a
/// candidate is either queued before the drain or applied directly after it.
#[derive(Debug, Default)]
pub(crate) struct RemoteCandidates {
    pending: Vec<IceCandidate>,
    applied: BTreeSet<IceCandidate>,
    remote_ready: bool,
}

impl RemoteCandidates {
    /// Hands the candidate back for immediate use once a remote description
    /// is set; queues it otherwise.
    pub(crate) fn admit(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            Some(candidate)
        } else {
            self.queue(candidate);
            None
        }
    }

    /// Marks the remote description as set and returns what was queued.
    pub(crate) fn drain_for_remote(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn queue(&mut self, candidate: IceCandidate) {
        if !self.applied.contains(&candidate) && !self.pending.contains(&candidate) {
            self.pending.push(candidate);
        }
    }

    /// Returns `false` when the candidate was already applied.
    pub(crate) fn record(&mut self, candidate: IceCandidate) -> bool {
        self.applied.insert(candidate)
    }

    pub(crate) fn is_applied(&self, candidate: &IceCandidate) -> bool {
        self.applied.contains(candidate)
    }

    pub(crate) fn applied(&self) -> Vec<IceCandidate> {
        self.applied.iter().cloned().collect()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.applied.clear();
        self.remote_ready = false;
    }
}

/// Ingests a remote candidate. Never fails: a candidate may legitimately
/// arrive after negotiation finished over another path.
pub(crate) async fn add_ice_candidate(ctx: &PeerContext, candidate: IceCandidate) {
    if candidate.is_end_of_candidates() {
        debug!("remote end-of-candidates marker");
        return;
    }

    let admitted = {
        let mut candidates = ctx.candidates();
        let admitted = candidates.admit(candidate);
        if admitted.is_none() {
            debug!(
                queued = candidates.pending_len(),
                "no remote description yet, queuing remote candidate"
            );
        }
        admitted
    };
    let Some(candidate) = admitted else { return };

    match ctx.peer() {
        Some(pc) => apply_one(ctx, &pc, candidate).await,
        None => debug!(candidate = %candidate.candidate, "peer connection gone, candidate dropped"),
    }
}

/// Applies everything queued before the remote description was set. Call
/// right after setting it; later candidates then skip the queue.
pub(crate) async fn apply_pending_candidates(ctx: &PeerContext, pc: &RTCPeerConnection) {
    let candidates = ctx.candidates().drain_for_remote();
    if !candidates.is_empty() {
        debug!(count = candidates.len(), "applying queued remote candidates");
    }
    for candidate in candidates {
        apply_one(ctx, pc, candidate).await;
    }
}

async fn apply_one(ctx: &PeerContext, pc: &RTCPeerConnection, candidate: IceCandidate) {
    if ctx.candidates().is_applied(&candidate) {
        debug!(candidate = %candidate.candidate, "duplicate remote candidate ignored");
        return;
    }
    match pc.add_ice_candidate(candidate.clone().into()).await {
        Ok(()) => {
            debug!(candidate = %candidate.candidate, "remote candidate added");
            ctx.candidates().record(candidate);
        }
        Err(e) => {
            warn!(candidate = %candidate.candidate, error = %e, "discarding remote candidate");
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub server_reflexive: usize,
    pub peer_reflexive: usize,
    pub relay: usize,
    pub unknown: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        match candidate.kind() {
            CandidateKind::Host => summary.host += 1,
            CandidateKind::ServerReflexive => summary.server_reflexive += 1,
            CandidateKind::PeerReflexive => summary.peer_reflexive += 1,
            CandidateKind::Relay => summary.relay += 1,
            CandidateKind::Unknown => summary.unknown += 1,
        }
    }

    info!(
        host = summary.host,
        srflx = summary.server_reflexive,
        prflx = summary.peer_reflexive,
        relay = summary.relay,
        "remote candidate analysis"
    );
    if summary.relay == 0 && summary.server_reflexive == 0 {
        debug!("no srflx or relay candidates from peer; connection across NAT may fail");
    }
    summary
}
