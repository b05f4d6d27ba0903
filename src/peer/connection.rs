use std::sync::{Arc, Weak};

use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::PeerConfig;
use crate::error::TransportError;
use crate::logger::{log_candidate, log_selected_pair};
use crate::peer::data_channel::attach_dc;
use crate::peer::state::{NegotiatorState, PeerContext};
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::transport::TransportEvent;
use crate::utils::add_ice_url_scheme;

/// Builds a peer connection whose callbacks report into `ctx` under
/// `generation`. The offerer opens its data channel later, in `create_offer`;
/// both sides accept an inbound channel.
pub(crate) async fn new_peer(
    ctx: &Arc<PeerContext>,
    config: &PeerConfig,
    generation: u64,
) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let api = APIBuilder::new().build();
    let pc = Arc::new(api.new_peer_connection(rtc_config(&config.ice_servers)).await?);

    pc.on_ice_candidate(Box::new({
        let ctx = Arc::clone(ctx);
        move |cand: Option<RTCIceCandidate>| {
            if ctx.is_current(generation) {
                on_local_candidate(&ctx, cand);
            }
            Box::pin(async {})
        }
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        debug!(?state, "ice gathering state");
        Box::pin(async {})
    }));

    // weak: the handler lives inside the connection it inspects
    let pc_weak: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
    let grace = config.disconnect_grace();
    pc.on_peer_connection_state_change(Box::new({
        let ctx = Arc::clone(ctx);
        move |st: RTCPeerConnectionState| {
            if ctx.is_current(generation) {
                on_connection_state(&ctx, &pc_weak, st, generation, grace);
            }
            Box::pin(async {})
        }
    }));

    let notify_delay = config.connected_notify_delay();
    pc.on_data_channel(Box::new({
        let ctx = Arc::clone(ctx);
        move |dc: Arc<RTCDataChannel>| {
            debug!(label = dc.label(), "inbound data channel");
            attach_dc(&ctx, &dc, generation, notify_delay);
            Box::pin(async {})
        }
    }));

    Ok(pc)
}

fn on_local_candidate(ctx: &PeerContext, cand: Option<RTCIceCandidate>) {
    let Some(c) = cand else {
        debug!("local candidate gathering complete");
        return;
    };
    log_candidate("local", &c);
    match c.to_json() {
        Ok(init) => ctx.emit(TransportEvent::IceCandidate(IceCandidate::from(init))),
        Err(e) => warn!(error = %e, "local candidate could not be serialized"),
    }
}

pub(crate) fn on_connection_state(
    ctx: &Arc<PeerContext>,
    pc: &Weak<RTCPeerConnection>,
    st: RTCPeerConnectionState,
    generation: u64,
    grace: std::time::Duration,
) {
    info!(state = %st, "peer connection state");

    match st {
        RTCPeerConnectionState::Connected => ctx.cancel_disconnect_task(),

        RTCPeerConnectionState::Disconnected => {
            if ctx.has_disconnect_task() {
                debug!("disconnect watchdog already pending");
                return;
            }
            // a return to Connected aborts this before it fires
            let handle = tokio::spawn({
                let ctx = Arc::clone(ctx);
                let pc = pc.clone();
                async move {
                    debug!(grace_secs = grace.as_secs(), "disconnect grace started");
                    sleep(grace).await;
                    if let Some(pc) = pc.upgrade() {
                        log_selected_pair(&pc, "after-grace").await;
                    }
                    ctx.fail(generation, "Connection lost");
                }
            });
            ctx.set_disconnect_task(handle);
        }

        RTCPeerConnectionState::Failed => {
            ctx.cancel_disconnect_task();
            if let Some(pc) = pc.upgrade() {
                tokio::spawn(async move { log_selected_pair(&pc, "failed").await });
            }
            ctx.fail(generation, "Connection failed");
        }

        RTCPeerConnectionState::Closed => {
            if ctx.state() != NegotiatorState::Closed {
                debug!("peer connection closed underneath the negotiator");
            }
        }

        _ => {}
    }
}

/// Peer connection configuration for the given ICE servers.
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub(crate) fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
