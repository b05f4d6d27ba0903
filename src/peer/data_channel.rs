use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::message::AppMessage;
use crate::peer::ice::analyze_candidates;
use crate::peer::state::{NegotiatorState, PeerContext};
use crate::transport::TransportEvent;

/// Wires the one data channel of this connection, whether opened locally
/// (offerer) or received from the peer (answerer).
pub(crate) fn attach_dc(
    ctx: &Arc<PeerContext>,
    dc: &Arc<RTCDataChannel>,
    generation: u64,
    notify_delay: Duration,
) {
    if !ctx.is_current(generation) {
        debug!(label = dc.label(), "data channel from a replaced connection ignored");
        return;
    }
    if ctx.set_data_channel(Some(Arc::clone(dc))).is_some() {
        warn!(label = dc.label(), "second data channel replaces the first");
    }

    dc.on_open(Box::new({
        let ctx = Arc::clone(ctx);
        move || {
            if ctx.is_current(generation)
                && ctx.transition(NegotiatorState::on_channel_open).is_some()
            {
                info!("data channel open");
                ctx.emit_status(true, "Connected");
                analyze_candidates(&ctx.candidates().applied());

                // give the relay time to flush candidate events before the
                // owner tears the session document down
                let handle = tokio::spawn({
                    let ctx = Arc::clone(&ctx);
                    async move {
                        sleep(notify_delay).await;
                        if ctx.is_current(generation) && ctx.state() == NegotiatorState::Connected {
                            ctx.emit(TransportEvent::Connected);
                        }
                    }
                });
                ctx.set_connected_task(handle);
            }
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let ctx = Arc::clone(ctx);
        move || {
            if ctx.is_current(generation)
                && ctx.transition(NegotiatorState::on_channel_close).is_some()
            {
                info!("data channel closed");
                ctx.abort_tasks();
                ctx.emit_status(false, "Disconnected");
            }
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let ctx = Arc::clone(ctx);
        move |msg: DataChannelMessage| {
            if ctx.is_current(generation) {
                handle_message(&ctx, &msg);
            }
            Box::pin(async {})
        }
    }));
}

fn handle_message(ctx: &PeerContext, msg: &DataChannelMessage) {
    let raw = match std::str::from_utf8(&msg.data) {
        Ok(raw) => raw,
        Err(_) => {
            warn!(len = msg.data.len(), "dropping non-utf8 message");
            return;
        }
    };
    match AppMessage::from_json(raw) {
        Ok(AppMessage::Unknown) => debug!("ignoring message of unknown type"),
        Ok(message) => ctx.emit(TransportEvent::Message(message)),
        Err(e) => warn!(error = %e, len = raw.len(), "dropping undecodable message"),
    }
}
