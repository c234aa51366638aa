use crate::peer::link::LinkInner;
use crate::peer::types::PeerEvent;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// общий обработчик data-channel
pub(crate) fn attach_dc(inner: &Arc<LinkInner>, dc: Arc<RTCDataChannel>) {
    if inner.is_destroyed() {
        tokio::spawn(async move {
            let _ = dc.close().await;
        });
        return;
    }

    debug!(link = %inner.id, label = dc.label(), "attaching data channel");
    *inner.data_channel.lock() = Some(Arc::clone(&dc));

    let weak = Arc::downgrade(inner);
    dc.on_open(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
            debug!(link = %inner.id, "data channel opened");
            inner.mark_connected("data-channel");
        }
        Box::pin(async {})
    }));

    let weak = Arc::downgrade(inner);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if let Some(inner) = weak.upgrade() {
            inner.emit(PeerEvent::Data(msg.data));
        }
        Box::pin(async {})
    }));

    let weak = Arc::downgrade(inner);
    dc.on_close(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
            debug!(link = %inner.id, "data channel closed");
            inner.destroy_detached(None);
        }
        Box::pin(async {})
    }));

    let weak = Arc::downgrade(inner);
    dc.on_error(Box::new(move |err| {
        if let Some(inner) = weak.upgrade() {
            warn!(link = %inner.id, error = %err, "data channel error");
        }
        Box::pin(async {})
    }));

    // канал со стороны responder может прийти уже открытым
    if dc.ready_state() == RTCDataChannelState::Open {
        inner.mark_connected("data-channel");
    }
}
