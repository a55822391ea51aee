use crate::error::{Error, Result};
use crate::peer::events::{PeerEvent, ScopedDispatcher};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub const CHAT_LABEL: &str = "chat";

/// Slot holding the one data channel of a connection.
pub type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// Wires open/close/message observers and stores the channel in `slot`.
pub fn attach_dc(dc: &Arc<RTCDataChannel>, slot: &ChannelSlot, events: &ScopedDispatcher) {
    let label = dc.label().to_string();
    debug!(channel = %label, "attaching data channel");

    if let Some(previous) = slot.lock().replace(dc.clone()) {
        if !Arc::ptr_eq(&previous, dc) {
            warn!(channel = %previous.label(), "replacing an existing data channel");
        }
    }

    dc.on_open(Box::new({
        let events = events.clone();
        let label = label.clone();
        move || {
            info!(channel = %label, "data channel opened");
            events.emit(PeerEvent::ChannelOpened {
                label: label.clone(),
            });
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let events = events.clone();
        let label = label.clone();
        move || {
            info!(channel = %label, "data channel closed");
            events.emit(PeerEvent::ChannelClosed {
                label: label.clone(),
            });
            Box::pin(async {})
        }
    }));

    dc.on_error(Box::new({
        let label = label.clone();
        move |err| {
            warn!(channel = %label, error = %err, "data channel error");
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let events = events.clone();
        move |msg: DataChannelMessage| {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            if !msg.is_string {
                debug!(len = msg.data.len(), "binary message decoded as text");
            }
            events.emit(PeerEvent::Message(text));
            Box::pin(async {})
        }
    }));
}

/// Sends text on an open channel.
pub async fn send_text(slot: &ChannelSlot, text: &str) -> Result<()> {
    let dc = slot.lock().clone().ok_or(Error::ChannelNotReady)?;
    if dc.ready_state() != RTCDataChannelState::Open {
        return Err(Error::ChannelNotReady);
    }
    dc.send_text(text.to_string())
        .await
        .map_err(|e| Error::Network(format!("data channel send failed: {e}")))?;
    Ok(())
}

/// Takes the channel out of the slot and closes it.
pub async fn close_slot(slot: &ChannelSlot) {
    let dc = slot.lock().take();
    if let Some(dc) = dc {
        if let Err(err) = dc.close().await {
            debug!(error = %err, "data channel close failed");
        }
    }
}
