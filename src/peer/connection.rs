use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::{attach_dc, close_slot, send_text, ChannelSlot, CHAT_LABEL};
use crate::peer::events::{EventDispatcher, PeerEvent, ScopedDispatcher};
use crate::peer::ice::{analyze_candidates, rtc_config, status_from_ice};
use crate::peer::media::{CapturedDisplay, DisplaySource};
use crate::peer::types::{ConnectionStatus, SessionDescription, SurfaceKind};
use crate::utils::random_id;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Identifies one peer connection instance created by a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: String,
    pub generation: u64,
}

struct ScreenShare {
    capture: CapturedDisplay,
    watcher: JoinHandle<()>,
}

struct ActiveConnection {
    handle: ConnectionHandle,
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    events: ScopedDispatcher,
    screen: Mutex<Option<ScreenShare>>,
}

/// Owns the one peer connection of a chat or screen-share surface.
///
/// Status is written only from here (ICE callbacks and `close`) and can be
/// observed through [`status`](Self::status) or the event stream.
pub struct PeerConnectionManager {
    kind: SurfaceKind,
    config: PeerConfig,
    api: API,
    dispatcher: EventDispatcher,
    generation: Arc<AtomicU64>,
    active: Mutex<Option<Arc<ActiveConnection>>>,
}

impl PeerConnectionManager {
    pub fn new(kind: SurfaceKind, config: PeerConfig) -> Result<Self> {
        let api = build_api(&config)?;
        Ok(Self {
            kind,
            config,
            api,
            dispatcher: EventDispatcher::new(),
            generation: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.dispatcher.status()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.dispatcher.current_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.dispatcher.subscribe()
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.active.lock().as_ref().map(|a| a.handle.clone())
    }

    fn current(&self) -> Option<Arc<ActiveConnection>> {
        self.active.lock().clone()
    }

    /// Allocates a fresh peer connection, closing the previous one first.
    pub async fn create_connection(&self) -> Result<ConnectionHandle> {
        let previous = self.active.lock().take();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = previous {
            info!(id = %previous.handle.id, "replacing peer connection");
            teardown(&previous).await;
        }

        let rtc = rtc_config(&self.config.ice_servers)?;
        let pc = Arc::new(self.api.new_peer_connection(rtc).await?);
        let events =
            ScopedDispatcher::new(self.dispatcher.clone(), generation, self.generation.clone());
        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        let handle = ConnectionHandle {
            id: random_id(),
            generation,
        };

        register_callbacks(&pc, &channel, &events);
        self.dispatcher.set_status(ConnectionStatus::Disconnected);

        let active = Arc::new(ActiveConnection {
            handle: handle.clone(),
            pc,
            channel,
            events,
            screen: Mutex::new(None),
        });
        *self.active.lock() = Some(active);
        info!(id = %handle.id, generation, kind = ?self.kind, "peer connection created");
        Ok(handle)
    }

    /// Opens the surface's outgoing channel and commits a local offer.
    ///
    /// Only valid on a connection that has not negotiated yet.
    pub async fn create_local_offer(&self) -> Result<SessionDescription> {
        let active = self.current().ok_or(Error::Closed)?;
        let pc = &active.pc;
        if pc.signaling_state() != RTCSignalingState::Stable
            || pc.local_description().await.is_some()
            || pc.remote_description().await.is_some()
        {
            return Err(Error::Negotiation(
                "a local offer needs a freshly created connection".into(),
            ));
        }

        match self.kind {
            SurfaceKind::Chat => {
                let dc: Arc<RTCDataChannel> = pc.create_data_channel(CHAT_LABEL, None).await?;
                attach_dc(&dc, &active.channel, &active.events);
            }
            SurfaceKind::ScreenShare => {
                pc.add_transceiver_from_kind(RTPCodecType::Video, None)
                    .await?;
            }
        }

        let offer = pc.create_offer(None).await?;
        let desc = self.commit_local(&active, offer).await?;
        info!(id = %active.handle.id, "local offer created");
        Ok(desc)
    }

    /// Applies a description from the peer; an offer is answered and the
    /// committed answer returned.
    pub async fn apply_remote_description(
        &self,
        remote: &SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        let rtc = remote.to_rtc()?;

        let mut active = match self.current() {
            Some(active) => active,
            None => {
                self.create_connection().await?;
                self.current().ok_or(Error::Closed)?
            }
        };

        if remote.is_offer() && active.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            info!(id = %active.handle.id, "remote offer wins; abandoning our own offer");
            self.create_connection().await?;
            active = self.current().ok_or(Error::Closed)?;
        }

        active.pc.set_remote_description(rtc).await?;
        debug!(id = %active.handle.id, kind = ?remote.kind(), "remote description applied");

        if !remote.is_offer() {
            return Ok(None);
        }
        let answer = active.pc.create_answer(None).await?;
        let desc = self.commit_local(&active, answer).await?;
        info!(id = %active.handle.id, "answer created");
        Ok(Some(desc))
    }

    /// Sets the local description and waits (bounded) for ICE gathering so
    /// the returned description carries its candidates.
    async fn commit_local(
        &self,
        active: &ActiveConnection,
        desc: RTCSessionDescription,
    ) -> Result<SessionDescription> {
        let pc = &active.pc;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(desc).await?;
        if timeout(self.config.gather_timeout, gathered.recv())
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.config.gather_timeout.as_millis() as u64,
                "ICE gathering timed out; using the candidates found so far"
            );
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("no local description after commit".into()))?;
        let desc = SessionDescription::try_from(local)?;
        analyze_candidates(desc.sdp());
        active
            .events
            .emit(PeerEvent::DescriptionGathered(desc.clone()));
        Ok(desc)
    }

    /// Writes text to the chat channel.
    pub async fn send(&self, text: &str) -> Result<()> {
        let active = self.current().ok_or(Error::ChannelNotReady)?;
        send_text(&active.channel, text).await
    }

    pub fn data_channel_open(&self) -> bool {
        let Some(active) = self.current() else {
            return false;
        };
        let dc = active.channel.lock().clone();
        dc.is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    pub fn is_screen_sharing(&self) -> bool {
        let Some(active) = self.current() else {
            return false;
        };
        let sharing = active
            .screen
            .lock()
            .as_ref()
            .is_some_and(|s| !s.capture.is_ended());
        sharing
    }

    /// Captures the display and puts its track on the connection.
    ///
    /// An existing outgoing video sender gets its track replaced; when the
    /// capture ends the track is detached again.
    pub async fn start_screen_share(&self, source: &dyn DisplaySource) -> Result<()> {
        if self.kind != SurfaceKind::ScreenShare {
            return Err(Error::MediaAccess(
                "screen sharing needs a screen-share surface".into(),
            ));
        }
        let active = self.current().ok_or(Error::Closed)?;
        let capture = source.capture().await?;
        let track_id = capture.track_id().to_string();

        let sender = match attach_video(&active.pc, capture.track()).await {
            Ok(sender) => sender,
            Err(err) => {
                capture.release();
                return Err(err);
            }
        };

        let watcher = tokio::spawn(detach_when_ended(
            sender,
            capture.ended_signal(),
            track_id.clone(),
        ));
        let previous = active.screen.lock().replace(ScreenShare { capture, watcher });
        if let Some(previous) = previous {
            previous.watcher.abort();
            previous.capture.release();
        }
        info!(track = %track_id, "screen sharing started");
        Ok(())
    }

    /// Track id on each video sender of the current connection.
    #[cfg(test)]
    async fn video_track_ids(&self) -> Vec<Option<String>> {
        let Some(active) = self.current() else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        for transceiver in active.pc.get_transceivers().await {
            if transceiver.kind() == RTPCodecType::Video {
                let track = transceiver.sender().await.track().await;
                ids.push(track.map(|t| t.id().to_owned()));
            }
        }
        ids
    }

    /// Releases the connection, its channel and any capture. Safe to call
    /// any number of times.
    pub async fn close(&self) {
        let active = self.active.lock().take();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = active {
            info!(id = %active.handle.id, "closing peer connection");
            teardown(&active).await;
        }
        self.dispatcher.set_status(ConnectionStatus::Disconnected);
    }
}

fn build_api(config: &PeerConfig) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Error::Config(format!("failed to register codecs: {e}")))?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| Error::Config(format!("failed to register interceptors: {e}")))?;
    let mut setting = SettingEngine::default();
    setting.set_include_loopback_candidate(config.include_loopback);
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}

fn register_callbacks(
    pc: &Arc<RTCPeerConnection>,
    channel: &ChannelSlot,
    events: &ScopedDispatcher,
) {
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => dump_candidate("local", &c),
            None => debug!("ICE candidate gathering completed"),
        }
        Box::pin(async {})
    }));

    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_ice_connection_state_change(Box::new({
        let events = events.clone();
        move |state: RTCIceConnectionState| {
            info!(state = %state, "ICE connection state changed");
            events.set_status(status_from_ice(state));
            let weak = weak.clone();
            Box::pin(async move {
                if state == RTCIceConnectionState::Connected {
                    if let Some(pc) = weak.upgrade() {
                        dump_selected_pair(&pc, "CONNECTED").await;
                    }
                }
            })
        }
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(state = %state, "peer connection state changed");
        Box::pin(async {})
    }));

    pc.on_data_channel(Box::new({
        let channel = channel.clone();
        let events = events.clone();
        move |dc: Arc<RTCDataChannel>| {
            if events.is_current() {
                attach_dc(&dc, &channel, &events);
            }
            Box::pin(async {})
        }
    }));

    pc.on_track(Box::new({
        let events = events.clone();
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = track.kind().to_string();
            let id = track.id();
            info!(kind = %kind, id = %id, "remote track received");
            events.emit(PeerEvent::TrackReceived { kind, id });
            Box::pin(async {})
        }
    }));
}

async fn attach_video(
    pc: &RTCPeerConnection,
    track: Arc<dyn TrackLocal + Send + Sync>,
) -> Result<Arc<RTCRtpSender>> {
    // a detached sender has no track but keeps its video transceiver
    for transceiver in pc.get_transceivers().await {
        if transceiver.kind() == RTPCodecType::Video {
            let sender = transceiver.sender().await;
            sender.replace_track(Some(track)).await?;
            return Ok(sender);
        }
    }
    // no outgoing video yet; the peer only sees it after renegotiation
    Ok(pc.add_track(track).await?)
}

async fn detach_when_ended(
    sender: Arc<RTCRtpSender>,
    mut ended: watch::Receiver<bool>,
    track_id: String,
) {
    while !*ended.borrow_and_update() {
        if ended.changed().await.is_err() {
            break;
        }
    }
    let still_ours = match sender.track().await {
        Some(current) => current.id() == track_id,
        None => false,
    };
    if !still_ours {
        debug!(track = %track_id, "screen track already replaced");
        return;
    }
    if let Err(err) = sender.replace_track(None).await {
        debug!(track = %track_id, error = %err, "failed to detach screen track");
    }
    info!(track = %track_id, "screen sharing stopped");
}

async fn teardown(active: &ActiveConnection) {
    let screen = active.screen.lock().take();
    if let Some(screen) = screen {
        screen.watcher.abort();
        screen.capture.release();
    }
    close_slot(&active.channel).await;
    if let Err(err) = active.pc.close().await {
        warn!(id = %active.handle.id, error = %err, "peer connection close failed");
    }
}
