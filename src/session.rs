use crate::config::{ClientConfig, NegotiationConfig};
use crate::error::{Error, Result};
use crate::negotiation::{NegotiationLoop, NegotiationOutcome, NegotiationReport};
use crate::peer::connection::PeerConnectionManager;
use crate::peer::events::PeerEvent;
use crate::peer::media::DisplaySource;
use crate::peer::types::{ConnectionStatus, SurfaceKind};
use crate::signaling::{HttpSignalingClient, SignalingService};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of one `connect`, delivered when its negotiation loop ends.
pub struct PendingNegotiation {
    rx: oneshot::Receiver<NegotiationReport>,
}

impl PendingNegotiation {
    /// `None` when the loop was torn down before it could report.
    pub async fn wait(self) -> Option<NegotiationReport> {
        self.rx.await.ok()
    }
}

struct Running {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One chat or screen-share surface between `user` and `contact`.
///
/// Owns the peer connection and at most one negotiation loop. Closing the
/// session (or dropping it) stops the loop and releases the connection.
pub struct Session {
    user: String,
    contact: String,
    negotiation: NegotiationConfig,
    manager: Arc<PeerConnectionManager>,
    signaling: Arc<dyn SignalingService>,
    running: Mutex<Option<Running>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        config: &ClientConfig,
        kind: SurfaceKind,
        user: impl Into<String>,
        contact: impl Into<String>,
        signaling: Arc<dyn SignalingService>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = PeerConnectionManager::new(kind, config.peer.clone())?;
        Ok(Self {
            user: user.into(),
            contact: contact.into(),
            negotiation: config.negotiation,
            manager: Arc::new(manager),
            signaling,
            running: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Session talking to the configured REST signaling service.
    pub fn with_http_signaling(
        config: &ClientConfig,
        kind: SurfaceKind,
        user: impl Into<String>,
        contact: impl Into<String>,
    ) -> Result<Self> {
        let signaling = Arc::new(HttpSignalingClient::from_config(config)?);
        Self::new(config, kind, user, contact, signaling)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub fn kind(&self) -> SurfaceKind {
        self.manager.kind()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.status()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.manager.current_status()
    }

    pub fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.manager.subscribe()
    }

    pub fn manager(&self) -> &PeerConnectionManager {
        &self.manager
    }

    /// The "Connect" action: stops any running loop, rebuilds the peer
    /// connection and starts a fresh negotiation.
    pub async fn connect(&self) -> Result<PendingNegotiation> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.stop_loop().await;
        self.manager.create_connection().await?;

        let (cancel, cancel_rx) = watch::channel(false);
        let (report_tx, report_rx) = oneshot::channel();
        let negotiation = NegotiationLoop::new(
            self.user.clone(),
            self.contact.clone(),
            self.negotiation,
            self.signaling.clone(),
            self.manager.clone(),
        );
        let manager = self.manager.clone();

        let task = tokio::spawn(async move {
            let report = negotiation.run(cancel_rx).await;
            match &report.outcome {
                NegotiationOutcome::Established { invitation } => {
                    info!(%invitation, "negotiation established");
                }
                NegotiationOutcome::Cancelled => debug!("negotiation cancelled"),
                outcome => {
                    warn!(?outcome, "negotiation ended without a session; releasing connection");
                    manager.close().await;
                }
            }
            let _ = report_tx.send(report);
        });

        let previous = self.running.lock().replace(Running { cancel, task });
        if let Some(previous) = previous {
            // an overlapping connect started its loop in the meantime
            debug!("cancelling negotiation from an overlapping connect");
            previous.cancel.send_replace(true);
        }
        Ok(PendingNegotiation { rx: report_rx })
    }

    async fn stop_loop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.send_replace(true);
            if let Err(err) = running.task.await {
                debug!(error = %err, "negotiation task did not finish cleanly");
            }
        }
    }

    /// Sends a chat line. `Ok(false)` means the channel is not open yet and
    /// the message was dropped.
    pub async fn send(&self, text: &str) -> Result<bool> {
        match self.manager.send(text).await {
            Ok(()) => Ok(true),
            Err(Error::ChannelNotReady) => {
                debug!("chat channel not open; message dropped");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn start_screen_share(&self, source: &dyn DisplaySource) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.manager.start_screen_share(source).await
    }

    /// Tears the surface down. Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(user = %self.user, contact = %self.contact, "closing session");
        }
        self.stop_loop().await;
        self.manager.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.send_replace(true);
            running.task.abort();
        }
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // not closed explicitly; release what we can from here
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            runtime.spawn(async move { manager.close().await });
        }
    }
}
