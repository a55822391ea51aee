#![allow(dead_code)]

use async_trait::async_trait;
use contact_rtc::config::{ClientConfig, NegotiationConfig};
use contact_rtc::peer::{ConnectionStatus, PeerEvent, ServerConfig};
use contact_rtc::signaling::{Invitation, InvitationId, SignalingService};
use contact_rtc::{Error, Result, SessionDescription};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

/// Settings for peers talking to each other on this host.
pub fn loopback_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.peer.ice_servers = vec![ServerConfig::stun("stun:127.0.0.1:3478")];
    config.peer.gather_timeout = Duration::from_secs(2);
    config.peer.include_loopback = true;
    config.negotiation = NegotiationConfig {
        max_attempts: 40,
        retry_delay: Duration::from_millis(250),
    };
    config
}

/// Signaling service kept in memory, shared by both sides of a test.
#[derive(Default)]
pub struct MemorySignaling {
    invitations: Mutex<Vec<Invitation>>,
    next_id: Mutex<u64>,
    list_calls: Mutex<u32>,
}

impl MemorySignaling {
    pub fn all(&self) -> Vec<Invitation> {
        self.invitations.lock().clone()
    }

    pub fn accepted_for(&self, username: &str) -> usize {
        self.invitations
            .lock()
            .iter()
            .filter(|inv| inv.user_2 == username && inv.accepted)
            .count()
    }

    pub fn list_calls(&self) -> u32 {
        *self.list_calls.lock()
    }
}

#[async_trait]
impl SignalingService for MemorySignaling {
    async fn publish(&self, from: &str, to: &str, description: &SessionDescription) -> Result<()> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.invitations.lock().push(Invitation {
            id: InvitationId::new(id.to_string()),
            user_1: from.into(),
            user_2: to.into(),
            offer: description.to_blob()?,
            accepted: false,
        });
        Ok(())
    }

    async fn list_invitations(&self, username: &str) -> Result<Vec<Invitation>> {
        *self.list_calls.lock() += 1;
        let found: Vec<_> = self
            .invitations
            .lock()
            .iter()
            .filter(|inv| inv.user_2 == username && !inv.accepted)
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(found)
    }

    async fn accept_invitation(&self, id: &InvitationId) -> Result<()> {
        let mut invitations = self.invitations.lock();
        let inv = invitations
            .iter_mut()
            .find(|inv| &inv.id == id)
            .ok_or(Error::NotFound)?;
        inv.accepted = true;
        Ok(())
    }
}

pub async fn wait_for_status(
    mut status: watch::Receiver<ConnectionStatus>,
    want: ConnectionStatus,
    within: Duration,
) -> bool {
    let reached = matches!(timeout(within, status.wait_for(|s| *s == want)).await, Ok(Ok(_)));
    reached
}

pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<PeerEvent>,
    within: Duration,
    mut pred: F,
) -> Option<PeerEvent>
where
    F: FnMut(&PeerEvent) -> bool,
{
    timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
