//! Offer/answer rendezvous between two contacts.
//!
//! Both sides run the same loop: look for an invitation from the contact and
//! answer it, otherwise publish one offer of our own and keep polling. The
//! first invitation observed wins; a side whose offer is never consumed simply
//! abandons it. Answers left over from an abandoned offer are accepted unused
//! before a new offer goes out.

use crate::config::NegotiationConfig;
use crate::error::{Error, Result};
use crate::peer::connection::PeerConnectionManager;
use crate::peer::types::SessionDescription;
use crate::signaling::{Invitation, InvitationId, SignalingService};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// The peer-connection side of negotiation.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn create_local_offer(&self) -> Result<SessionDescription>;

    async fn apply_remote_description(
        &self,
        remote: &SessionDescription,
    ) -> Result<Option<SessionDescription>>;
}

#[async_trait]
impl Negotiator for PeerConnectionManager {
    async fn create_local_offer(&self) -> Result<SessionDescription> {
        PeerConnectionManager::create_local_offer(self).await
    }

    async fn apply_remote_description(
        &self,
        remote: &SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        PeerConnectionManager::apply_remote_description(self, remote).await
    }
}

/// Everything one loop instance tracks between attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationState {
    /// Attempts started so far (1-based once running).
    pub attempt: u32,
    /// Our own offer has been published.
    pub offer_created: bool,
    pub accepted: Option<InvitationId>,
}

#[derive(Debug)]
pub enum NegotiationOutcome {
    Established { invitation: InvitationId },
    Exhausted,
    Aborted(Error),
    Cancelled,
}

impl NegotiationOutcome {
    pub fn is_established(&self) -> bool {
        matches!(self, NegotiationOutcome::Established { .. })
    }
}

#[derive(Debug)]
pub struct NegotiationReport {
    pub outcome: NegotiationOutcome,
    pub state: NegotiationState,
}

enum Step {
    Established(InvitationId),
    Waiting,
}

/// An applied invitation whose answer or acceptance has not reached the
/// service yet.
struct PendingReply {
    invitation: InvitationId,
    answer: Option<SessionDescription>,
    superseded: Vec<InvitationId>,
}

pub struct NegotiationLoop {
    user: String,
    contact: String,
    config: NegotiationConfig,
    signaling: Arc<dyn SignalingService>,
    negotiator: Arc<dyn Negotiator>,
    state: NegotiationState,
    // created but not yet published
    pending_offer: Option<SessionDescription>,
    pending_reply: Option<PendingReply>,
}

impl NegotiationLoop {
    pub fn new(
        user: impl Into<String>,
        contact: impl Into<String>,
        config: NegotiationConfig,
        signaling: Arc<dyn SignalingService>,
        negotiator: Arc<dyn Negotiator>,
    ) -> Self {
        Self {
            user: user.into(),
            contact: contact.into(),
            config,
            signaling,
            negotiator,
            state: NegotiationState::default(),
            pending_offer: None,
            pending_reply: None,
        }
    }

    /// Runs attempts until an invitation is accepted, the budget is spent, an
    /// unexpected error occurs, or `cancel` flips to `true`.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> NegotiationReport {
        info!(
            user = %self.user,
            contact = %self.contact,
            max_attempts = self.config.max_attempts,
            "negotiation started"
        );

        while self.state.attempt < self.config.max_attempts {
            self.state.attempt += 1;
            info!(attempt = self.state.attempt, "negotiation attempt");

            match until_cancelled(&mut cancel, self.attempt_once()).await {
                None => return self.finish(NegotiationOutcome::Cancelled),
                Some(Ok(Step::Established(invitation))) => {
                    self.state.accepted = Some(invitation.clone());
                    return self.finish(NegotiationOutcome::Established { invitation });
                }
                Some(Ok(Step::Waiting)) => {}
                Some(Err(err)) => {
                    warn!(attempt = self.state.attempt, error = %err, "negotiation aborted");
                    return self.finish(NegotiationOutcome::Aborted(err));
                }
            }

            if until_cancelled(&mut cancel, sleep(self.config.retry_delay))
                .await
                .is_none()
            {
                return self.finish(NegotiationOutcome::Cancelled);
            }
        }

        info!(attempts = self.state.attempt, "max attempts reached");
        self.finish(NegotiationOutcome::Exhausted)
    }

    fn finish(self, outcome: NegotiationOutcome) -> NegotiationReport {
        debug!(?outcome, state = ?self.state, "negotiation finished");
        NegotiationReport {
            outcome,
            state: self.state,
        }
    }

    async fn attempt_once(&mut self) -> Result<Step> {
        if self.pending_reply.is_some() {
            return Ok(self.finish_reply().await?.map_or(Step::Waiting, Step::Established));
        }

        let invitations = match self.signaling.list_invitations(&self.user).await {
            Ok(list) => list,
            Err(Error::NotFound) => {
                debug!("no invitation yet");
                Vec::new()
            }
            Err(err) if err.is_transient() => {
                warn!(error = %err, "listing invitations failed; retrying");
                return Ok(Step::Waiting);
            }
            Err(err) => return Err(err),
        };

        if !self.state.offer_created {
            let stale: Vec<_> = invitations
                .iter()
                .filter(|inv| self.is_open_from_contact(inv) && is_answer(inv))
                .map(|inv| inv.id.clone())
                .collect();
            if !stale.is_empty() {
                info!(count = stale.len(), "discarding answers to an earlier offer");
                self.discard(&stale).await;
            }
        }

        if let Some(invitation) = self.pick(&invitations) {
            info!(id = %invitation.id, from = %invitation.user_1, "found invitation");
            // the contact's other records lost to this answer
            let superseded = if is_answer(invitation) {
                invitations
                    .iter()
                    .filter(|inv| self.is_open_from_contact(inv) && inv.id != invitation.id)
                    .map(|inv| inv.id.clone())
                    .collect()
            } else {
                Vec::new()
            };
            return Ok(self
                .respond(invitation, superseded)
                .await?
                .map_or(Step::Waiting, Step::Established));
        }

        self.ensure_offer().await?;
        Ok(Step::Waiting)
    }

    /// First unaccepted invitation from the contact; once our own offer is
    /// out, an answer to it beats a competing offer.
    ///
    /// When both offers are out only the side whose username sorts first
    /// answers; the other keeps waiting for that answer.
    ///
    /// Before our offer is out an answer can only belong to an earlier run,
    /// so it is never picked.
    fn pick<'a>(&self, invitations: &'a [Invitation]) -> Option<&'a Invitation> {
        let mut from_contact = invitations
            .iter()
            .filter(|inv| self.is_open_from_contact(inv));

        if !self.state.offer_created {
            return from_contact.find(|inv| !is_answer(inv));
        }

        let answer = from_contact.clone().find(|inv| is_answer(inv));
        if answer.is_some() {
            return answer;
        }
        if self.user < self.contact {
            return from_contact.next();
        }
        debug!("both offers are out; waiting for the contact's answer");
        None
    }

    fn is_open_from_contact(&self, invitation: &Invitation) -> bool {
        invitation.is_from(&self.contact) && !invitation.accepted
    }

    /// Applies `invitation`, then publishes our answer and accepts it. Returns
    /// `None` while the service is unreachable; the reply is finished on a
    /// later attempt without applying the description again.
    async fn respond(
        &mut self,
        invitation: &Invitation,
        superseded: Vec<InvitationId>,
    ) -> Result<Option<InvitationId>> {
        let remote = invitation.description()?;
        let answer = self.negotiator.apply_remote_description(&remote).await?;
        self.pending_reply = Some(PendingReply {
            invitation: invitation.id.clone(),
            answer,
            superseded,
        });
        self.finish_reply().await
    }

    async fn finish_reply(&mut self) -> Result<Option<InvitationId>> {
        let Some(mut reply) = self.pending_reply.take() else {
            return Ok(None);
        };

        if let Some(answer) = reply.answer.take() {
            if let Err(err) = self.signaling.publish(&self.user, &self.contact, &answer).await {
                reply.answer = Some(answer);
                return self.hold_reply(reply, err);
            }
        }
        if let Err(err) = self.signaling.accept_invitation(&reply.invitation).await {
            return self.hold_reply(reply, err);
        }

        self.discard(&reply.superseded).await;
        Ok(Some(reply.invitation))
    }

    fn hold_reply(&mut self, reply: PendingReply, err: Error) -> Result<Option<InvitationId>> {
        if !err.is_transient() {
            return Err(err);
        }
        warn!(id = %reply.invitation, error = %err, "replying to invitation failed; will retry");
        self.pending_reply = Some(reply);
        Ok(None)
    }

    /// Accepts records nobody will act on. Failures are only logged: such a
    /// record is skipped again on the next listing.
    async fn discard(&self, ids: &[InvitationId]) {
        for id in ids {
            match self.signaling.accept_invitation(id).await {
                Ok(()) => debug!(%id, "discarded stale invitation"),
                Err(err) => debug!(%id, error = %err, "discarding invitation failed"),
            }
        }
    }

    async fn ensure_offer(&mut self) -> Result<()> {
        if self.state.offer_created {
            debug!("waiting for the contact's invitation");
            return Ok(());
        }

        let offer = match self.pending_offer.take() {
            Some(offer) => offer,
            None => {
                info!("no invitation from contact; creating our own offer");
                self.negotiator.create_local_offer().await?
            }
        };

        match self.signaling.publish(&self.user, &self.contact, &offer).await {
            Ok(()) => {
                self.state.offer_created = true;
                Ok(())
            }
            Err(err) if err.is_transient() => {
                warn!(error = %err, "publishing offer failed; will retry");
                self.pending_offer = Some(offer);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn is_answer(invitation: &Invitation) -> bool {
    invitation
        .description()
        .map(|desc| !desc.is_offer())
        .unwrap_or(false)
}

/// Drives `fut` unless `cancel` is (or becomes) `true` or its sender is gone.
async fn until_cancelled<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    if *cancel.borrow_and_update() {
        return None;
    }
    tokio::select! {
        out = fut => Some(out),
        _ = cancelled(cancel) => None,
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if cancel.changed().await.is_err() {
            return;
        }
        if *cancel.borrow_and_update() {
            return;
        }
    }
}
