//! REST signaling: publish a description, list invitations, accept one.
//!
//! ```text
//! POST /chat/create_chat              {user_1, user_2, offer}
//! GET  /chat/invited/{username}       [{id, user_1, user_2, offer}, ...]
//! POST /chat/accept_invitation/{id}
//! ```

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::peer::types::SessionDescription;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Server-side id of an invitation. Numbers and strings are both accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct InvitationId(String);

impl InvitationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for InvitationId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(n) => InvitationId(n.to_string()),
            Raw::Text(s) => InvitationId(s),
        })
    }
}

/// Pending description exchange between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    /// Initiating user.
    pub user_1: String,
    /// Target user.
    pub user_2: String,
    /// Serialized session description.
    #[serde(alias = "user_1_secret")]
    pub offer: String,
    #[serde(default, deserialize_with = "flag")]
    pub accepted: bool,
}

impl Invitation {
    pub fn is_from(&self, username: &str) -> bool {
        self.user_1 == username
    }

    pub fn description(&self) -> Result<SessionDescription> {
        SessionDescription::from_blob(&self.offer)
    }
}

// the backend stores flags as 0/1
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Bool(b)) => b,
        Some(Raw::Int(n)) => n != 0,
        None => false,
    })
}

#[derive(Serialize)]
struct CreateChat<'a> {
    user_1: &'a str,
    user_2: &'a str,
    offer: String,
}

#[async_trait]
pub trait SignalingService: Send + Sync {
    /// Posts a description from `from` addressed to `to`.
    async fn publish(&self, from: &str, to: &str, description: &SessionDescription) -> Result<()>;

    /// Invitations addressed to `username`; [`Error::NotFound`] when there are none.
    async fn list_invitations(&self, username: &str) -> Result<Vec<Invitation>>;

    /// Marks an invitation consumed. Accepting twice is a no-op.
    async fn accept_invitation(&self, id: &InvitationId) -> Result<()>;
}

pub struct HttpSignalingClient {
    http: Client,
    base_url: Url,
    accepted: Mutex<HashSet<InvitationId>>,
}

impl HttpSignalingClient {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("{base_url} cannot be a base url")));
        }
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url,
            accepted: Mutex::new(HashSet::new()),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(config.signaling_base_url()?, config.request_timeout)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Turns a non-success reply into an error, keeping the body for context.
pub(crate) async fn check_status(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound);
    }
    let body = res.text().await.unwrap_or_default();
    Err(Error::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SignalingService for HttpSignalingClient {
    async fn publish(&self, from: &str, to: &str, description: &SessionDescription) -> Result<()> {
        let url = self.endpoint(&["chat", "create_chat"])?;
        let body = CreateChat {
            user_1: from,
            user_2: to,
            offer: description.to_blob()?,
        };
        let res = self.http.post(url).json(&body).send().await?;
        check_status(res).await?;
        info!(from, to, kind = ?description.kind(), "session description published");
        Ok(())
    }

    async fn list_invitations(&self, username: &str) -> Result<Vec<Invitation>> {
        let url = self.endpoint(&["chat", "invited", username])?;
        let res = self.http.get(url).send().await?;
        let res = check_status(res).await?;
        let invitations: Vec<Invitation> = res.json().await?;
        debug!(username, count = invitations.len(), "invitations listed");
        Ok(invitations)
    }

    async fn accept_invitation(&self, id: &InvitationId) -> Result<()> {
        if self.accepted.lock().contains(id) {
            debug!(%id, "invitation already accepted");
            return Ok(());
        }
        let url = self.endpoint(&["chat", "accept_invitation", id.as_str()])?;
        let res = self.http.post(url).send().await?;
        match check_status(res).await {
            Ok(_) => {}
            Err(Error::Status { status, .. }) if status == StatusCode::CONFLICT.as_u16() => {
                debug!(%id, "service reports invitation already accepted");
            }
            Err(err) => return Err(err),
        }
        self.accepted.lock().insert(id.clone());
        info!(%id, "invitation accepted");
        Ok(())
    }
}
