//! Client for the account API: authentication, profile and contacts.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::signaling::check_status;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub id: Option<i64>,
    pub username: String,
    /// 0 while the contact request is unanswered.
    #[serde(default)]
    pub confirmed: i64,
}

impl Contact {
    pub fn is_pending(&self) -> bool {
        self.confirmed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

impl UserInfo {
    pub fn confirmed_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(|c| !c.is_pending())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserSummary {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContactRequest {
    pub id: i64,
    pub username: String,
}

#[derive(Deserialize)]
struct PendingRequests {
    #[serde(default)]
    pending_requests: Vec<ContactRequest>,
}

#[derive(Deserialize)]
struct TokenReply {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Serialize)]
struct AddContact<'a> {
    contact_username: &'a str,
}

pub struct AccountClient {
    http: Client,
    base_url: Url,
    token: Mutex<Option<String>>,
}

impl AccountClient {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("{base_url} cannot be a base url")));
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .cookie_store(true)
            .build()?;
        Ok(Self {
            http,
            base_url,
            token: Mutex::new(None),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(config.account_base_url()?, config.request_timeout)
    }

    /// Uses an access token obtained elsewhere.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        *self.token.lock() = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .push(path);
        Ok(url)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.lock().as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let res = self.authorized(req).send().await?;
        let res = check_status(res).await?;
        Ok(res.json().await?)
    }

    async fn execute(&self, req: RequestBuilder) -> Result<()> {
        let res = self.authorized(req).send().await?;
        check_status(res).await?;
        Ok(())
    }

    fn remember(&self, reply: TokenReply) {
        if let Some(token) = reply.access_token {
            *self.token.lock() = Some(token);
        }
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let req = self.http.post(self.endpoint("register")?).form(&[
            ("username", username),
            ("email", email),
            ("password", password),
        ]);
        self.execute(req).await?;
        info!(username, "account registered");
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let req = self
            .http
            .post(self.endpoint("login")?)
            .form(&[("username", username), ("password", password)]);
        let reply: TokenReply = self.fetch(req).await?;
        self.remember(reply);
        info!(username, "logged in");
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let req = self.http.get(self.endpoint("logout")?);
        self.execute(req).await?;
        self.token.lock().take();
        info!("logged out");
        Ok(())
    }

    /// Exchanges the current session for a fresh access token.
    pub async fn refresh_token(&self) -> Result<()> {
        let req = self.http.post(self.endpoint("refresh-token")?);
        let reply: TokenReply = self.fetch(req).await?;
        self.remember(reply);
        debug!("access token refreshed");
        Ok(())
    }

    pub async fn user_info(&self) -> Result<UserInfo> {
        let req = self.http.get(self.endpoint("user-info")?);
        self.fetch(req).await
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>> {
        let req = self
            .http
            .get(self.endpoint("search-user")?)
            .query(&[("query", query)]);
        self.fetch(req).await
    }

    /// Sends a contact request, or confirms an incoming one.
    pub async fn add_contact(&self, contact_username: &str) -> Result<()> {
        let req = self
            .http
            .post(self.endpoint("add-contact")?)
            .json(&AddContact { contact_username });
        self.execute(req).await?;
        info!(contact = contact_username, "contact added");
        Ok(())
    }

    pub async fn remove_contact(&self, contact_username: &str) -> Result<()> {
        let req = self
            .http
            .delete(self.endpoint("remove-contact")?)
            .query(&[("contact_username", contact_username)]);
        self.execute(req).await?;
        info!(contact = contact_username, "contact removed");
        Ok(())
    }

    /// Contact requests addressed to the current user.
    pub async fn pending_requests(&self) -> Result<Vec<ContactRequest>> {
        let req = self.http.get(self.endpoint("pending-requests")?);
        let reply: PendingRequests = self.fetch(req).await?;
        Ok(reply.pending_requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_info_parses_contacts() {
        let info: UserInfo = serde_json::from_str(
            r#"{"username":"alice","role":"user","contacts":[
                {"id":1,"username":"bob","confirmed":1},
                {"username":"carol","confirmed":0}
            ]}"#,
        )
        .unwrap();
        assert_eq!(info.username, "alice");
        assert_eq!(info.role.as_deref(), Some("user"));
        assert!(!info.contacts[0].is_pending());
        assert!(info.contacts[1].is_pending());
        assert_eq!(info.contacts[1].id, None);
        let confirmed: Vec<_> = info.confirmed_contacts().map(|c| c.username.as_str()).collect();
        assert_eq!(confirmed, ["bob"]);
    }

    #[test]
    fn endpoints_keep_the_base_path() {
        let client =
            AccountClient::new(Url::parse("http://acct.test/api/").unwrap(), Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            client.endpoint("user-info").unwrap().as_str(),
            "http://acct.test/api/user-info"
        );
    }

    #[test]
    fn with_token_is_remembered() {
        let client =
            AccountClient::new(Url::parse("http://acct.test").unwrap(), Duration::from_secs(1))
                .unwrap()
                .with_token("t0k");
        assert_eq!(client.token().as_deref(), Some("t0k"));
    }
}
