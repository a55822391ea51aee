//! Client configuration.
//!
//! Defaults mirror a local development setup: signaling on port 7000, the
//! account API on port 8000 and Google's public STUN server. Every value can be
//! overridden through `CONTACT_RTC_*` environment variables.

use crate::error::{Error, Result};
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SIGNALING_URL: &str = "http://localhost:7000";
pub const DEFAULT_ACCOUNT_URL: &str = "http://localhost:8000";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> =
    Lazy::new(|| vec![ServerConfig::stun("stun:stun.l.google.com:19302")]);

const ENV_SIGNALING_URL: &str = "CONTACT_RTC_SIGNALING_URL";
const ENV_ACCOUNT_URL: &str = "CONTACT_RTC_ACCOUNT_URL";
const ENV_ICE_SERVERS: &str = "CONTACT_RTC_ICE_SERVERS";
const ENV_TURN_USERNAME: &str = "CONTACT_RTC_TURN_USERNAME";
const ENV_TURN_CREDENTIAL: &str = "CONTACT_RTC_TURN_CREDENTIAL";
const ENV_MAX_ATTEMPTS: &str = "CONTACT_RTC_MAX_ATTEMPTS";
const ENV_RETRY_DELAY_MS: &str = "CONTACT_RTC_RETRY_DELAY_MS";

/// Retry knobs of the offer/answer rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub retry_delay: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Settings handed to every peer connection a manager creates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub ice_servers: Vec<ServerConfig>,
    #[serde(with = "millis")]
    pub gather_timeout: Duration,
    /// Gather 127.0.0.1 host candidates too (same-host peers).
    pub include_loopback: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            include_loopback: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base url of the signaling service; checked by [`validate`](Self::validate).
    pub signaling_url: String,
    pub account_url: String,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    pub peer: PeerConfig,
    pub negotiation: NegotiationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_owned(),
            account_url: DEFAULT_ACCOUNT_URL.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            peer: PeerConfig::default(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ClientConfig::default();

        if let Some(raw) = lookup(ENV_SIGNALING_URL) {
            parse_url(ENV_SIGNALING_URL, &raw)?;
            config.signaling_url = raw.trim().to_owned();
        }
        if let Some(raw) = lookup(ENV_ACCOUNT_URL) {
            parse_url(ENV_ACCOUNT_URL, &raw)?;
            config.account_url = raw.trim().to_owned();
        }
        if let Some(raw) = lookup(ENV_ICE_SERVERS) {
            // turn: entries share one set of credentials
            let username = lookup(ENV_TURN_USERNAME);
            let credential = lookup(ENV_TURN_CREDENTIAL);
            config.peer.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| {
                    if url.starts_with("turn:") || url.starts_with("turns:") {
                        ServerConfig::turn(url, username.clone(), credential.clone())
                    } else {
                        ServerConfig::stun(url)
                    }
                })
                .collect();
        }
        if let Some(raw) = lookup(ENV_MAX_ATTEMPTS) {
            config.negotiation.max_attempts = raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_MAX_ATTEMPTS}: not a number: {raw}")))?;
        }
        if let Some(raw) = lookup(ENV_RETRY_DELAY_MS) {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_RETRY_DELAY_MS}: not a number: {raw}")))?;
            config.negotiation.retry_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn signaling_base_url(&self) -> Result<Url> {
        parse_url("signaling_url", &self.signaling_url)
    }

    pub fn account_base_url(&self) -> Result<Url> {
        parse_url("account_url", &self.account_url)
    }

    pub fn validate(&self) -> Result<()> {
        self.signaling_base_url()?;
        self.account_base_url()?;
        if self.negotiation.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        validate_ice_servers(&self.peer.ice_servers)
    }
}

/// Rejects empty lists, empty urls and TURN entries without credentials.
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<()> {
    if servers.is_empty() {
        return Err(Error::Config("at least one ICE server is required".into()));
    }
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(Error::Config("server url cannot be empty".into()));
        }
        if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
            return Err(Error::Config(format!(
                "TURN server {} requires username and credential",
                server.url
            )));
        }
    }
    Ok(())
}

fn parse_url(key: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).map_err(|e| Error::Config(format!("{key}: {e}")))
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.negotiation.max_attempts, 10);
        assert_eq!(config.negotiation.retry_delay, Duration::from_secs(5));
        assert_eq!(
            config.signaling_base_url().unwrap().as_str(),
            "http://localhost:7000/"
        );
        assert_eq!(config.account_base_url().unwrap().port(), Some(8000));
        assert_eq!(config.peer.ice_servers.len(), 1);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = ClientConfig::from_lookup(env(&[
            (ENV_SIGNALING_URL, "http://signal.test:9000"),
            (ENV_ICE_SERVERS, "stun:a.test:3478, b.test:3478"),
            (ENV_MAX_ATTEMPTS, "3"),
            (ENV_RETRY_DELAY_MS, "250"),
        ]))
        .unwrap();
        assert_eq!(
            config.signaling_base_url().unwrap().host_str(),
            Some("signal.test")
        );
        assert_eq!(config.peer.ice_servers.len(), 2);
        assert_eq!(config.peer.ice_servers[1].url, "b.test:3478");
        assert_eq!(config.negotiation.max_attempts, 3);
        assert_eq!(config.negotiation.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ClientConfig::from_lookup(env(&[(ENV_MAX_ATTEMPTS, "many")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_lookup(env(&[(ENV_MAX_ATTEMPTS, "0")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_lookup(env(&[(ENV_ICE_SERVERS, " , ")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_lookup(env(&[(ENV_SIGNALING_URL, "not a url")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn turn_servers_take_credentials_from_the_environment() {
        let servers = "stun:a.test:3478,turn:relay.test:3478";
        assert!(matches!(
            ClientConfig::from_lookup(env(&[(ENV_ICE_SERVERS, servers)])),
            Err(Error::Config(_))
        ));

        let config = ClientConfig::from_lookup(env(&[
            (ENV_ICE_SERVERS, servers),
            (ENV_TURN_USERNAME, "alice"),
            (ENV_TURN_CREDENTIAL, "secret"),
        ]))
        .unwrap();
        let turn = &config.peer.ice_servers[1];
        assert!(turn.is_turn());
        assert_eq!(turn.r#type, "turn");
        assert_eq!(turn.username.as_deref(), Some("alice"));
        assert_eq!(turn.credential.as_deref(), Some("secret"));
        assert_eq!(config.peer.ice_servers[0].username, None);
    }

    #[test]
    fn deserialized_urls_are_checked() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"signaling_url":"not a url"}"#).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(config.signaling_base_url().is_err());
    }

    #[test]
    fn turn_requires_credentials() {
        let mut turn = ServerConfig::stun("turn:relay.test:3478");
        turn.r#type = "turn".into();
        assert!(validate_ice_servers(&[turn.clone()]).is_err());

        turn.username = Some("alice".into());
        turn.credential = Some("secret".into());
        validate_ice_servers(&[turn]).unwrap();
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"negotiation":{"max_attempts":4},"peer":{"gather_timeout":1500}}"#,
        )
        .unwrap();
        assert_eq!(config.negotiation.max_attempts, 4);
        assert_eq!(config.negotiation.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(config.peer.gather_timeout, Duration::from_millis(1500));
    }
}
