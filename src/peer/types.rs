use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Kind of a session description, spelled the way browsers serialize it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Negotiation payload exchanged through the signaling service.
///
/// Serializes to `{"type":"offer","sdp":"..."}`, the same shape a browser's
/// `JSON.stringify(pc.localDescription)` produces, so both kinds of client can
/// read each other's invitations. Immutable once produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    kind: SdpKind,
    sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    pub fn kind(&self) -> SdpKind {
        self.kind
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }

    /// Parses the serialized blob carried in an invitation record.
    pub fn from_blob(blob: &str) -> Result<Self> {
        let desc: SessionDescription = serde_json::from_str(blob)?;
        if desc.sdp.trim().is_empty() {
            return Err(Error::Negotiation("session description has no sdp".into()));
        }
        Ok(desc)
    }

    pub fn to_blob(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Negotiation(format!("cannot serialize description: {e}")))
    }

    /// Builds the webrtc description, parsing the SDP on the way.
    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        let sdp = self.sdp.clone();
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
            SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp)?,
            SdpKind::Rollback => {
                return Err(Error::Negotiation(
                    "rollback descriptions are not exchanged".into(),
                ))
            }
        };
        Ok(desc)
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = Error;

    fn try_from(desc: RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            RTCSdpType::Rollback => SdpKind::Rollback,
            RTCSdpType::Unspecified => {
                return Err(Error::Negotiation("description has no type".into()))
            }
        };
        Ok(SessionDescription::new(kind, desc.sdp))
    }
}

/// Public view of the transport's connectivity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Unknown,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Failed => "Failed",
            ConnectionStatus::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// What the owning surface uses the connection for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    Chat,
    ScreenShare,
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default)]
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            r#type: "stun".into(),
            url,
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: Option<String>,
        credential: Option<String>,
    ) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            r#type: "turn".into(),
            url,
            username,
            credential,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.r#type == "turn" || self.url.starts_with("turn:") || self.url.starts_with("turns:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browser_shaped_blob() {
        let blob = r#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let desc = SessionDescription::from_blob(blob).unwrap();
        assert_eq!(desc.kind(), SdpKind::Offer);
        assert!(desc.is_offer());
        assert_eq!(desc.sdp(), "v=0\r\n");

        let back: serde_json::Value = serde_json::from_str(&desc.to_blob().unwrap()).unwrap();
        assert_eq!(back["type"], "offer");
    }

    #[test]
    fn malformed_blob_is_a_negotiation_error() {
        for blob in ["not json", r#"{"type":"bogus","sdp":"x"}"#, r#"{"type":"answer","sdp":"  "}"#] {
            match SessionDescription::from_blob(blob) {
                Err(Error::Negotiation(_)) => {}
                other => panic!("expected negotiation error for {blob}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rollback_cannot_be_applied() {
        let desc = SessionDescription::new(SdpKind::Rollback, "v=0");
        assert!(matches!(desc.to_rtc(), Err(Error::Negotiation(_))));
    }

    #[test]
    fn status_labels_match_the_surface_text() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "Connecting...");
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
    }
}
