use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by signaling, negotiation and the peer channels.
#[derive(Debug, Error)]
pub enum Error {
    /// The signaling or account service could not be reached.
    #[error("network error: {0}")]
    Network(String),
    /// The service answered with a non-success status.
    #[error("unexpected status: {status} body={body}")]
    Status { status: u16, body: String },
    /// No invitation is waiting yet.
    #[error("no invitation found")]
    NotFound,
    /// Malformed or out-of-sequence session description.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel is not open")]
    ChannelNotReady,
    /// Display capture denied or unavailable.
    #[error("display capture unavailable: {0}")]
    MediaAccess(String),
    #[error("peer connection is closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Transport failures and 5xx replies are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::Negotiation(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Negotiation(format!("malformed session description: {err}"))
    }
}
