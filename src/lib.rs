//! Contact-to-contact WebRTC chat and screen sharing.
//!
//! Two users who know each other's usernames rendezvous through a REST
//! signaling service: whoever finds an invitation from the other answers it,
//! otherwise each side publishes an offer and keeps polling. See
//! [`session::Session`] for the surface-level entry point.

pub mod account;
pub mod config;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use account::AccountClient;
pub use config::{ClientConfig, NegotiationConfig, PeerConfig};
pub use error::{Error, Result};
pub use negotiation::{NegotiationLoop, NegotiationOutcome, NegotiationReport, NegotiationState};
pub use peer::{ConnectionStatus, PeerConnectionManager, PeerEvent, SessionDescription, SurfaceKind};
pub use session::{PendingNegotiation, Session};
pub use signaling::{HttpSignalingClient, Invitation, InvitationId, SignalingService};
