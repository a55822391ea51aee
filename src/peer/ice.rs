use crate::config::validate_ice_servers;
use crate::error::Result;
use crate::peer::types::{ConnectionStatus, ServerConfig};
use crate::utils::add_ice_url_scheme;
use tracing::{info, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

/// Maps the transport's ICE state onto the public status.
pub fn status_from_ice(state: RTCIceConnectionState) -> ConnectionStatus {
    match state {
        RTCIceConnectionState::New | RTCIceConnectionState::Checking => {
            ConnectionStatus::Connecting
        }
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            ConnectionStatus::Connected
        }
        RTCIceConnectionState::Disconnected => ConnectionStatus::Disconnected,
        RTCIceConnectionState::Failed => ConnectionStatus::Failed,
        _ => ConnectionStatus::Unknown,
    }
}

/// Builds the peer connection configuration from the configured servers.
pub fn rtc_config(servers: &[ServerConfig]) -> Result<RTCConfiguration> {
    validate_ice_servers(servers)?;
    Ok(RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    })
}

pub fn to_rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Counts candidate types in an SDP and warns when nothing can cross a NAT.
pub fn analyze_candidates(sdp: &str) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for line in sdp.lines().filter(|l| l.starts_with("a=candidate:")) {
        if line.contains("typ host") {
            host_count += 1;
        } else if line.contains("typ srflx") {
            srflx_count += 1;
        } else if line.contains("typ relay") {
            relay_count += 1;
        }
    }

    info!(
        host = host_count,
        srflx = srflx_count,
        relay = relay_count,
        "candidate analysis"
    );
    if srflx_count == 0 && relay_count == 0 {
        warn!("no reflexive or relay candidates gathered; peers behind NAT may not connect");
    }
}
