use crate::config::{IceServerConfig, LinkConfig};
use crate::error::PeerError;
use crate::peer::data_channel::attach_dc;
use crate::peer::ice;
use crate::peer::link::LinkInner;
use crate::peer::types::Role;
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Создаёт RTCPeerConnection с дефолтными кодеками и интерсепторами
pub(crate) async fn new_transport(config: &LinkConfig) -> Result<Arc<RTCPeerConnection>, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| PeerError::Transport(format!("failed to register codecs: {e}")))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| PeerError::Transport(format!("failed to register interceptors: {e}")))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = api
        .new_peer_connection(rtc_config(config))
        .await
        .map_err(|e| PeerError::Transport(format!("failed to create peer connection: {e}")))?;
    Ok(Arc::new(pc))
}

/// Создает конфигурацию для peer connection
pub(crate) fn rtc_config(config: &LinkConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&config.ice_servers),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub(crate) fn ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Регистрирует обработчики pc. Замыкания держат только Weak,
/// чтобы pc не удерживал собственного владельца.
pub(crate) fn wire(inner: &Arc<LinkInner>) {
    let pc = &inner.pc;

    let weak = Arc::downgrade(inner);
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        if let Some(inner) = weak.upgrade() {
            match cand {
                Some(c) => ice::on_local_candidate(&inner, &c),
                // cand == None означает конец сбора
                None => debug!(link = %inner.id, "ice candidate gathering completed"),
            }
        }
        Box::pin(async {})
    }));

    let weak = Arc::downgrade(inner);
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        if let Some(inner) = weak.upgrade() {
            on_ice_state(&inner, st);
        }
        Box::pin(async {})
    }));

    let weak = Arc::downgrade(inner);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        if let Some(inner) = weak.upgrade() {
            debug!(link = %inner.id, state = ?st, "peer connection state changed");
        }
        Box::pin(async {})
    }));

    if inner.role == Role::Responder {
        let weak = Arc::downgrade(inner);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            if let Some(inner) = weak.upgrade() {
                attach_dc(&inner, dc);
            }
            Box::pin(async {})
        }));
    }

    let weak = Arc::downgrade(inner);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_remote_track(track);
            }
            Box::pin(async {})
        },
    ));
}

fn on_ice_state(inner: &Arc<LinkInner>, st: RTCIceConnectionState) {
    debug!(link = %inner.id, state = ?st, "ice connection state changed");

    match st {
        RTCIceConnectionState::Checking => {
            inner.tracker.lock().begin_connecting();
        }
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            inner.mark_connected("ice");
        }
        RTCIceConnectionState::Failed => {
            inner.destroy_detached(Some(PeerError::IceConnectionFailed));
        }
        RTCIceConnectionState::Closed => inner.destroy_detached(None),
        RTCIceConnectionState::Disconnected => {
            warn!(link = %inner.id, "ice disconnected, waiting for recovery");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServerKind;

    #[test]
    fn config_maps_servers_and_policies() {
        let mut link = LinkConfig::default();
        link.ice_servers.push(IceServerConfig {
            id: "relay".into(),
            kind: IceServerKind::Turn,
            url: "turn.example.org:3478".into(),
            username: Some("student".into()),
            credential: Some("secret".into()),
        });

        let rtc = rtc_config(&link);
        assert_eq!(rtc.ice_servers.len(), 3);
        assert_eq!(rtc.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302".to_owned()]);
        assert_eq!(rtc.ice_servers[2].urls, vec!["turn:turn.example.org:3478".to_owned()]);
        assert_eq!(rtc.ice_servers[2].username, "student");
        assert_eq!(rtc.ice_candidate_pool_size, 10);
        assert_eq!(rtc.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(rtc.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
    }

    #[test]
    fn host_only_has_no_servers() {
        assert!(rtc_config(&LinkConfig::host_only()).ice_servers.is_empty());
    }
}
