use tracing::debug;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

/// Устанавливает глобальный subscriber. `RUST_LOG` имеет приоритет над `default_filter`.
/// Возвращает `false`, если subscriber уже был установлен.
///
/// Библиотека сама subscriber не ставит, приложение вызывает это один раз при старте:
///
/// ```no_run
/// let config = classroom_rtc::ClientConfig::load("classroom.toml")?;
/// classroom_rtc::logger::init_logging(&config.log_filter);
/// # Ok::<(), classroom_rtc::ConfigError>(())
/// ```
pub fn init_logging(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(link_id: &str, label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            link = link_id,
            "trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
            init.candidate,
            init.sdp_mid,
            init.sdp_mline_index
        );
    }
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(link_id: &str, pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                debug!(
                    link = link_id,
                    "stats {moment}: {}:{} state={:?} bytes={}/{}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.state,
                    pair.bytes_sent,
                    pair.bytes_received
                );
            }
        }
    }
}
