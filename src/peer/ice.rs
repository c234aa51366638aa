use crate::error::PeerError;
use crate::logger::dump_candidate;
use crate::peer::link::LinkInner;
use crate::peer::types::{CandidateInit, PeerEvent, SignalMessage};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;

/// Локальные кандидаты, найденные до отправки offer/answer,
/// придерживаются до публикации описания
#[derive(Debug, Default)]
pub(crate) struct LocalCandidates {
    published: bool,
    buffered: Vec<CandidateInit>,
}

impl LocalCandidates {
    pub(crate) fn clear(&mut self) {
        self.buffered.clear();
    }
}

/// Синтаксическая проверка строки кандидата:
/// `candidate:<foundation> <component> <proto> <priority> <addr> <port> typ <type> ...`
pub(crate) fn is_parseable_candidate(line: &str) -> bool {
    let body = line.strip_prefix("a=").unwrap_or(line);
    let body = body.strip_prefix("candidate:").unwrap_or(body);
    let fields: Vec<&str> = body.split_whitespace().collect();

    fields.len() >= 8
        && fields[1].parse::<u16>().is_ok()
        && fields[3].parse::<u32>().is_ok()
        && fields[5].parse::<u16>().is_ok()
        && fields[6] == "typ"
}

/// Обработчик локального кандидата (Trickle-ICE)
pub(crate) fn on_local_candidate(inner: &LinkInner, cand: &RTCIceCandidate) {
    dump_candidate(&inner.id, "LOCAL", cand);
    // без trickle кандидаты уходят внутри SDP
    if !inner.trickle || inner.is_destroyed() {
        return;
    }

    let init = match cand.to_json() {
        Ok(init) => CandidateInit::from(init),
        Err(e) => {
            warn!(link = %inner.id, error = %e, "failed to serialize local candidate");
            return;
        }
    };

    let ready = {
        let mut local = inner.local_candidates.lock();
        if local.published {
            true
        } else {
            local.buffered.push(init.clone());
            false
        }
    };
    if ready {
        inner.emit(PeerEvent::Signal(SignalMessage::Candidate { candidate: init }));
    }
}

/// Вызывается сразу после отправки offer/answer
pub(crate) fn flush_local_candidates(inner: &LinkInner) {
    let buffered = {
        let mut local = inner.local_candidates.lock();
        local.published = true;
        std::mem::take(&mut local.buffered)
    };
    if !buffered.is_empty() {
        debug!(link = %inner.id, count = buffered.len(), "flushing buffered local candidates");
    }
    for candidate in buffered {
        inner.emit(PeerEvent::Signal(SignalMessage::Candidate { candidate }));
    }
}

/// Применяет все отложенные кандидаты после установки remote description
pub(crate) async fn apply_pending_candidates(inner: &LinkInner) -> Result<(), PeerError> {
    let candidates = std::mem::take(&mut *inner.pending_remote.lock());

    for candidate in candidates {
        debug!(link = %inner.id, candidate = %candidate.candidate, "applying pending candidate");
        inner
            .pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))?;
    }
    Ok(())
}

/// Ожидание окончания сбора кандидатов с таймаутом
pub(crate) async fn wait_for_gathering(inner: &LinkInner, done: &mut mpsc::Receiver<()>) {
    let limit = inner.config.gather_timeout();
    match timeout(limit, done.recv()).await {
        Ok(_) => debug!(link = %inner.id, "ice gathering complete"),
        Err(_) => warn!(
            link = %inner.id,
            timeout_ms = limit.as_millis() as u64,
            "ice gathering timed out, sending what was gathered"
        ),
    }
}

pub(crate) fn analyze_candidates(link_id: &str, sdp: &str) {
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

    debug!(
        link = link_id,
        "candidate analysis: {} host, {} srflx, {} relay", host_count, srflx_count, relay_count
    );
}
