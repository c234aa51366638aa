//! Учёт локальных и удалённых медиа-треков

use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub type LocalTrackRef = Arc<dyn TrackLocal + Send + Sync>;

/// Локальный поток: набор треков с общим id. Треки можно раздавать
/// нескольким PeerLink одновременно.
#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrackRef>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: LocalTrackRef) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrackRef] {
        &self.tracks
    }
}

/// Отправляемый трек вместе с его sender
pub(crate) struct LocalTrack {
    pub(crate) track: LocalTrackRef,
    pub(crate) stream_id: String,
    pub(crate) sender: Arc<RTCRtpSender>,
}

impl LocalTrack {
    pub(crate) fn matches(&self, track_id: &str, stream_id: &str) -> bool {
        self.track.id() == track_id && self.stream_id == stream_id
    }
}

/// Составной удалённый поток. Создаётся на первом полученном треке,
/// клоны делят один набор треков.
#[derive(Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
}

impl RemoteStream {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn same_stream(&self, other: &RemoteStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }

    pub(crate) fn push(&self, track: Arc<TrackRemote>) {
        self.tracks.lock().push(track);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    #[test]
    fn local_stream_keeps_track_order() {
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        };
        let mic: LocalTrackRef = Arc::new(TrackLocalStaticSample::new(
            codec.clone(),
            "mic".into(),
            "lecturer".into(),
        ));
        let line: LocalTrackRef = Arc::new(TrackLocalStaticSample::new(
            codec,
            "line-in".into(),
            "lecturer".into(),
        ));

        let stream = LocalStream::new("lecturer").with_track(mic).with_track(line);
        let ids: Vec<&str> = stream.tracks().iter().map(|t| t.id()).collect();
        assert_eq!(stream.id(), "lecturer");
        assert_eq!(ids, vec!["mic", "line-in"]);
    }

    #[test]
    fn remote_stream_clones_share_tracks() {
        let a = RemoteStream::new("remote");
        let b = a.clone();
        assert!(a.same_stream(&b));
        assert!(b.is_empty());
        assert!(!a.same_stream(&RemoteStream::new("remote")));
    }
}
