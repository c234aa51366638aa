//! PeerLink: одно WebRTC-соединение между двумя участниками.
//!
//! Сигналы (offer/answer/candidate) идут наружу событием `Signal` и
//! принимаются обратно через [`PeerLink::signal`]. Транспорт сигналов
//! link не знает.

use crate::config::LinkConfig;
use crate::error::PeerError;
use crate::events::{EventBus, HandlerResult, ListenerId};
use crate::logger::dump_selected_pair;
use crate::peer::connection;
use crate::peer::data_channel::attach_dc;
use crate::peer::ice::{self, LocalCandidates};
use crate::peer::media::{LocalStream, LocalTrack, LocalTrackRef, RemoteStream};
use crate::peer::state::{ConnectionTracker, LinkState};
use crate::peer::types::{CandidateInit, ParsedSignal, PeerEvent, PeerEventKind, Role, SignalMessage};
use crate::utils::random_id;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

fn negotiation(e: webrtc::Error) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

fn media(e: webrtc::Error) -> PeerError {
    PeerError::Media(e.to_string())
}

pub(crate) struct LinkInner {
    pub(crate) id: String,
    pub(crate) role: Role,
    pub(crate) trickle: bool,
    pub(crate) config: LinkConfig,
    pub(crate) pc: Arc<RTCPeerConnection>,
    pub(crate) tracker: Mutex<ConnectionTracker>,
    pub(crate) data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    pub(crate) events: EventBus<PeerEvent>,
    /// Кандидаты, пришедшие раньше remote description
    pub(crate) pending_remote: Mutex<Vec<CandidateInit>>,
    pub(crate) local_candidates: Mutex<LocalCandidates>,
    local_tracks: tokio::sync::Mutex<Vec<LocalTrack>>,
    remote_stream: Mutex<Option<RemoteStream>>,
    /// Сериализует обработку сигналов и создание offer
    signal_lock: tokio::sync::Mutex<()>,
}

impl LinkInner {
    pub(crate) fn state(&self) -> LinkState {
        self.tracker.lock().state()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Рассылка события; после destroy подписчиков уже нет
    pub(crate) fn emit(&self, event: PeerEvent) {
        if self.is_destroyed() {
            return;
        }
        self.events.emit(&event);
    }

    pub(crate) fn mark_connected(self: &Arc<Self>, source: &str) {
        if !self.tracker.lock().mark_connected() {
            return;
        }
        info!(link = %self.id, source, "peer link connected");
        self.emit(PeerEvent::Connect);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            dump_selected_pair(&inner.id, &inner.pc, "CONNECTED").await;
        });
    }

    pub(crate) fn on_remote_track(&self, track: Arc<TrackRemote>) {
        if self.is_destroyed() {
            return;
        }

        let (stream, created) = {
            let mut slot = self.remote_stream.lock();
            match slot.as_ref() {
                Some(stream) => (stream.clone(), false),
                None => {
                    let stream = RemoteStream::new(track.stream_id());
                    *slot = Some(stream.clone());
                    (stream, true)
                }
            }
        };
        stream.push(Arc::clone(&track));
        debug!(link = %self.id, track = %track.id(), stream = stream.id(), "remote track received");

        self.emit(PeerEvent::Track {
            track,
            stream: stream.clone(),
        });
        if created {
            self.emit(PeerEvent::Stream(stream));
        }
    }

    /// Однократное закрытие: повторные вызовы ничего не делают
    pub(crate) async fn destroy(&self, error: Option<PeerError>) {
        if !self.tracker.lock().terminate(error.is_some()) {
            return;
        }
        match &error {
            Some(err) => warn!(link = %self.id, error = %err, "destroying peer link"),
            None => info!(link = %self.id, "closing peer link"),
        }

        let dc = self.data_channel.lock().take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                debug!(link = %self.id, error = %e, "data channel close failed");
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!(link = %self.id, error = %e, "peer connection close failed");
        }

        self.pending_remote.lock().clear();
        self.local_candidates.lock().clear();
        self.local_tracks.lock().await.clear();

        if let Some(err) = error {
            self.events.emit(&PeerEvent::Error(err));
        }
        self.events.emit(&PeerEvent::Close);
        self.events.clear();
    }

    /// Для вызова из обработчиков pc/dc, где ждать close нельзя
    pub(crate) fn destroy_detached(self: &Arc<Self>, error: Option<PeerError>) {
        if self.is_destroyed() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.destroy(error).await });
    }

    async fn negotiate_offer(self: Arc<Self>) {
        let _guard = self.signal_lock.lock().await;
        if self.is_destroyed() {
            return;
        }
        self.tracker.lock().begin_connecting();

        let result = async {
            let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
            self.publish_local_description(offer, |sdp| SignalMessage::Offer { sdp })
                .await
        }
        .await;

        if let Err(err) = result {
            self.destroy(Some(err)).await;
        }
    }

    async fn publish_local_description<F>(
        &self,
        desc: RTCSessionDescription,
        wrap: F,
    ) -> Result<(), PeerError>
    where
        F: FnOnce(String) -> SignalMessage,
    {
        // promise берётся до set_local_description, иначе можно пропустить конец сбора
        let mut gathered = if self.trickle {
            None
        } else {
            Some(self.pc.gathering_complete_promise().await)
        };

        self.pc.set_local_description(desc).await.map_err(negotiation)?;
        if let Some(done) = gathered.as_mut() {
            ice::wait_for_gathering(self, done).await;
        }
        if self.is_destroyed() {
            return Ok(());
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerError::Negotiation("local description is missing".into()))?;
        ice::analyze_candidates(&self.id, &local.sdp);

        let message = wrap(local.sdp);
        debug!(link = %self.id, kind = message.kind_name(), "emitting local description");
        self.emit(PeerEvent::Signal(message));
        ice::flush_local_candidates(self);
        Ok(())
    }

    async fn accept_offer(&self, sdp: String) -> Result<(), PeerError> {
        if self.role == Role::Initiator {
            return Err(PeerError::UnexpectedOffer);
        }
        let state = self.state();
        if !matches!(state, LinkState::New | LinkState::Connecting) {
            warn!(link = %self.id, ?state, "ignoring offer outside of initial negotiation");
            return Ok(());
        }
        self.tracker.lock().begin_connecting();

        let offer = RTCSessionDescription::offer(sdp).map_err(negotiation)?;
        self.pc.set_remote_description(offer).await.map_err(negotiation)?;
        ice::apply_pending_candidates(self).await?;

        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.publish_local_description(answer, |sdp| SignalMessage::Answer { sdp })
            .await
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError> {
        if self.role == Role::Responder {
            return Err(PeerError::UnexpectedAnswer);
        }
        let answer = RTCSessionDescription::answer(sdp).map_err(negotiation)?;
        self.pc.set_remote_description(answer).await.map_err(negotiation)?;
        ice::apply_pending_candidates(self).await
    }

    async fn accept_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        if candidate.candidate.is_empty() {
            debug!(link = %self.id, "end of remote candidates");
            return Ok(());
        }
        if !ice::is_parseable_candidate(&candidate.candidate) {
            warn!(link = %self.id, candidate = %candidate.candidate, "dropping malformed remote candidate");
            return Ok(());
        }

        if self.pc.remote_description().await.is_none() {
            debug!(link = %self.id, "remote description not set yet, queuing candidate");
            self.pending_remote.lock().push(candidate);
            return Ok(());
        }

        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }
}

/// Сборка PeerLink. Подписчики, добавленные здесь, видят все события,
/// включая первый `Signal` инициатора.
pub struct PeerLinkBuilder {
    role: Role,
    id: Option<String>,
    config: LinkConfig,
    trickle: Option<bool>,
    local_media: Option<LocalStream>,
    events: EventBus<PeerEvent>,
}

impl PeerLinkBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Перекрывает `LinkConfig::trickle_ice`
    pub fn trickle_ice(mut self, trickle: bool) -> Self {
        self.trickle = Some(trickle);
        self
    }

    pub fn local_media(mut self, stream: LocalStream) -> Self {
        self.local_media = Some(stream);
        self
    }

    pub fn on<F>(self, kind: PeerEventKind, handler: F) -> Self
    where
        F: Fn(&PeerEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.events.on(kind, handler);
        self
    }

    pub async fn build(self) -> Result<PeerLink, PeerError> {
        let PeerLinkBuilder {
            role,
            id,
            config,
            trickle,
            local_media,
            events,
        } = self;
        let id = id.unwrap_or_else(random_id);
        let trickle = trickle.unwrap_or(config.trickle_ice);

        let pc = match connection::new_transport(&config).await {
            Ok(pc) => pc,
            Err(err) => {
                warn!(link = %id, error = %err, "failed to create peer connection");
                events.emit(&PeerEvent::Error(err.clone()));
                events.emit(&PeerEvent::Close);
                events.clear();
                return Err(err);
            }
        };

        let inner = Arc::new(LinkInner {
            id,
            role,
            trickle,
            config,
            pc,
            tracker: Mutex::new(ConnectionTracker::new()),
            data_channel: Mutex::new(None),
            events,
            pending_remote: Mutex::new(Vec::new()),
            local_candidates: Mutex::new(LocalCandidates::default()),
            local_tracks: tokio::sync::Mutex::new(Vec::new()),
            remote_stream: Mutex::new(None),
            signal_lock: tokio::sync::Mutex::new(()),
        });
        connection::wire(&inner);
        let link = PeerLink { inner };

        if let Some(stream) = local_media {
            if let Err(err) = link.add_stream(&stream).await {
                link.inner.destroy(Some(err.clone())).await;
                return Err(err);
            }
        }

        if role == Role::Initiator {
            // если initiator, то сами делаем data-channel
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            match link
                .inner
                .pc
                .create_data_channel(&link.inner.config.data_channel_label, Some(init))
                .await
            {
                Ok(dc) => attach_dc(&link.inner, dc),
                Err(e) => {
                    let err = PeerError::DataChannel(e.to_string());
                    link.inner.destroy(Some(err.clone())).await;
                    return Err(err);
                }
            }

            let inner = Arc::clone(&link.inner);
            tokio::spawn(inner.negotiate_offer());
        }

        info!(link = %link.inner.id, ?role, trickle, "peer link created");
        Ok(link)
    }
}

#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl PeerLink {
    pub fn builder(role: Role) -> PeerLinkBuilder {
        PeerLinkBuilder {
            role,
            id: None,
            config: LinkConfig::default(),
            trickle: None,
            local_media: None,
            events: EventBus::new(),
        }
    }

    /// Link без дополнительных настроек
    pub async fn new(role: Role, config: LinkConfig) -> Result<PeerLink, PeerError> {
        Self::builder(role).config(config).build().await
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn on<F>(&self, kind: PeerEventKind, handler: F) -> ListenerId
    where
        F: Fn(&PeerEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, kind: PeerEventKind, id: ListenerId) -> bool {
        self.inner.events.off(kind, id)
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.inner.remote_stream.lock().clone()
    }

    /// Пары (track id, stream id) отправляемых треков
    pub async fn local_tracks(&self) -> Vec<(String, String)> {
        self.inner
            .local_tracks
            .lock()
            .await
            .iter()
            .map(|t| (t.track.id().to_owned(), t.stream_id.clone()))
            .collect()
    }

    /// Принимает сигнал от удалённой стороны.
    ///
    /// Нарушение протокола или сбой согласования закрывают link с ошибкой,
    /// та же ошибка возвращается вызывающему. После закрытия сигналы
    /// молча игнорируются.
    pub async fn signal(&self, message: SignalMessage) -> Result<(), PeerError> {
        let inner = &self.inner;
        if inner.is_destroyed() {
            debug!(link = %inner.id, kind = message.kind_name(), "ignoring signal on destroyed link");
            return Ok(());
        }

        let _guard = inner.signal_lock.lock().await;
        if inner.is_destroyed() {
            return Ok(());
        }

        debug!(link = %inner.id, kind = message.kind_name(), "applying remote signal");
        let result = match message {
            SignalMessage::Offer { sdp } => inner.accept_offer(sdp).await,
            SignalMessage::Answer { sdp } => inner.accept_answer(sdp).await,
            SignalMessage::Candidate { candidate } => inner.accept_candidate(candidate).await,
        };

        match result {
            Ok(()) => Ok(()),
            // закрыт параллельно, пока шло согласование
            Err(_) if inner.is_destroyed() => Ok(()),
            Err(err) => {
                inner.destroy(Some(err.clone())).await;
                Err(err)
            }
        }
    }

    /// Сигнал в виде произвольного JSON
    pub async fn signal_value(&self, value: &Value) -> Result<(), PeerError> {
        match SignalMessage::parse_value(value) {
            ParsedSignal::Signal(message) => self.signal(message).await,
            ParsedSignal::MalformedCandidate(reason) => {
                warn!(link = %self.inner.id, %reason, "dropping malformed candidate signal");
                Ok(())
            }
            ParsedSignal::Unsupported => self.reject_unsupported().await,
        }
    }

    pub async fn signal_json(&self, raw: &str) -> Result<(), PeerError> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.signal_value(&value).await,
            Err(_) => self.reject_unsupported().await,
        }
    }

    async fn reject_unsupported(&self) -> Result<(), PeerError> {
        if self.inner.is_destroyed() {
            return Ok(());
        }
        let err = PeerError::UnsupportedSignal;
        self.inner.destroy(Some(err.clone())).await;
        Err(err)
    }

    fn ready_channel(&self) -> Result<Arc<RTCDataChannel>, PeerError> {
        if self.state() != LinkState::Connected {
            return Err(PeerError::NotConnected);
        }
        let dc = self
            .inner
            .data_channel
            .lock()
            .clone()
            .ok_or(PeerError::NotConnected)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(PeerError::NotConnected);
        }
        Ok(dc)
    }

    /// Отправка бинарных данных по data channel
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), PeerError> {
        let dc = self.ready_channel()?;
        let data = payload.into();
        match dc.send(&data).await {
            Ok(_) => Ok(()),
            Err(e) => self.fail_send(e).await,
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), PeerError> {
        let dc = self.ready_channel()?;
        match dc.send_text(text.into()).await {
            Ok(_) => Ok(()),
            Err(e) => self.fail_send(e).await,
        }
    }

    async fn fail_send(&self, e: webrtc::Error) -> Result<(), PeerError> {
        let err = PeerError::DataChannel(e.to_string());
        self.inner.destroy(Some(err.clone())).await;
        Err(err)
    }

    pub async fn add_track(&self, track: LocalTrackRef, stream: &LocalStream) -> Result<(), PeerError> {
        if self.inner.is_destroyed() {
            return Ok(());
        }

        let mut tracks = self.inner.local_tracks.lock().await;
        if tracks.iter().any(|t| t.matches(track.id(), stream.id())) {
            return Err(PeerError::TrackAlreadyAdded(track.id().to_owned()));
        }

        let sender = self
            .inner
            .pc
            .add_track(Arc::clone(&track))
            .await
            .map_err(media)?;
        drain_rtcp(&self.inner.id, Arc::clone(&sender));

        debug!(link = %self.inner.id, track = track.id(), stream = stream.id(), "local track added");
        tracks.push(LocalTrack {
            track,
            stream_id: stream.id().to_owned(),
            sender,
        });
        Ok(())
    }

    pub async fn remove_track(&self, track: &LocalTrackRef, stream: &LocalStream) -> Result<(), PeerError> {
        if self.inner.is_destroyed() {
            return Ok(());
        }

        let mut tracks = self.inner.local_tracks.lock().await;
        let pos = tracks
            .iter()
            .position(|t| t.matches(track.id(), stream.id()))
            .ok_or(PeerError::NoSenderForTrack)?;

        // запись уходит только после успешного снятия sender'а
        self.inner
            .pc
            .remove_track(&tracks[pos].sender)
            .await
            .map_err(media)?;
        tracks.remove(pos);
        debug!(link = %self.inner.id, track = track.id(), "local track removed");
        Ok(())
    }

    /// Подмена трека без пересогласования
    pub async fn replace_track(
        &self,
        old: &LocalTrackRef,
        new: LocalTrackRef,
        stream: &LocalStream,
    ) -> Result<(), PeerError> {
        if self.inner.is_destroyed() {
            return Ok(());
        }

        let mut tracks = self.inner.local_tracks.lock().await;
        let entry = tracks
            .iter_mut()
            .find(|t| t.matches(old.id(), stream.id()))
            .ok_or(PeerError::NoSenderForTrack)?;

        entry
            .sender
            .replace_track(Some(Arc::clone(&new)))
            .await
            .map_err(media)?;
        debug!(link = %self.inner.id, old = old.id(), new = new.id(), "local track replaced");
        entry.track = new;
        Ok(())
    }

    pub async fn add_stream(&self, stream: &LocalStream) -> Result<(), PeerError> {
        for track in stream.tracks() {
            self.add_track(Arc::clone(track), stream).await?;
        }
        Ok(())
    }

    pub async fn remove_stream(&self, stream: &LocalStream) -> Result<(), PeerError> {
        for track in stream.tracks() {
            self.remove_track(track, stream).await?;
        }
        Ok(())
    }

    /// Закрывает link. С ошибкой подписчики сначала получат `Error`, затем `Close`.
    pub async fn destroy(&self, error: Option<PeerError>) {
        self.inner.destroy(error).await;
    }
}

/// RTCP от получателя нужно вычитывать, иначе интерсепторы не работают
fn drain_rtcp(link_id: &str, sender: Arc<RTCRtpSender>) {
    let link_id = link_id.to_owned();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
        debug!(link = %link_id, "rtcp reader finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn mic() -> LocalTrackRef {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "mic".to_owned(),
            "lecturer".to_owned(),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_track_removal_keeps_bookkeeping() {
        let stream = LocalStream::new("lecturer");
        let track = mic();
        let link = PeerLink::new(Role::Responder, LinkConfig::host_only()).await.unwrap();
        let other = PeerLink::new(Role::Responder, LinkConfig::host_only()).await.unwrap();
        link.add_track(Arc::clone(&track), &stream).await.unwrap();
        other.add_track(Arc::clone(&track), &stream).await.unwrap();

        // sender чужого соединения: pc.remove_track вернёт ошибку
        let foreign = Arc::clone(&other.inner.local_tracks.lock().await[0].sender);
        link.inner.local_tracks.lock().await[0].sender = foreign;

        assert!(matches!(
            link.remove_track(&track, &stream).await,
            Err(PeerError::Media(_))
        ));
        assert_eq!(
            link.local_tracks().await,
            vec![("mic".to_owned(), "lecturer".to_owned())]
        );

        link.destroy(None).await;
        other.destroy(None).await;
    }
}
