//! Постоянное соединение с relay: очередь исходящих, heartbeat и
//! переподключение с экспоненциальной задержкой.
//!
//! Одна фоновая задача на эпоху подключения. `disconnect` увеличивает
//! эпоху и взводит флаг отмены, поэтому запоздавшая задача не может
//! ни открыть соединение заново, ни изменить состояние. Задача новой
//! эпохи начинает подключение только после того, как прежняя закрыла
//! своё соединение.
//!
//! Записанный в соединение кадр считается доставленным, когда relay
//! ответил pong на ping, отправленный после него. Неподтверждённые и
//! неотправленные кадры при обрыве возвращаются в начало очереди.

use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::events::{Event, EventBus, HandlerResult, ListenerId};
use crate::signaling::backoff::Backoff;
use crate::signaling::heartbeat::Heartbeat;
use crate::signaling::protocol::{ChannelMessage, Identity, MessageKind, PongPayload};
use crate::signaling::transport::{Connection, Connector, WebSocketConnector};
use crate::utils::now_millis;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Message(ChannelMessage),
    StateChanged(ChannelState),
    Reconnecting { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Message(MessageKind),
    StateChanged,
    Reconnecting,
}

impl From<MessageKind> for ClientEventKind {
    fn from(kind: MessageKind) -> Self {
        ClientEventKind::Message(kind)
    }
}

impl Event for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::Message(msg) => ClientEventKind::Message(msg.kind()),
            ClientEvent::StateChanged(_) => ClientEventKind::StateChanged,
            ClientEvent::Reconnecting { .. } => ClientEventKind::Reconnecting,
        }
    }
}

/// `http(s)` → `ws(s)`, идентичность добавляется в query
pub fn derive_websocket_url(base: &str, identity: &Identity) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: base.to_owned(),
        reason,
    };

    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot switch scheme to {scheme}")))?;
    }

    url.query_pairs_mut()
        .append_pair("participantId", &identity.participant_id)
        .append_pair("sessionId", &identity.session_id);
    Ok(url)
}

struct ClientState {
    status: ChannelState,
    reconnect_attempts: u32,
    pending: VecDeque<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    epoch: u64,
    cancel: watch::Sender<bool>,
    /// Закрывается, когда задача последней эпохи завершилась
    finished: Option<watch::Receiver<()>>,
}

struct ClientInner {
    config: SignalingConfig,
    identity: Identity,
    url: Url,
    join_frame: String,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    state: Mutex<ClientState>,
    events: EventBus<ClientEvent>,
}

enum Exit {
    Cancelled,
    Dropped {
        reason: String,
        /// Кадры без подтверждения доставки, в порядке отправки
        undelivered: Vec<String>,
    },
}

/// Кадры, записанные в текущее соединение и ещё не подтверждённые
struct InFlight {
    cap: usize,
    written: u64,
    frames: VecDeque<(u64, String)>,
    /// (timestamp ping, сколько кадров было записано до него)
    pings: VecDeque<(i64, u64)>,
    last_ping: i64,
}

impl InFlight {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            written: 0,
            frames: VecDeque::new(),
            pings: VecDeque::new(),
            last_ping: 0,
        }
    }

    fn written(&mut self, frame: String) {
        self.written += 1;
        self.frames.push_back((self.written, frame));
        if self.frames.len() > self.cap {
            self.frames.pop_front();
        }
    }

    /// Строго возрастающий timestamp для следующего ping
    fn next_ping(&mut self) -> i64 {
        let timestamp = now_millis().max(self.last_ping + 1);
        self.last_ping = timestamp;
        self.pings.push_back((timestamp, self.written));
        if self.pings.len() > self.cap {
            self.pings.pop_front();
        }
        timestamp
    }

    /// Pong на наш ping подтверждает всё, что было записано до этого ping
    fn pong(&mut self, timestamp: i64) {
        let Some(pos) = self.pings.iter().position(|(ts, _)| *ts == timestamp) else {
            return;
        };
        let mark = self.pings[pos].1;
        self.pings.drain(..=pos);
        while self.frames.front().is_some_and(|(n, _)| *n <= mark) {
            self.frames.pop_front();
        }
    }

    fn unconfirmed(&self) -> usize {
        self.frames.len()
    }

    fn into_frames(self) -> Vec<String> {
        self.frames.into_iter().map(|(_, frame)| frame).collect()
    }
}

#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<ClientInner>,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig, identity: Identity) -> Result<Self, SignalingError> {
        Self::with_connector(config, identity, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(
        config: SignalingConfig,
        identity: Identity,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SignalingError> {
        let url = derive_websocket_url(&config.url, &identity)?;
        let join_frame = serde_json::to_string(&ChannelMessage::join(&identity))?;
        let backoff = Backoff::from_config(&config);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                identity,
                url,
                join_frame,
                connector,
                backoff,
                state: Mutex::new(ClientState {
                    status: ChannelState::Disconnected,
                    reconnect_attempts: 0,
                    pending: VecDeque::new(),
                    outbound: None,
                    epoch: 0,
                    cancel: watch::channel(false).0,
                    finished: None,
                }),
                events: EventBus::new(),
            }),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.lock().status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn on<K, F>(&self, kind: K, handler: F) -> ListenerId
    where
        K: Into<ClientEventKind>,
        F: Fn(&ClientEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.events.on(kind.into(), handler)
    }

    pub fn off(&self, kind: impl Into<ClientEventKind>, id: ListenerId) -> bool {
        self.inner.events.off(kind.into(), id)
    }

    /// Ничего не делает, если канал открыт или уже подключается.
    /// Во время ожидания переподключения начинает попытку сразу.
    pub fn connect(&self) {
        let (epoch, cancel, previous, finished) = {
            let mut st = self.inner.state.lock();
            if matches!(st.status, ChannelState::Open | ChannelState::Connecting) {
                return;
            }
            st.epoch += 1;
            let (tx, rx) = watch::channel(false);
            // старый sender уходит, ждущая задача видит отмену
            st.cancel = tx;
            st.status = ChannelState::Connecting;
            let (finished, finished_rx) = watch::channel(());
            let previous = st.finished.replace(finished_rx);
            (st.epoch, rx, previous, finished)
        };

        debug!(url = %self.inner.url, epoch, "connecting to relay");
        self.inner.emit(ClientEvent::StateChanged(ChannelState::Connecting));
        tokio::spawn(run(Arc::clone(&self.inner), epoch, cancel, previous, finished));
    }

    /// Закрывает канал, отменяет переподключение и очищает очередь
    pub fn disconnect(&self) {
        {
            let mut st = self.inner.state.lock();
            if st.status == ChannelState::Closed {
                return;
            }
            st.epoch += 1;
            st.status = ChannelState::Closed;
            st.pending.clear();
            st.outbound = None;
            st.cancel.send_replace(true);
        }

        info!(url = %self.inner.url, "signaling channel closed");
        self.inner.emit(ClientEvent::StateChanged(ChannelState::Closed));
    }

    pub fn send(&self, message: &ChannelMessage) -> Result<(), SignalingError> {
        let frame = serde_json::to_string(message)?;
        let cap = self.inner.config.max_pending_messages.max(1);

        let (dropped, need_connect) = {
            let mut st = self.inner.state.lock();
            let frame = match (st.status, st.outbound.as_ref()) {
                (ChannelState::Closed, _) => return Err(SignalingError::ChannelClosed),
                (ChannelState::Open, Some(tx)) => match tx.send(frame) {
                    Ok(()) => return Ok(()),
                    Err(e) => e.0,
                },
                _ => frame,
            };

            let dropped = if st.pending.len() >= cap {
                st.pending.pop_front()
            } else {
                None
            };
            st.pending.push_back(frame);
            (dropped.is_some(), st.status == ChannelState::Disconnected)
        };

        if dropped {
            warn!(cap, kind = ?message.kind(), "outbound queue full, dropped oldest message");
        }
        if need_connect {
            self.connect();
        }
        Ok(())
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        self.events.emit(&event);
    }

    /// Connecting → Open, если эпоха ещё актуальна
    fn mark_open(&self, epoch: u64) -> Option<mpsc::UnboundedReceiver<String>> {
        let (rx, flushed) = {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.status != ChannelState::Connecting {
                return None;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            // join всегда первым, затем очередь в порядке FIFO
            let _ = tx.send(self.join_frame.clone());
            let flushed = st.pending.len();
            for frame in st.pending.drain(..) {
                let _ = tx.send(frame);
            }
            st.outbound = Some(tx);
            st.status = ChannelState::Open;
            st.reconnect_attempts = 0;
            (rx, flushed)
        };

        info!(url = %self.url, flushed, "signaling channel open");
        self.emit(ClientEvent::StateChanged(ChannelState::Open));
        Some(rx)
    }

    /// Возвращает недоставленные кадры в начало очереди. Sender снимается
    /// под тем же lock, поэтому после drain в канал уже никто не пишет.
    fn requeue(
        &self,
        st: &mut ClientState,
        undelivered: Vec<String>,
        outbound: Option<mpsc::UnboundedReceiver<String>>,
    ) {
        st.outbound = None;
        let mut frames: VecDeque<String> = undelivered.into();
        if let Some(mut rx) = outbound {
            while let Ok(frame) = rx.try_recv() {
                frames.push_back(frame);
            }
        }
        frames.retain(|frame| frame != &self.join_frame);
        if frames.is_empty() {
            return;
        }

        let requeued = frames.len();
        frames.extend(st.pending.drain(..));
        let cap = self.config.max_pending_messages.max(1);
        let dropped = frames.len().saturating_sub(cap);
        frames.drain(..dropped);
        st.pending = frames;

        debug!(requeued, "undelivered frames returned to the queue");
        if dropped > 0 {
            warn!(cap, dropped, "outbound queue full, dropped oldest messages");
        }
    }

    fn schedule_reconnect(
        &self,
        epoch: u64,
        undelivered: Vec<String>,
        outbound: Option<mpsc::UnboundedReceiver<String>>,
    ) -> Option<(u32, Duration)> {
        let attempt = {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.status == ChannelState::Closed {
                return None;
            }
            self.requeue(&mut st, undelivered, outbound);
            st.status = ChannelState::Disconnected;
            let cap = self.config.max_reconnect_attempts.max(1);
            st.reconnect_attempts = (st.reconnect_attempts + 1).min(cap);
            st.reconnect_attempts
        };
        let delay = self.backoff.delay(attempt);

        info!(attempt, delay_ms = delay.as_millis() as u64, "signaling reconnect scheduled");
        self.emit(ClientEvent::StateChanged(ChannelState::Disconnected));
        self.emit(ClientEvent::Reconnecting { attempt, delay });
        Some((attempt, delay))
    }

    fn resume_connecting(&self, epoch: u64) -> bool {
        {
            let mut st = self.state.lock();
            if st.epoch != epoch || st.status != ChannelState::Disconnected {
                return false;
            }
            st.status = ChannelState::Connecting;
        }
        self.emit(ClientEvent::StateChanged(ChannelState::Connecting));
        true
    }

    async fn serve(
        &self,
        conn: Connection,
        outbound: &mut mpsc::UnboundedReceiver<String>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Exit {
        let Connection {
            mut sink,
            mut stream,
        } = conn;
        let interval = self.config.heartbeat_interval();
        let pong_timeout = self.config.pong_timeout();
        let mut heartbeat = Heartbeat::new(self.config.max_missed_heartbeats);
        let mut in_flight = InFlight::new(self.config.max_pending_messages);
        let mut failed: Option<String> = None;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let dropped = loop {
            let armed = heartbeat.deadline();
            let deadline = armed.unwrap_or_else(|| Instant::now() + interval);

            tokio::select! {
                _ = cancelled(cancel) => break None,

                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        let Some(message) = self.decode(&text) else { continue };
                        match &message {
                            ChannelMessage::Pong { payload } => {
                                heartbeat.pong_received();
                                in_flight.pong(payload.timestamp);
                            }
                            ChannelMessage::Ping { payload } => {
                                let pong = ChannelMessage::Pong {
                                    payload: PongPayload {
                                        timestamp: payload.timestamp,
                                        server_time: Some(now_millis()),
                                    },
                                };
                                if let Ok(frame) = serde_json::to_string(&pong) {
                                    if let Err(e) = sink.send(frame).await {
                                        break Some(e.to_string());
                                    }
                                }
                            }
                            _ => {}
                        }
                        self.emit(ClientEvent::Message(message));
                    }
                    Some(Err(SignalingError::MalformedFrame(reason))) => {
                        warn!(%reason, "dropping malformed frame");
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("closed by relay".into()),
                },

                out = outbound.recv() => match out {
                    Some(frame) => match sink.send(frame.clone()).await {
                        Ok(()) => in_flight.written(frame),
                        Err(e) => {
                            failed = Some(frame);
                            break Some(e.to_string());
                        }
                    },
                    None => break Some("outbound queue closed".into()),
                },

                _ = ticker.tick() => {
                    if heartbeat.ping_sent(Instant::now() + pong_timeout) {
                        break Some("heartbeat missed".into());
                    }
                    match serde_json::to_string(&ChannelMessage::ping(in_flight.next_ping())) {
                        Ok(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                break Some(e.to_string());
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode ping"),
                    }
                }

                _ = sleep_until(deadline), if armed.is_some() => {
                    debug!(missed = heartbeat.missed() + 1, "pong not received in time");
                    if heartbeat.deadline_passed() {
                        break Some(format!("{} heartbeats missed", heartbeat.missed()));
                    }
                }
            }
        };

        // прежнее соединение закрывается до следующей попытки
        match timeout(pong_timeout, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "closing signaling sink failed"),
            Err(_) => debug!("closing signaling sink timed out"),
        }

        let Some(reason) = dropped else {
            return Exit::Cancelled;
        };
        let unconfirmed = in_flight.unconfirmed();
        let mut undelivered = in_flight.into_frames();
        undelivered.extend(failed);
        if !undelivered.is_empty() {
            debug!(unconfirmed, "connection lost with undelivered frames");
        }
        Exit::Dropped {
            reason,
            undelivered,
        }
    }

    fn decode(&self, text: &str) -> Option<ChannelMessage> {
        match serde_json::from_str::<ChannelMessage>(text) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, len = text.len(), "dropping malformed frame");
                None
            }
        }
    }
}

/// Завершается при отмене или при замене sender'а новой эпохой
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn run(
    inner: Arc<ClientInner>,
    epoch: u64,
    mut cancel: watch::Receiver<bool>,
    previous: Option<watch::Receiver<()>>,
    _finished: watch::Sender<()>,
) {
    if let Some(mut previous) = previous {
        // значение не отправляется, changed завершится с закрытием канала
        while previous.changed().await.is_ok() {}
    }

    loop {
        let attempt = tokio::select! {
            _ = cancelled(&mut cancel) => return,
            res = inner.connector.connect(&inner.url) => res,
        };

        let (undelivered, outbound) = match attempt {
            Ok(conn) => {
                let Some(mut outbound) = inner.mark_open(epoch) else {
                    return;
                };
                match inner.serve(conn, &mut outbound, &mut cancel).await {
                    Exit::Cancelled => return,
                    Exit::Dropped {
                        reason,
                        undelivered,
                    } => {
                        warn!(%reason, "signaling connection lost");
                        (undelivered, Some(outbound))
                    }
                }
            }
            Err(e) => {
                warn!(url = %inner.url, error = %e, "signaling connect failed");
                (Vec::new(), None)
            }
        };

        let Some((_, delay)) = inner.schedule_reconnect(epoch, undelivered, outbound) else {
            return;
        };
        tokio::select! {
            _ = cancelled(&mut cancel) => return,
            _ = sleep(delay) => {}
        }
        if !inner.resume_connecting(epoch) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_urls_become_websocket_urls() {
        let id = Identity::new("p 1", "s1");
        let url = derive_websocket_url("https://relay.example.org/ws/signaling", &id).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/ws/signaling");
        assert_eq!(url.query(), Some("participantId=p+1&sessionId=s1"));

        let url = derive_websocket_url("http://localhost:8080/ws", &id).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(8080));
    }

    #[test]
    fn other_schemes_are_rejected() {
        let id = Identity::new("p1", "s1");
        assert!(matches!(
            derive_websocket_url("ftp://relay.example.org", &id),
            Err(SignalingError::InvalidUrl { .. })
        ));
        assert!(matches!(
            derive_websocket_url("not a url", &id),
            Err(SignalingError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn message_kinds_route_to_message_events() {
        let event = ClientEvent::Message(ChannelMessage::ping(1));
        assert_eq!(event.kind(), ClientEventKind::from(MessageKind::Ping));
        assert_eq!(
            ClientEvent::StateChanged(ChannelState::Open).kind(),
            ClientEventKind::StateChanged
        );
    }

    #[test]
    fn pong_confirms_frames_written_before_its_ping() {
        let mut in_flight = InFlight::new(8);
        in_flight.written("a".into());
        let first = in_flight.next_ping();
        in_flight.written("b".into());
        let second = in_flight.next_ping();
        assert!(second > first);

        // чужой timestamp ничего не подтверждает
        in_flight.pong(first - 1);
        assert_eq!(in_flight.unconfirmed(), 2);

        in_flight.pong(first);
        assert_eq!(in_flight.unconfirmed(), 1);
        in_flight.written("c".into());
        in_flight.pong(second);
        assert_eq!(in_flight.into_frames(), vec!["c".to_owned()]);
    }

    #[test]
    fn in_flight_buffer_is_bounded() {
        let mut in_flight = InFlight::new(2);
        for frame in ["a", "b", "c"] {
            in_flight.written(frame.into());
        }
        assert_eq!(in_flight.into_frames(), vec!["b".to_owned(), "c".to_owned()]);
    }

    #[tokio::test]
    async fn send_after_disconnect_is_rejected() {
        let client = SignalingClient::new(SignalingConfig::default(), Identity::new("p1", "s1")).unwrap();
        client.disconnect();
        assert_eq!(client.state(), ChannelState::Closed);
        assert_eq!(
            client.send(&ChannelMessage::ping(1)),
            Err(SignalingError::ChannelClosed)
        );
    }
}
