//! Участие в лекции: один SignalingClient и по PeerLink на каждого
//! удалённого участника (mesh).
//!
//! Все изменения карты links выполняет одна задача, команды приходят
//! из обработчиков событий клиента и links. Сигналы каждого участника
//! идут в его link через отдельную очередь, поэтому долгое согласование
//! одного link не задерживает остальных.

use crate::config::LinkConfig;
use crate::events::{Event, EventBus, HandlerResult, ListenerId};
use crate::peer::{LocalStream, PeerEvent, PeerEventKind, PeerLink, Role, SignalMessage};
use crate::signaling::{ChannelMessage, ClientEvent, ClientEventKind, MessageKind, SignalingClient};
use crate::utils::random_id;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    LinkAdded { participant_id: String, link: PeerLink },
    LinkRemoved { participant_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    LinkAdded,
    LinkRemoved,
}

impl Event for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::LinkAdded { .. } => SessionEventKind::LinkAdded,
            SessionEvent::LinkRemoved { .. } => SessionEventKind::LinkRemoved,
        }
    }
}

enum Command {
    Roster(Vec<String>),
    PeerLeft(String),
    Signal {
        from: Option<String>,
        signal: SignalMessage,
    },
    LinkClosed {
        participant_id: String,
        link_id: String,
    },
    Leave(oneshot::Sender<()>),
}

/// Link участника и очередь его входящих сигналов
struct Peer {
    link: PeerLink,
    signals: mpsc::UnboundedSender<SignalMessage>,
}

struct SessionInner {
    client: SignalingClient,
    link_config: LinkConfig,
    local_media: Option<LocalStream>,
    links: Mutex<HashMap<String, Peer>>,
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<SessionEvent>,
    subscriptions: Mutex<Vec<(ClientEventKind, ListenerId)>>,
}

#[derive(Clone)]
pub struct LectureSession {
    inner: Arc<SessionInner>,
}

impl LectureSession {
    /// Подписывается на сообщения relay и открывает канал сигнализации
    pub fn start(
        client: SignalingClient,
        link_config: LinkConfig,
        local_media: Option<LocalStream>,
    ) -> LectureSession {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            client,
            link_config,
            local_media,
            links: Mutex::new(HashMap::new()),
            commands: tx,
            events: EventBus::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        inner.subscribe();
        tokio::spawn(Arc::clone(&inner).process(rx));
        info!(participant = %inner.me(), "joining lecture");
        inner.client.connect();

        LectureSession { inner }
    }

    pub fn client(&self) -> &SignalingClient {
        &self.inner.client
    }

    pub fn link(&self, participant_id: &str) -> Option<PeerLink> {
        self.inner
            .links
            .lock()
            .get(participant_id)
            .map(|peer| peer.link.clone())
    }

    pub fn participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.links.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn on<F>(&self, kind: SessionEventKind, handler: F) -> ListenerId
    where
        F: Fn(&SessionEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, kind: SessionEventKind, id: ListenerId) -> bool {
        self.inner.events.off(kind, id)
    }

    /// Закрывает все links и канал сигнализации
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Leave(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl SessionInner {
    fn me(&self) -> &str {
        &self.client.identity().participant_id
    }

    fn subscribe(&self) {
        let mut subs = self.subscriptions.lock();

        let tx = self.commands.clone();
        let id = self.client.on(MessageKind::PeersInLecture, move |event| {
            if let ClientEvent::Message(ChannelMessage::PeersInLecture { peers }) = event {
                tx.send(Command::Roster(peers.clone()))
                    .map_err(|_| "lecture session is gone")?;
            }
            Ok(())
        });
        subs.push((MessageKind::PeersInLecture.into(), id));

        let tx = self.commands.clone();
        let id = self.client.on(MessageKind::PeerLeft, move |event| {
            if let ClientEvent::Message(ChannelMessage::PeerLeft { participant_id }) = event {
                tx.send(Command::PeerLeft(participant_id.clone()))
                    .map_err(|_| "lecture session is gone")?;
            }
            Ok(())
        });
        subs.push((MessageKind::PeerLeft.into(), id));

        for kind in [MessageKind::Offer, MessageKind::Answer, MessageKind::Candidate] {
            let tx = self.commands.clone();
            let id = self.client.on(kind, move |event| {
                if let ClientEvent::Message(message) = event {
                    if let Some((from, signal)) = message.clone().into_signal() {
                        tx.send(Command::Signal { from, signal })
                            .map_err(|_| "lecture session is gone")?;
                    }
                }
                Ok(())
            });
            subs.push((kind.into(), id));
        }

        let id = self.client.on(MessageKind::Error, |event| {
            if let ClientEvent::Message(ChannelMessage::Error { message }) = event {
                warn!(%message, "relay reported an error");
            }
            Ok(())
        });
        subs.push((MessageKind::Error.into(), id));
    }

    async fn process(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Roster(peers) => self.apply_roster(peers).await,
                Command::PeerLeft(participant_id) => {
                    let link = self.links.lock().get(&participant_id).map(|p| p.link.clone());
                    if let Some(link) = link {
                        info!(participant = %participant_id, "participant left the lecture");
                        destroy_detached(link);
                    }
                }
                Command::Signal { from, signal } => self.route_signal(from, signal).await,
                Command::LinkClosed {
                    participant_id,
                    link_id,
                } => self.forget_link(&participant_id, &link_id),
                Command::Leave(done) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    async fn apply_roster(&self, peers: Vec<String>) {
        let wanted: HashSet<String> = peers.into_iter().filter(|p| p != self.me()).collect();
        debug!(count = wanted.len(), "roster received");

        let stale: Vec<PeerLink> = self
            .links
            .lock()
            .iter()
            .filter(|(id, _)| !wanted.contains(*id))
            .map(|(_, peer)| peer.link.clone())
            .collect();
        for link in stale {
            destroy_detached(link);
        }

        for participant_id in wanted {
            if self.live_link(&participant_id).is_none() {
                self.open_link(&participant_id, Role::Initiator).await;
            }
        }
    }

    async fn route_signal(&self, from: Option<String>, signal: SignalMessage) {
        let Some(from) = from else {
            warn!(kind = signal.kind_name(), "dropping signal without sender");
            return;
        };

        let queue = match self.live_queue(&from) {
            Some(queue) => queue,
            None if matches!(signal, SignalMessage::Offer { .. }) => {
                if self.open_link(&from, Role::Responder).await.is_none() {
                    return;
                }
                match self.live_queue(&from) {
                    Some(queue) => queue,
                    None => return,
                }
            }
            None => {
                debug!(participant = %from, kind = signal.kind_name(), "dropping signal for unknown participant");
                return;
            }
        };

        if queue.send(signal).is_err() {
            debug!(participant = %from, "link stopped accepting signals");
        }
    }

    /// Link участника, если он ещё не закрыт
    fn live_link(&self, participant_id: &str) -> Option<PeerLink> {
        let links = self.links.lock();
        links
            .get(participant_id)
            .filter(|peer| !peer.link.is_destroyed())
            .map(|peer| peer.link.clone())
    }

    fn live_queue(&self, participant_id: &str) -> Option<mpsc::UnboundedSender<SignalMessage>> {
        let links = self.links.lock();
        links
            .get(participant_id)
            .filter(|peer| !peer.link.is_destroyed())
            .map(|peer| peer.signals.clone())
    }

    async fn open_link(&self, participant_id: &str, role: Role) -> Option<PeerLink> {
        let link_id = random_id();
        let me = self.me().to_owned();

        let client = self.client.clone();
        let to = participant_id.to_owned();
        let signal_handler = move |event: &PeerEvent| {
            if let PeerEvent::Signal(signal) = event {
                client.send(&ChannelMessage::routed(signal.clone(), &me, &to))?;
            }
            Ok(())
        };

        let tx = self.commands.clone();
        let (closed_participant, closed_link) = (participant_id.to_owned(), link_id.clone());
        let close_handler = move |_: &PeerEvent| {
            tx.send(Command::LinkClosed {
                participant_id: closed_participant.clone(),
                link_id: closed_link.clone(),
            })
            .map_err(|_| "lecture session is gone")?;
            Ok(())
        };

        let mut builder = PeerLink::builder(role)
            .id(link_id)
            .config(self.link_config.clone())
            .on(PeerEventKind::Signal, signal_handler)
            .on(PeerEventKind::Close, close_handler);
        if let Some(media) = &self.local_media {
            builder = builder.local_media(media.clone());
        }

        let link = match builder.build().await {
            Ok(link) => link,
            Err(e) => {
                warn!(participant = %participant_id, error = %e, "failed to open peer link");
                return None;
            }
        };

        let (signals, queue) = mpsc::unbounded_channel();
        tokio::spawn(feed_link(participant_id.to_owned(), link.clone(), queue));

        let previous = self.links.lock().insert(
            participant_id.to_owned(),
            Peer {
                link: link.clone(),
                signals,
            },
        );
        if let Some(previous) = previous {
            destroy_detached(previous.link);
        }

        info!(participant = %participant_id, link = link.id(), ?role, "peer link added");
        self.events.emit(&SessionEvent::LinkAdded {
            participant_id: participant_id.to_owned(),
            link: link.clone(),
        });
        Some(link)
    }

    fn forget_link(&self, participant_id: &str, link_id: &str) {
        let removed = {
            let mut links = self.links.lock();
            match links.get(participant_id) {
                Some(peer) if peer.link.id() == link_id => links.remove(participant_id).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(participant = %participant_id, link = link_id, "peer link removed");
            self.events.emit(&SessionEvent::LinkRemoved {
                participant_id: participant_id.to_owned(),
            });
        }
    }

    async fn shutdown(&self) {
        let peers: Vec<(String, Peer)> = self.links.lock().drain().collect();
        for (participant_id, peer) in peers {
            peer.link.destroy(None).await;
            self.events.emit(&SessionEvent::LinkRemoved { participant_id });
        }

        for (kind, id) in self.subscriptions.lock().drain(..) {
            self.client.off(kind, id);
        }
        self.client.disconnect();
        self.events.clear();
        info!(participant = %self.me(), "left lecture");
    }
}

/// Подаёт сигналы участника в его link по порядку
async fn feed_link(
    participant_id: String,
    link: PeerLink,
    mut signals: mpsc::UnboundedReceiver<SignalMessage>,
) {
    while let Some(signal) = signals.recv().await {
        if link.is_destroyed() {
            break;
        }
        if let Err(e) = link.signal(signal).await {
            warn!(participant = %participant_id, error = %e, "signal rejected by link");
        }
    }
    debug!(participant = %participant_id, link = link.id(), "signal queue closed");
}

fn destroy_detached(link: PeerLink) {
    tokio::spawn(async move { link.destroy(None).await });
}
