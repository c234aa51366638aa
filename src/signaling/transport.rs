//! Подключение к relay: WebSocket в продакшене, in-memory канал в тестах

use crate::error::SignalingError;
use crate::signaling::protocol::ChannelMessage;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc as tokio_mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SignalingError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, SignalingError>> + Send>>;

/// Текстовые кадры в обе стороны
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Connection, SignalingError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Connection, SignalingError> {
        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        debug!(%url, status = %response.status(), "websocket connected");

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(|e| SignalingError::WebSocket(e.to_string()))
            .with(|frame: String| future::ready(Ok::<_, SignalingError>(Message::Text(frame))));

        let stream = read.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => Some(
                    String::from_utf8(data).map_err(|e| SignalingError::MalformedFrame(e.to_string())),
                ),
                // close, ping/pong обрабатывает tungstenite
                Ok(_) => None,
                Err(e) => Some(Err(SignalingError::WebSocket(e.to_string()))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Серверная сторона in-memory соединения
pub struct MemoryServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryServerEnd {
    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.to_client.unbounded_send(frame.into()).is_ok()
    }

    pub fn send(&self, message: &ChannelMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(frame) => self.send_raw(frame),
            Err(_) => false,
        }
    }

    pub async fn recv_frame(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Следующее сообщение клиента; `None`, когда клиент закрыл соединение
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            let frame = self.from_client.next().await?;
            if let Ok(message) = serde_json::from_str(&frame) {
                return Some(message);
            }
        }
    }

    /// Клиент закрыл своё соединение
    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }

    /// Закрывает соединение со стороны сервера
    pub fn close(self) {}
}

/// Принимает in-memory соединения, открытые клиентом
pub struct MemoryListener {
    accepted: tokio_mpsc::UnboundedReceiver<MemoryServerEnd>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<MemoryServerEnd> {
        self.accepted.recv().await
    }
}

struct MemoryShared {
    attempts: AtomicUsize,
    refusing: AtomicBool,
    accepted: tokio_mpsc::UnboundedSender<MemoryServerEnd>,
}

/// Connector без сети, для тестов и встраивания
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<MemoryShared>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(MemoryShared {
                attempts: AtomicUsize::new(0),
                refusing: AtomicBool::new(false),
                accepted: tx,
            }),
        };
        (connector, MemoryListener { accepted: rx })
    }

    /// Число вызовов `connect`, включая отклонённые
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Connection, SignalingError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(SignalingError::Connect(format!("{url}: connection refused")));
        }

        let (to_client, client_rx) = mpsc::unbounded();
        let (client_tx, from_client) = mpsc::unbounded();
        self.shared
            .accepted
            .send(MemoryServerEnd {
                to_client,
                from_client,
            })
            .map_err(|_| SignalingError::Connect(format!("{url}: listener is gone")))?;

        Ok(Connection {
            sink: Box::pin(client_tx.sink_map_err(|_| SignalingError::ChannelClosed)),
            stream: Box::pin(client_rx.map(Ok::<String, SignalingError>)),
        })
    }
}
