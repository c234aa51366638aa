//! Шина событий с закрытым набором видов.
//!
//! Подписчики хранятся по виду события в порядке подписки. При рассылке
//! каждый обработчик вызывается изолированно: ошибка или паника одного
//! логируется и не мешает остальным.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler<E> = Arc<dyn Fn(&E) -> HandlerResult + Send + Sync>;

/// Событие, у которого есть вид для маршрутизации подписчикам
pub trait Event {
    type Kind: Copy + Eq + Hash + Debug + Send;

    fn kind(&self) -> Self::Kind;
}

/// Handle подписки, нужен для `off`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Итог одной рассылки
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub delivered: usize,
    pub failed: usize,
}

pub struct EventBus<E: Event> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<E::Kind, Vec<(ListenerId, Handler<E>)>>>,
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn on<F>(&self, kind: E::Kind, handler: F) -> ListenerId
    where
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Возвращает `true`, если подписка была найдена и снята
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    pub fn emit(&self, event: &E) -> Dispatch {
        let kind = event.kind();
        // снимок под замком: обработчики могут сами вызывать on/off
        let handlers: Vec<Handler<E>> = match self.listeners.lock().get(&kind) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return Dispatch::default(),
        };

        let mut report = Dispatch::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(?kind, error = %e, "event listener failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(?kind, "event listener panicked");
                }
            }
        }
        report
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
