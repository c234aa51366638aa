/// Состояние PeerLink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }
}

/// Машина состояний соединения.
///
/// Готовность приходит из двух независимых источников (ICE и data channel),
/// `mark_connected` срабатывает ровно один раз, кто бы ни пришёл первым.
/// Из `Closed`/`Failed` переходов нет.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: LinkState,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            state: LinkState::New,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// New → Connecting
    pub fn begin_connecting(&mut self) -> bool {
        if self.state == LinkState::New {
            self.state = LinkState::Connecting;
            true
        } else {
            false
        }
    }

    /// `true` только для первого вызова
    pub fn mark_connected(&mut self) -> bool {
        match self.state {
            LinkState::New | LinkState::Connecting => {
                self.state = LinkState::Connected;
                true
            }
            _ => false,
        }
    }

    /// Терминальный переход, `true` только для первого вызова
    pub fn terminate(&mut self, failed: bool) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = if failed {
            LinkState::Failed
        } else {
            LinkState::Closed
        };
        true
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_edge_fires_once() {
        let mut t = ConnectionTracker::new();
        assert!(t.begin_connecting());
        // ICE connected, затем data channel open
        assert!(t.mark_connected());
        assert!(!t.mark_connected());
        assert_eq!(t.state(), LinkState::Connected);
    }

    #[test]
    fn begin_connecting_is_one_way() {
        let mut t = ConnectionTracker::new();
        assert!(t.begin_connecting());
        assert!(!t.begin_connecting());
        t.mark_connected();
        assert!(!t.begin_connecting());
        assert_eq!(t.state(), LinkState::Connected);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut t = ConnectionTracker::new();
        t.begin_connecting();
        assert!(t.terminate(true));
        assert_eq!(t.state(), LinkState::Failed);

        assert!(!t.terminate(false));
        assert!(!t.mark_connected());
        assert!(!t.begin_connecting());
        assert_eq!(t.state(), LinkState::Failed);
    }

    #[test]
    fn clean_close_from_connected() {
        let mut t = ConnectionTracker::new();
        t.begin_connecting();
        t.mark_connected();
        assert!(t.terminate(false));
        assert_eq!(t.state(), LinkState::Closed);
        assert!(t.state().is_terminal());
    }
}
