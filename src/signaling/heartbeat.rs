use tokio::time::Instant;

/// Учёт пропущенных pong.
///
/// На каждый ping ставится дедлайн; pong до дедлайна сбрасывает счётчик,
/// истёкший дедлайн увеличивает его. При достижении порога соединение
/// считается мёртвым.
#[derive(Debug)]
pub struct Heartbeat {
    threshold: u32,
    missed: u32,
    deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            missed: 0,
            deadline: None,
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Ping отправлен. Если предыдущий ответ так и не пришёл, он считается пропущенным.
    pub fn ping_sent(&mut self, deadline: Instant) -> bool {
        if self.deadline.is_some() {
            self.missed += 1;
        }
        self.deadline = Some(deadline);
        self.is_dead()
    }

    pub fn pong_received(&mut self) {
        self.missed = 0;
        self.deadline = None;
    }

    /// Дедлайн истёк без pong. `true`, если порог достигнут.
    pub fn deadline_passed(&mut self) -> bool {
        if self.deadline.take().is_some() {
            self.missed += 1;
        }
        self.is_dead()
    }

    pub fn is_dead(&self) -> bool {
        self.missed >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn three_missed_pongs_are_fatal() {
        let mut hb = Heartbeat::new(3);
        let now = Instant::now();
        for i in 1..=3 {
            assert!(!hb.ping_sent(now + Duration::from_secs(1)));
            assert_eq!(hb.deadline_passed(), i == 3);
        }
        assert_eq!(hb.missed(), 3);
    }

    #[test]
    fn pong_resets_counter() {
        let mut hb = Heartbeat::new(3);
        let now = Instant::now();
        hb.ping_sent(now);
        hb.deadline_passed();
        hb.ping_sent(now);
        hb.deadline_passed();
        assert_eq!(hb.missed(), 2);

        hb.ping_sent(now);
        hb.pong_received();
        assert_eq!(hb.missed(), 0);
        assert!(hb.deadline().is_none());
    }

    #[test]
    fn deadline_counts_once() {
        let mut hb = Heartbeat::new(3);
        hb.ping_sent(Instant::now());
        assert!(!hb.deadline_passed());
        assert!(!hb.deadline_passed());
        assert_eq!(hb.missed(), 1);
    }
}
