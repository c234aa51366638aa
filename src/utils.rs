use crate::config::{IceServerConfig, IceServerKind};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Добавляет схему протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    const SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];
    if SCHEMES.iter().any(|s| config.url.starts_with(s)) {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Текущее время в миллисекундах, для payload ping/pong
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_hex_and_distinct() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn scheme_is_added_by_kind() {
        let mut server = IceServerConfig::stun("s", "stun.example.org:3478");
        assert_eq!(add_ice_url_scheme(&server), "stun:stun.example.org:3478");

        server.kind = IceServerKind::Turn;
        assert_eq!(add_ice_url_scheme(&server), "turn:stun.example.org:3478");

        server.url = "turns:relay.example.org".into();
        assert_eq!(add_ice_url_scheme(&server), "turns:relay.example.org");
    }
}
