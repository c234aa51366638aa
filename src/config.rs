// Конфигурация клиента: ICE-серверы, параметры peer-соединений и канала сигнализации.
// Все поля имеют значения по умолчанию, файл TOML может задавать только часть из них.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Фильтр tracing по умолчанию, `RUST_LOG` имеет приоритет
    pub log_filter: String,
    pub link: LinkConfig,
    pub signaling: SignalingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,webrtc=warn".into(),
            link: LinkConfig::default(),
            signaling: SignalingConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        self.signaling.validate()
    }
}

/// Тип ICE-сервера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// Конфигурация ICE сервера
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: IceServerKind::Stun,
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}

/// Дефолтные STUN-серверы
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        IceServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Пустой список означает только host-кандидаты (LAN, тесты)
    pub ice_servers: Vec<IceServerConfig>,
    pub data_channel_label: String,
    pub trickle_ice: bool,
    pub ice_candidate_pool_size: u8,
    /// Сколько ждать окончания сбора кандидатов без trickle
    pub gather_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            data_channel_label: "classroom-data".into(),
            trickle_ice: true,
            ice_candidate_pool_size: 10,
            gather_timeout_ms: 10_000,
        }
    }
}

impl LinkConfig {
    /// Конфигурация без внешних ICE-серверов
    pub fn host_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ice server {} has an empty url",
                    server.id
                )));
            }

            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "turn server {} requires username and credential",
                    server.id
                )));
            }
        }

        if self.data_channel_label.is_empty() {
            return Err(ConfigError::Invalid("data channel label is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Адрес relay, http(s) или ws(s)
    pub url: String,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub max_missed_heartbeats: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Потолок счётчика попыток переподключения
    pub max_reconnect_attempts: u32,
    pub max_pending_messages: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws/signaling".into(),
            heartbeat_interval_ms: 25_000,
            pong_timeout_ms: 10_000,
            max_missed_heartbeats: 3,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 16,
            max_pending_messages: 64,
        }
    }
}

impl SignalingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Invalid("signaling url is empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat interval must be positive".into()));
        }
        if self.pong_timeout_ms == 0 || self.pong_timeout_ms >= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "pong timeout must be positive and shorter than the heartbeat interval".into(),
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ConfigError::Invalid("max missed heartbeats must be positive".into()));
        }
        if self.reconnect_base_delay_ms == 0
            || self.reconnect_base_delay_ms > self.reconnect_max_delay_ms
        {
            return Err(ConfigError::Invalid(
                "reconnect base delay must be positive and not above the maximum".into(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid("max reconnect attempts must be positive".into()));
        }
        Ok(())
    }
}
