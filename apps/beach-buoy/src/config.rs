use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::call::{CallSettings, DuplicateOfferPolicy, SessionLimit};

pub const DEFAULT_SIGNALING_URL: &str = "wss://sig.piedpie.net";
pub const DEFAULT_IDENTITY: &str = "bot@piedpie.net";
pub const DEFAULT_CREDENTIALS_URL: &str = "https://reg.piedpie.net";
pub const DEFAULT_CREDENTIALS_USER: &str = "pibot";
pub const DEFAULT_MEDIA_PATH: &str = "media/sample";
pub const DEFAULT_DISPLAY_NAME: &str = "WebRTC Bot";
pub const DEFAULT_LOG_FILTER: &str = "info,beach_buoy=debug";

/// Room identifiers use at most this many characters of the identity.
const ROOM_ID_CHARS: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("signaling url must not be empty")]
    EmptySignalingUrl,
    #[error("invalid signaling url {url:?}: {reason}")]
    InvalidSignalingUrl { url: String, reason: String },
    #[error("unsupported signaling scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("connect timeout must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Clone)]
pub struct BuoyConfig {
    pub signaling_url: String,
    pub identity: String,
    pub room_id: String,
    pub credentials_url: String,
    pub credentials_user: String,
    pub media_path: PathBuf,
    pub connect_timeout: Duration,
    pub disconnect_grace: Duration,
    pub reconnect_delay: Duration,
    pub max_sessions: usize,
    pub duplicate_offers: DuplicateOfferPolicy,
    pub insecure_tls: bool,
    pub display_name: String,
    pub log_filter: String,
}

impl Default for BuoyConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            identity: DEFAULT_IDENTITY.to_string(),
            room_id: room_id_for(DEFAULT_IDENTITY),
            credentials_url: DEFAULT_CREDENTIALS_URL.to_string(),
            credentials_user: DEFAULT_CREDENTIALS_USER.to_string(),
            media_path: PathBuf::from(DEFAULT_MEDIA_PATH),
            connect_timeout: Duration::from_secs(15),
            disconnect_grace: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(5),
            max_sessions: 0,
            duplicate_offers: DuplicateOfferPolicy::Replace,
            insecure_tls: false,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl BuoyConfig {
    /// Reads `BUOY_*` variables; anything unset or unparsable keeps its default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let identity = env::var("BUOY_IDENTITY").unwrap_or(defaults.identity);
        let room_id = env::var("BUOY_ROOM_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| room_id_for(&identity));
        Self {
            signaling_url: env::var("BUOY_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            identity,
            room_id,
            credentials_url: env::var("BUOY_CREDENTIALS_URL").unwrap_or(defaults.credentials_url),
            credentials_user: env::var("BUOY_CREDENTIALS_USER")
                .unwrap_or(defaults.credentials_user),
            media_path: env::var("BUOY_MEDIA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_path),
            connect_timeout: env_secs("BUOY_ICE_TIMEOUT_SECS").unwrap_or(defaults.connect_timeout),
            disconnect_grace: env_secs("BUOY_DISCONNECT_GRACE_SECS")
                .unwrap_or(defaults.disconnect_grace),
            reconnect_delay: env_secs("BUOY_RECONNECT_DELAY_SECS")
                .unwrap_or(defaults.reconnect_delay),
            max_sessions: env::var("BUOY_MAX_SESSIONS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_sessions),
            duplicate_offers: env::var("BUOY_DUPLICATE_OFFERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.duplicate_offers),
            insecure_tls: env::var("BUOY_INSECURE_TLS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.insecure_tls),
            display_name: env::var("BUOY_DISPLAY_NAME").unwrap_or(defaults.display_name),
            log_filter: env::var("RUST_LOG").unwrap_or(defaults.log_filter),
        }
    }

    /// Changes the identity and re-derives the room id from it.
    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = identity.into();
        self.room_id = room_id_for(&self.identity);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.room_url().map(|_| ())?;
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// `{signaling_url}/{room_id}`, with `http(s)` mapped to `ws(s)`.
    pub fn room_url(&self) -> Result<Url, ConfigError> {
        let base = self.signaling_url.trim();
        if base.is_empty() {
            return Err(ConfigError::EmptySignalingUrl);
        }
        let joined = format!("{}/{}", base.trim_end_matches('/'), self.room_id);
        let mut url = Url::parse(&joined).map_err(|err| ConfigError::InvalidSignalingUrl {
            url: base.to_string(),
            reason: err.to_string(),
        })?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| ConfigError::UnsupportedScheme(scheme.to_string()))?;
        }
        Ok(url)
    }

    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            connect_timeout: self.connect_timeout,
            disconnect_grace: self.disconnect_grace,
            limit: SessionLimit::from_max(self.max_sessions),
            duplicate_offers: self.duplicate_offers,
            media_path: self.media_path.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Lowercase hex of the first 30 characters of the normalized identity.
pub fn room_id_for(identity: &str) -> String {
    let normalized: String = identity
        .trim()
        .to_lowercase()
        .chars()
        .take(ROOM_ID_CHARS)
        .collect();
    hex::encode(normalized.as_bytes())
}

fn env_secs(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment mutation is process-wide; serialize the tests that touch it.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: &[&str] = &[
        "BUOY_SIGNALING_URL",
        "BUOY_IDENTITY",
        "BUOY_ROOM_ID",
        "BUOY_ICE_TIMEOUT_SECS",
        "BUOY_MAX_SESSIONS",
        "BUOY_DUPLICATE_OFFERS",
        "BUOY_INSECURE_TLS",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn derives_room_id_from_identity() {
        assert_eq!(room_id_for("bot@piedpie.net"), "626f7440706965647069652e6e6574");
        assert_eq!(room_id_for("  Bot@PiedPie.net "), room_id_for("bot@piedpie.net"));
        let long = "a".repeat(40);
        assert_eq!(room_id_for(&long), "61".repeat(30));
    }

    #[test]
    fn defaults_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = BuoyConfig::from_env();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.room_id, room_id_for(DEFAULT_IDENTITY));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.duplicate_offers, DuplicateOfferPolicy::Replace);
        assert!(!config.insecure_tls);
        assert_eq!(
            config.room_url().unwrap().as_str(),
            format!("wss://sig.piedpie.net/{}", config.room_id)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_overrides_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("BUOY_SIGNALING_URL", "http://127.0.0.1:9000/");
            env::set_var("BUOY_IDENTITY", "helper@example.com");
            env::set_var("BUOY_ICE_TIMEOUT_SECS", "4");
            env::set_var("BUOY_MAX_SESSIONS", "1");
            env::set_var("BUOY_DUPLICATE_OFFERS", "ignore");
            env::set_var("BUOY_INSECURE_TLS", "yes");
        }
        let config = BuoyConfig::from_env();
        clear_env();

        assert_eq!(config.room_id, room_id_for("helper@example.com"));
        assert_eq!(config.connect_timeout, Duration::from_secs(4));
        assert!(config.insecure_tls);
        let settings = config.call_settings();
        assert_eq!(settings.limit, SessionLimit::AtMost(1));
        assert_eq!(settings.duplicate_offers, DuplicateOfferPolicy::Ignore);
        assert_eq!(
            config.room_url().unwrap().as_str(),
            format!("ws://127.0.0.1:9000/{}", config.room_id)
        );
    }

    #[test]
    fn explicit_room_id_wins() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("BUOY_ROOM_ID", "lobby");
        }
        let config = BuoyConfig::from_env();
        clear_env();
        assert_eq!(config.room_id, "lobby");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = BuoyConfig::default();
        config.signaling_url = "  ".into();
        assert_eq!(config.validate(), Err(ConfigError::EmptySignalingUrl));

        config.signaling_url = "ftp://sig.example.net".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnsupportedScheme("ftp".into()))
        );

        config.signaling_url = DEFAULT_SIGNALING_URL.into();
        config.connect_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));
    }
}
