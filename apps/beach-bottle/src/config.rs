use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

use crate::message_log::DEFAULT_BLOCK_SIZE;
use crate::signal::{DEFAULT_SIGNAL_SECRET, SignalCodec};
use crate::transport::webrtc::{DEFAULT_STUN_SERVER, WebRtcConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub address: Option<String>,
    pub storage_root: PathBuf,
    pub hub_url: Option<String>,
    pub hub_token: Option<String>,
    pub signal_secret: String,
    pub signal_ttl_seconds: u64,
    pub retry_interval_seconds: u64,
    pub block_size: usize,
    pub ice_servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: None,
            storage_root: default_storage_root(),
            hub_url: None,
            hub_token: None,
            signal_secret: DEFAULT_SIGNAL_SECRET.to_string(),
            signal_ttl_seconds: 10,
            retry_interval_seconds: 10,
            block_size: DEFAULT_BLOCK_SIZE,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

fn default_storage_root() -> PathBuf {
    ProjectDirs::from("", "", "beach-bottle")
        .map(|dirs| dirs.data_dir().join("medium"))
        .unwrap_or_else(|| PathBuf::from(".beach-bottle"))
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse().ok())
}

/// True when `name` is set to `1` or `true`.
pub(crate) fn flag(name: &str) -> bool {
    env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let address = env::var("BOTTLE_ADDRESS").ok().filter(|val| !val.trim().is_empty());
        let storage_root = env::var("BOTTLE_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root);
        let hub_url = env::var("BOTTLE_HUB_URL").ok().filter(|val| !val.trim().is_empty());
        let hub_token = env::var("BOTTLE_HUB_TOKEN").ok();
        let signal_secret =
            env::var("BOTTLE_SIGNAL_SECRET").unwrap_or(defaults.signal_secret);
        let signal_ttl_seconds = parse_var("BOTTLE_SIGNAL_TTL")
            .filter(|secs| *secs > 0)
            .unwrap_or(defaults.signal_ttl_seconds);
        let retry_interval_seconds = parse_var("BOTTLE_RETRY_INTERVAL")
            .filter(|secs| *secs > 0)
            .unwrap_or(defaults.retry_interval_seconds);
        let block_size = parse_var("BOTTLE_BLOCK_SIZE")
            .filter(|size| *size > 0)
            .unwrap_or(defaults.block_size);
        let ice_servers = if flag("BOTTLE_WEBRTC_DISABLE_STUN") {
            Vec::new()
        } else {
            env::var("BOTTLE_ICE_SERVERS")
                .map(|val| parse_list(&val))
                .unwrap_or(defaults.ice_servers)
        };

        Self {
            address,
            storage_root,
            hub_url,
            hub_token,
            signal_secret,
            signal_ttl_seconds,
            retry_interval_seconds,
            block_size,
            ice_servers,
        }
    }

    pub fn signal_ttl(&self) -> Duration {
        Duration::from_secs(self.signal_ttl_seconds)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }

    pub fn codec(&self) -> SignalCodec {
        SignalCodec::new(&self.signal_secret, self.signal_ttl())
    }

    pub fn webrtc(&self) -> WebRtcConfig {
        WebRtcConfig {
            ice_servers: self.ice_servers.clone(),
            ..WebRtcConfig::default()
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.signal_ttl(), Duration::from_secs(10));
        assert_eq!(config.retry_interval(), Duration::from_secs(10));
        assert_eq!(config.block_size, 10);
        assert_eq!(config.signal_secret, "chat-signal");
        assert_eq!(config.codec().ttl(), Duration::from_secs(10));
    }

    #[test]
    fn ice_server_lists_are_trimmed() {
        assert_eq!(
            parse_list(" stun:a:1, ,turn:b:2 "),
            vec!["stun:a:1".to_string(), "turn:b:2".to_string()]
        );
    }
}
