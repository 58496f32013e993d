//! TOML-based controller configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Port assigned to OpenFlow by IANA.
pub const OFP_TCP_PORT: u16 = 6653;

/// Controller configuration loaded from a TOML file. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Address the controller listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Protocol versions offered to switches, as wire version numbers (1 = OpenFlow 1.0).
    #[serde(default = "default_versions")]
    pub versions: Vec<u8>,
    /// Seconds allowed for the hello exchange.
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    /// Idle seconds before a keepalive echo is sent. 0 disables keepalive.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Seconds to wait for any frame after a keepalive echo.
    #[serde(default = "default_keepalive_grace")]
    pub keepalive_grace_secs: u64,
    /// Whether our hello carries a version bitmap.
    #[serde(default = "default_advertise_bitmap")]
    pub advertise_bitmap: bool,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], OFP_TCP_PORT))
}

fn default_versions() -> Vec<u8> {
    vec![1]
}

fn default_negotiation_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_grace() -> u64 {
    10
}

fn default_advertise_bitmap() -> bool {
    true
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            versions: default_versions(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_grace_secs: default_keepalive_grace(),
            advertise_bitmap: default_advertise_bitmap(),
        }
    }
}

impl ControllerConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.versions.is_empty() {
            return Err(ConfigError::Invalid("versions must not be empty".into()));
        }
        if self.versions.contains(&0) {
            return Err(ConfigError::Invalid("version 0 is not a protocol version".into()));
        }
        if self.negotiation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "negotiation_timeout_secs must be positive".into(),
            ));
        }
        if self.keepalive_interval_secs > 0 && self.keepalive_grace_secs == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_grace_secs must be positive when keepalive is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Settings each accepted connection runs with.
    pub fn channel_config(&self) -> ChannelConfig {
        let mut versions = self.versions.clone();
        versions.sort_unstable();
        versions.dedup();
        ChannelConfig {
            versions,
            negotiation_timeout: Duration::from_secs(self.negotiation_timeout_secs),
            keepalive_interval: match self.keepalive_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            keepalive_grace: Duration::from_secs(self.keepalive_grace_secs),
            advertise_bitmap: self.advertise_bitmap,
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Supported versions, ascending, without duplicates.
    pub versions: Vec<u8>,
    pub negotiation_timeout: Duration,
    /// `None` disables keepalive echoes.
    pub keepalive_interval: Option<Duration>,
    pub keepalive_grace: Duration,
    pub advertise_bitmap: bool,
}

impl ChannelConfig {
    /// Highest supported version, used in the header of our hello.
    pub fn highest_version(&self) -> u8 {
        self.versions.last().copied().unwrap_or(1)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ControllerConfig::default().channel_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_toml() {
        let config = ControllerConfig::parse("").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.listen.port(), 6653);
        assert_eq!(config.versions, vec![1]);
    }

    #[test]
    fn parse_full_config() {
        let config = ControllerConfig::parse(
            r#"
            listen = "127.0.0.1:6633"
            versions = [4, 1, 4]
            negotiation_timeout_secs = 5
            keepalive_interval_secs = 0
            keepalive_grace_secs = 3
            advertise_bitmap = false
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:6633".parse().unwrap());
        let channel = config.channel_config();
        assert_eq!(channel.versions, vec![1, 4]);
        assert_eq!(channel.highest_version(), 4);
        assert_eq!(channel.negotiation_timeout, Duration::from_secs(5));
        assert_eq!(channel.keepalive_interval, None);
        assert!(!channel.advertise_bitmap);
    }

    #[test]
    fn default_channel_config_matches_protocol_timers() {
        let channel = ChannelConfig::default();
        assert_eq!(channel.negotiation_timeout, Duration::from_secs(30));
        assert_eq!(channel.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(channel.keepalive_grace, Duration::from_secs(10));
        assert!(channel.advertise_bitmap);
    }

    #[test]
    fn test_parse_malformed_toml() {
        let err = ControllerConfig::parse("listen = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_parse_invalid_socket_addr() {
        assert!(ControllerConfig::parse(r#"listen = "not an address""#).is_err());
    }

    #[test]
    fn test_parse_unknown_field() {
        assert!(ControllerConfig::parse("verison = [1]").is_err());
    }

    #[test]
    fn test_validate_rejects_empty_versions() {
        let err = ControllerConfig::parse("versions = []").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_version_zero() {
        let err = ControllerConfig::parse("versions = [0, 1]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
