//! Master configuration: tunable limits, bans and the auth user table
//!
//! Loaded from a TOML file at startup and again on every reload signal.

use crate::auth::{UserRecord, UserTable};
use crate::bans::{BanEntry, BanList, BanScope};
use protocol::{IpMask, MaskParseError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid ban mask `{mask}`: {source}")]
    BadMask {
        mask: String,
        #[source]
        source: MaskParseError,
    },
}

/// Resource limits and timers. Times are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Bytes of unterminated input a session may buffer
    pub input_limit: usize,
    /// Bytes of pending direct output before a session is dropped
    pub output_limit: usize,
    pub client_limit: usize,
    /// Sessions per address before the oldest is evicted
    pub dup_limit: usize,
    /// Idle time before a plain client is dropped
    pub client_time_ms: u64,
    pub server_limit: usize,
    pub server_dup_limit: usize,
    pub ping_time_ms: u64,
    pub ping_retry: u32,
    /// Idle time for registered game servers, both session and list entry
    pub keepalive_time_ms: u64,
    pub auth_time_ms: u64,
    pub auth_limit: usize,
    pub auth_throttle_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            input_limit: 4096,
            output_limit: 64 * 1024,
            client_limit: 4096,
            dup_limit: 16,
            client_time_ms: 3 * 60 * 1000,
            server_limit: 4096,
            server_dup_limit: 10,
            ping_time_ms: 3000,
            ping_retry: 5,
            keepalive_time_ms: 65 * 60 * 1000,
            auth_time_ms: 30 * 1000,
            auth_limit: 100,
            auth_throttle_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BanConfig {
    pub scope: BanScope,
    pub mask: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub expires: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub pubkey: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, rename = "ban")]
    pub bans: Vec<BanConfig>,
    #[serde(default, rename = "user")]
    pub users: Vec<UserConfig>,
}

impl MasterConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads the config file. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn ban_list(&self) -> Result<BanList, ConfigError> {
        let mut bans = BanList::new();
        for ban in &self.bans {
            let mask: IpMask = ban.mask.parse().map_err(|source| ConfigError::BadMask {
                mask: ban.mask.clone(),
                source,
            })?;
            let mut entry = BanEntry::new(ban.scope, mask);
            entry.reason = ban.reason.clone();
            entry.expiry = ban.expires;
            bans.add(entry);
        }
        Ok(bans)
    }

    pub fn user_table(&self) -> UserTable {
        let mut users = UserTable::new();
        for user in &self.users {
            users.insert(UserRecord::new(&user.name, &user.pubkey));
        }
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MasterConfig::from_toml("").unwrap();
        assert_eq!(config.limits, Limits::default());
        assert!(config.bans.is_empty());
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_partial_limits_keep_other_defaults() {
        let config = MasterConfig::from_toml("[limits]\ndup_limit = 2\nping_retry = 1\n").unwrap();
        assert_eq!(config.limits.dup_limit, 2);
        assert_eq!(config.limits.ping_retry, 1);
        assert_eq!(config.limits.client_limit, 4096);
        assert_eq!(config.limits.keepalive_time_ms, 65 * 60 * 1000);
    }

    #[test]
    fn test_bans_and_users() {
        let text = r#"
            [[ban]]
            scope = "client"
            mask = "10.0.0.0/24"
            reason = "flooding"

            [[ban]]
            scope = "global"
            mask = "192.168"
            expires = 2000000000

            [[user]]
            name = "alice"
            pubkey = "+deadbeef"
        "#;
        let config = MasterConfig::from_toml(text).unwrap();
        let bans = config.ban_list().unwrap();

        assert_eq!(bans.len(), 2);
        assert!(bans.matches(BanScope::Client, Ipv4Addr::new(10, 0, 0, 5)));
        assert!(bans.matches(BanScope::Global, Ipv4Addr::new(192, 168, 9, 9)));
        let global: Vec<_> = bans.entries(BanScope::Global).collect();
        assert_eq!(global[0].expiry, Some(2_000_000_000));

        let users = config.user_table();
        assert_eq!(users.get("alice").map(|u| u.pubkey.as_str()), Some("+deadbeef"));
    }

    #[test]
    fn test_bad_scope_is_parse_error() {
        let text = "[[ban]]\nscope = \"everyone\"\nmask = \"1.2.3.4\"\n";
        assert!(matches!(MasterConfig::from_toml(text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_bad_mask_is_reported() {
        let text = "[[ban]]\nscope = \"server\"\nmask = \"1.2.3.999\"\n";
        let config = MasterConfig::from_toml(text).unwrap();
        assert!(matches!(config.ban_list(), Err(ConfigError::BadMask { .. })));
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let path = std::env::temp_dir().join("masterserver-config-does-not-exist.toml");
        assert!(MasterConfig::load(&path).unwrap().is_none());
    }
}
