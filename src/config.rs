// Copyright 2022 The Agentd Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resolved agent configuration.
//!
//! Loaded once at startup from a TOML file, defaults applied during
//! deserialization, then treated as immutable. Paths are interpreted
//! relative to the chroot directory unless absolute.

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use std::convert::TryFrom;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::status::{self, StatusWord};

/// Default client-facing listen endpoint.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:4931";

/// Configuration subsystem errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

impl ConfigError {
    pub fn status(&self) -> StatusWord {
        match self {
            ConfigError::Read { .. } => status::config::READ_FAILURE,
            ConfigError::Parse(_) => status::config::PARSE_FAILURE,
            ConfigError::InvalidValue(_) => status::config::INVALID_VALUE,
        }
    }
}

/// The `user:group` pair services drop privileges to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserGroup {
    pub user: String,
    pub group: String,
}

impl Default for UserGroup {
    fn default() -> Self {
        Self {
            user: "veloagent".to_owned(),
            group: "veloagent".to_owned(),
        }
    }
}

impl TryFrom<String> for UserGroup {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        let mut parts = value.splitn(2, ':');
        let user = parts.next().unwrap_or("").trim();
        let group = parts.next().unwrap_or("").trim();
        if user.is_empty() || group.is_empty() {
            return Err(format!("expected `user:group`, got `{}`", value));
        }
        Ok(Self {
            user: user.to_owned(),
            group: group.to_owned(),
        })
    }
}

impl From<UserGroup> for String {
    fn from(value: UserGroup) -> String {
        format!("{}:{}", value.user, value.group)
    }
}

/// One grant inside a per-entity capability view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewGrant {
    /// Verb name, resolved against the protocol-service capability table.
    pub verb: String,
    /// Target entity; absent means the "any object" sentinel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Uuid>,
}

/// A per-entity capability view from the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewConfig {
    /// The subject entity the grants apply to.
    pub entity: Uuid,
    /// Hex-encoded X25519 public encryption key of the entity.
    pub encryption_key: String,
    /// Hex-encoded Ed25519 public signing key of the entity.
    pub signing_key: String,
    #[serde(default)]
    pub grants: Vec<ViewGrant>,
}

fn default_logdir() -> PathBuf {
    PathBuf::from("log")
}

fn default_loglevel() -> u32 {
    4
}

fn default_database_max_size() -> u64 {
    16 * 1024 * 1024 * 1024 * 1024
}

fn default_block_max_milliseconds() -> u64 {
    5000
}

fn default_block_max_transactions() -> u32 {
    500
}

fn default_secret() -> PathBuf {
    PathBuf::from("root/secret.cert")
}

fn default_rootblock() -> PathBuf {
    PathBuf::from("root/root.cert")
}

fn default_datastore() -> PathBuf {
    PathBuf::from("data")
}

fn default_listen() -> Vec<SocketAddr> {
    vec![DEFAULT_LISTEN.parse().expect("default listen endpoint")]
}

/// The resolved agent configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub logdir: PathBuf,
    pub loglevel: u32,
    pub database_max_size: u64,
    pub block_max_milliseconds: u64,
    pub block_max_transactions: u32,
    pub secret: PathBuf,
    pub rootblock: PathBuf,
    pub datastore: PathBuf,
    pub listen: Vec<SocketAddr>,
    /// Overrides the bootstrap prefix directory when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chroot: Option<PathBuf>,
    pub usergroup: UserGroup,
    pub view: Vec<ViewConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            logdir: default_logdir(),
            loglevel: default_loglevel(),
            database_max_size: default_database_max_size(),
            block_max_milliseconds: default_block_max_milliseconds(),
            block_max_transactions: default_block_max_transactions(),
            secret: default_secret(),
            rootblock: default_rootblock(),
            datastore: default_datastore(),
            listen: default_listen(),
            chroot: None,
            usergroup: UserGroup::default(),
            view: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Loads and validates a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_owned(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loglevel > 9 {
            return Err(ConfigError::InvalidValue(format!(
                "loglevel {} out of range 0..=9",
                self.loglevel
            )));
        }
        if self.block_max_milliseconds == 0 {
            return Err(ConfigError::InvalidValue(
                "block_max_milliseconds must be positive".to_owned(),
            ));
        }
        if self.block_max_transactions == 0 {
            return Err(ConfigError::InvalidValue(
                "block_max_transactions must be positive".to_owned(),
            ));
        }
        if self.database_max_size == 0 {
            return Err(ConfigError::InvalidValue(
                "database_max_size must be positive".to_owned(),
            ));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::InvalidValue(
                "at least one listen endpoint is required".to_owned(),
            ));
        }
        Ok(())
    }

    /// The chroot directory, falling back to the bootstrap prefix.
    pub fn chroot_or<'a>(&'a self, prefix_dir: &'a Path) -> &'a Path {
        self.chroot.as_deref().unwrap_or(prefix_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_contract() {
        let config = AgentConfig::default();
        assert_eq!(config.logdir, PathBuf::from("log"));
        assert_eq!(config.loglevel, 4);
        assert_eq!(config.database_max_size, 16 * 1024 * 1024 * 1024 * 1024);
        assert_eq!(config.block_max_milliseconds, 5000);
        assert_eq!(config.block_max_transactions, 500);
        assert_eq!(config.secret, PathBuf::from("root/secret.cert"));
        assert_eq!(config.rootblock, PathBuf::from("root/root.cert"));
        assert_eq!(config.datastore, PathBuf::from("data"));
        assert_eq!(config.listen, vec![DEFAULT_LISTEN.parse().unwrap()]);
        assert_eq!(config.chroot, None);
        assert_eq!(config.usergroup, UserGroup::default());
        assert!(config.view.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parses_partial_file_with_defaults() {
        let text = r#"
            loglevel = 7
            block_max_transactions = 100
            usergroup = "agent:agentgrp"
            listen = ["127.0.0.1:7000"]
        "#;
        let config: AgentConfig = toml::from_str(text).unwrap();
        assert_eq!(config.loglevel, 7);
        assert_eq!(config.block_max_transactions, 100);
        assert_eq!(config.usergroup.user, "agent");
        assert_eq!(config.usergroup.group, "agentgrp");
        assert_eq!(config.listen, vec!["127.0.0.1:7000".parse().unwrap()]);
        // Untouched keys keep their defaults.
        assert_eq!(config.block_max_milliseconds, 5000);
    }

    #[test]
    fn bad_usergroup_rejected() {
        let text = r#"usergroup = "justuser""#;
        assert!(toml::from_str::<AgentConfig>(text).is_err());
    }

    #[test]
    fn out_of_range_loglevel_rejected() {
        let config = AgentConfig {
            loglevel: 12,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentd.conf");
        std::fs::write(&path, "loglevel = 2\nchroot = \"/opt/agent\"\n").unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.loglevel, 2);
        assert_eq!(config.chroot.as_deref(), Some(Path::new("/opt/agent")));
        assert_eq!(
            config.chroot_or(Path::new("/fallback")),
            Path::new("/opt/agent")
        );

        let defaulted = AgentConfig::default();
        assert_eq!(
            defaulted.chroot_or(Path::new("/fallback")),
            Path::new("/fallback")
        );
    }

    #[test]
    fn view_entries_parse() {
        let text = r#"
            [[view]]
            entity = "11111111-2222-3333-4444-555555555555"
            encryption_key = "00"
            signing_key = "00"

            [[view.grants]]
            verb = "transaction_submit"
        "#;
        let config: AgentConfig = toml::from_str(text).unwrap();
        assert_eq!(config.view.len(), 1);
        assert_eq!(config.view[0].grants.len(), 1);
        assert_eq!(config.view[0].grants[0].verb, "transaction_submit");
        assert_eq!(config.view[0].grants[0].object, None);
    }
}
