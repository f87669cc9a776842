//! Configuration Module
//!
//! The server is configured by a JSON file whose path is passed on the command
//! line. Missing fields fall back to defaults; `validate` rejects layouts the
//! store cannot run with before anything touches the data directory.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "shardkv", about = "Sharded key-value store server")]
pub struct CliArgs {
    /// Path to the JSON config file.
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported network {0:?}, only \"tcp\" is served")]
    UnsupportedNetwork(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("repl_master and repl_client are mutually exclusive")]
    ConflictingRoles,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplMasterConfig {
    pub address: SocketAddr,
    /// Secret replicas must present. Empty accepts any replica.
    #[serde(default)]
    pub auth_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplClientConfig {
    pub address: SocketAddr,
    #[serde(default)]
    pub auth_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Standalone,
    Master(ReplMasterConfig),
    Replica(ReplClientConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub network: String,
    pub address: SocketAddr,
    /// Shared client secret. Empty disables authentication.
    pub auth_secret: String,
    pub dir: PathBuf,
    pub parts: u32,
    pub blocks_per_part: u32,
    pub expiry_scan_period_secs: u64,
    pub persist_period_secs: u64,
    /// How often a master checks its Blocks for changes owed to replicas.
    pub repl_sync_period_ms: u64,
    /// How often a replica writes its bookmark when it has moved.
    pub repl_state_period_secs: u64,
    pub repl_master: Option<ReplMasterConfig>,
    pub repl_client: Option<ReplClientConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            address: SocketAddr::from(([127, 0, 0, 1], 8100)),
            auth_secret: String::new(),
            dir: PathBuf::from("data"),
            parts: 8,
            blocks_per_part: 8,
            expiry_scan_period_secs: 10,
            persist_period_secs: 10,
            repl_sync_period_ms: 100,
            repl_state_period_secs: 10,
            repl_master: None,
            repl_client: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network != "tcp" {
            return Err(ConfigError::UnsupportedNetwork(self.network.clone()));
        }
        if self.parts == 0 {
            return Err(ConfigError::Zero("parts"));
        }
        if self.blocks_per_part == 0 {
            return Err(ConfigError::Zero("blocks_per_part"));
        }
        if self.expiry_scan_period_secs == 0 {
            return Err(ConfigError::Zero("expiry_scan_period_secs"));
        }
        if self.persist_period_secs == 0 {
            return Err(ConfigError::Zero("persist_period_secs"));
        }
        if self.repl_sync_period_ms == 0 {
            return Err(ConfigError::Zero("repl_sync_period_ms"));
        }
        if self.repl_state_period_secs == 0 {
            return Err(ConfigError::Zero("repl_state_period_secs"));
        }
        if self.repl_master.is_some() && self.repl_client.is_some() {
            return Err(ConfigError::ConflictingRoles);
        }
        Ok(())
    }

    pub fn role(&self) -> Role {
        match (&self.repl_master, &self.repl_client) {
            (Some(master), _) => Role::Master(master.clone()),
            (None, Some(client)) => Role::Replica(client.clone()),
            (None, None) => Role::Standalone,
        }
    }

    pub fn expiry_scan_period(&self) -> Duration {
        Duration::from_secs(self.expiry_scan_period_secs)
    }

    pub fn persist_period(&self) -> Duration {
        Duration::from_secs(self.persist_period_secs)
    }

    pub fn repl_sync_period(&self) -> Duration {
        Duration::from_millis(self.repl_sync_period_ms)
    }

    pub fn repl_state_period(&self) -> Duration {
        Duration::from_secs(self.repl_state_period_secs)
    }
}

#[cfg(test)]
mod tests;
