//! Configuration (§6 "Configuration", §2 ambient stack): a `serde`-deserializable
//! struct loaded from TOML, with a `Default` impl per field so a missing file
//! degrades to standalone single-node defaults.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub role: String,
    pub password: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 5432, dbname: "worldcache".into(), role: "worldcache".into(), password: String::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workers: usize,
    pub tcp_port: u16,
    pub ws_port: Option<u16>,
    pub broker_address: Option<String>,
    pub broker_port: Option<u16>,
    /// This node's area identifier. `0` means standalone (no broker
    /// registration), matching §6: "Missing broker fields mean standalone
    /// mode (area_id=0)".
    pub area_id: u64,
    pub db: DbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            tcp_port: 7000,
            ws_port: None,
            broker_address: None,
            broker_port: None,
            area_id: 0,
            db: DbConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file is not an error:
    /// it means standalone single-node defaults (§6: "Missing broker fields
    /// mean standalone mode (area_id=0)").
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// The upstream broker's address, if this node is configured to join one.
    pub fn broker_socket_addr(&self) -> Option<SocketAddr> {
        let host = self.broker_address.as_ref()?;
        let port = self.broker_port?;
        format!("{host}:{port}").parse().ok()
    }
}
