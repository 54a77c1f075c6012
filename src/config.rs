//! Configuration module for trellis
//!
//! Options come from three layers, later ones winning: built-in defaults, a
//! JSON config file, and `key=value` overlays (the file named by
//! `TRELLIS_CONFIG` plus command-line settings).

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_rpc() -> String {
    "http://127.0.0.1:8545/".to_string()
}

fn default_stun() -> String {
    "stun:stun.l.google.com:19302".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_path() -> String {
    "/".to_string()
}

fn default_group() -> PathBuf {
    PathBuf::from(".")
}

fn default_address() -> Ipv4Addr {
    crate::tun::TunConfig::default().address
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Diffie-Hellman parameters (PEM encoded). Accepted for compatibility;
    /// the TLS stack manages its own key exchange.
    pub dh: Option<PathBuf>,
    /// Ethereum JSON-RPC endpoint
    pub rpc: String,
    /// Lottery contract address
    pub eth_lottery: String,
    /// STUN server url offered to peers
    pub stun: String,
    /// Hostname to advertise; defaults to the system hostname
    pub host: Option<String>,
    /// TLS listen port for signalling
    pub port: u16,
    /// Signalling POST path
    pub path: String,
    /// TLS identity: a PEM bundle holding the private key and chain
    pub tls: Option<PathBuf>,
    /// Upstream OpenVPN configuration
    pub ovpn_file: Option<PathBuf>,
    pub ovpn_user: String,
    pub ovpn_pass: String,
    /// Data directory holding the flow journal
    pub group: PathBuf,
    /// Capture address on the tun interface
    pub address: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dh: None,
            rpc: default_rpc(),
            eth_lottery: String::new(),
            stun: default_stun(),
            host: None,
            port: default_port(),
            path: default_path(),
            tls: None,
            ovpn_file: None,
            ovpn_user: String::new(),
            ovpn_pass: String::new(),
            group: default_group(),
            address: default_address(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|error| Error::Config(format!("failed to read config file: {}", error)))?;
        serde_json::from_str(&content)
            .map_err(|error| Error::Config(format!("failed to parse config: {}", error)))
    }

    /// Overlay `key=value` lines from a file, as named by `TRELLIS_CONFIG`.
    /// Blank lines and `#` comments are skipped.
    pub fn overlay_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let content = std::fs::read_to_string(&path)
            .map_err(|error| Error::Config(format!("failed to read config file: {}", error)))?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("expected key=value, got: {}", line)))?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Set one option by its command-line name.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "dh" => self.dh = Some(PathBuf::from(value)),
            "rpc" => self.rpc = value.to_string(),
            "eth-lottery" => self.eth_lottery = value.to_string(),
            "stun" => self.stun = value.to_string(),
            "host" => self.host = Some(value.to_string()),
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid port: {}", value)))?;
            }
            "path" => self.path = value.to_string(),
            "tls" => self.tls = Some(PathBuf::from(value)),
            "ovpn-file" => self.ovpn_file = Some(PathBuf::from(value)),
            "ovpn-user" => self.ovpn_user = value.to_string(),
            "ovpn-pass" => self.ovpn_pass = value.to_string(),
            "group" => self.group = PathBuf::from(value),
            "address" => {
                self.address = value
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid address: {}", value)))?;
            }
            unknown => return Err(Error::Config(format!("unknown option: {}", unknown))),
        }
        Ok(())
    }

    /// The hostname peers should reach this node at.
    pub fn advertised_host(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
        }
    }

    /// The flow journal file inside the data directory.
    pub fn journal_path(&self) -> PathBuf {
        self.group.join("analysis.db")
    }
}
