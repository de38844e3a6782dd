//! Configuration file parser for PkTunnel
//!
//! Supports pktunnel.yml with the frontend address and one entry per kite,
//! each carrying its shared secret and the local service it forwards to.

use anyhow::{Context, Result};
use pktunnel_shared::Kite;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Frontend relay, as host:port
    #[serde(default = "default_frontend")]
    pub frontend: String,

    /// Wrap the tunnel connection in TLS
    #[serde(default)]
    pub tls: bool,

    /// Name to verify the frontend certificate against (default: frontend host)
    pub tls_name: Option<String>,

    /// Kite definitions
    #[serde(default)]
    pub kites: Vec<KiteConfig>,
}

/// Single kite definition
#[derive(Clone, Serialize, Deserialize)]
pub struct KiteConfig {
    /// Protocol: http, https, raw, ...
    #[serde(default = "default_proto")]
    pub proto: String,

    /// Public domain name the frontend serves this kite on
    pub domain: String,

    /// Public port (0 = protocol default)
    #[serde(default)]
    pub port: u16,

    /// Shared secret used to sign kite requests
    pub secret: String,

    /// Local hostname to forward to (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Local port to forward traffic to
    pub local_port: u16,
}

// Secrets stay out of logs.
impl std::fmt::Debug for KiteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiteConfig")
            .field("proto", &self.proto)
            .field("domain", &self.domain)
            .field("port", &self.port)
            .field("local_host", &self.local_host)
            .field("local_port", &self.local_port)
            .finish()
    }
}

impl KiteConfig {
    pub fn to_kite(&self) -> Kite {
        Kite::new(
            self.proto.clone(),
            self.domain.to_ascii_lowercase(),
            self.port,
            self.local_host.clone(),
            self.local_port,
            self.secret.clone(),
        )
    }

    /// Parses a `proto:domain[:port]` kite argument from the command line.
    pub fn from_arg(arg: &str, secret: String, local_port: u16) -> Result<Self> {
        let mut parts = arg.split(':');
        let proto = parts.next().unwrap_or_default();
        let domain = parts
            .next()
            .with_context(|| format!("Kite '{}' is not proto:domain[:port]", arg))?;
        let port = match parts.next() {
            Some(port) => port
                .parse()
                .with_context(|| format!("Invalid public port in kite '{}'", arg))?,
            None => 0,
        };
        if parts.next().is_some() {
            anyhow::bail!("Kite '{}' is not proto:domain[:port]", arg);
        }

        Ok(Self {
            proto: proto.to_string(),
            domain: domain.to_string(),
            port,
            secret,
            local_host: default_host(),
            local_port,
        })
    }
}

pub(crate) fn default_frontend() -> String {
    "localhost:8080".to_string()
}

fn default_proto() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.frontend_addr()?;

        if self.kites.is_empty() {
            anyhow::bail!("No kites defined in configuration");
        }

        for kite in &self.kites {
            let name = format!("{}:{}", kite.proto, kite.domain);
            if kite.proto.is_empty() || !kite.proto.bytes().all(|b| b.is_ascii_alphanumeric()) {
                anyhow::bail!("Invalid protocol '{}' for kite '{}'", kite.proto, name);
            }
            let domain_ok = kite
                .domain
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_');
            if kite.domain.is_empty() || !domain_ok {
                anyhow::bail!("Invalid domain for kite '{}'", name);
            }
            if kite.secret.is_empty() {
                anyhow::bail!("Kite '{}' has no secret", name);
            }
            if kite.local_port == 0 {
                anyhow::bail!("Invalid local port 0 for kite '{}'", name);
            }
        }

        Ok(())
    }

    /// Splits `frontend` into host and port.
    pub fn frontend_addr(&self) -> Result<(String, u16)> {
        let (host, port) = self
            .frontend
            .rsplit_once(':')
            .with_context(|| format!("Frontend '{}' is not host:port", self.frontend))?;
        let port = port
            .parse()
            .with_context(|| format!("Invalid port in frontend '{}'", self.frontend))?;
        if host.is_empty() {
            anyhow::bail!("Frontend '{}' has no host", self.frontend);
        }
        Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "pktunnel.yml",
            "pktunnel.yaml",
            ".pktunnel.yml",
            ".pktunnel.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
