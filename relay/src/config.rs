//! Relay configuration: environment variables plus a YAML file with the
//! kites this frontend is willing to serve and their shared secrets.

use anyhow::{Context, Result};
use pktunnel_shared::Kite;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen port for backends and visitors alike
    pub port: u16,
    /// YAML file listing the known kites
    pub kites_path: Option<PathBuf>,
    /// Point reject pages at the hosted offline page
    pub advertise: bool,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match var("PKTUNNEL_PORT") {
            Some(port) => port
                .parse()
                .with_context(|| format!("Invalid PKTUNNEL_PORT: {}", port))?,
            None => 8080,
        };
        let advertise = matches!(
            var("PKTUNNEL_ADVERTISE").as_deref(),
            Some("1") | Some("true") | Some("yes")
        );

        Ok(Self {
            port,
            kites_path: var("PKTUNNEL_KITES").map(PathBuf::from),
            advertise,
        })
    }
}

/// One kite entry in the kites file
#[derive(Clone, Deserialize)]
pub struct KiteEntry {
    #[serde(default = "default_proto")]
    pub proto: String,
    pub domain: String,
    #[serde(default)]
    pub port: u16,
    pub secret: String,
}

fn default_proto() -> String {
    "http".to_string()
}

/// Known kites, keyed by canonical kite name.
#[derive(Debug, Default)]
pub struct KiteTable {
    kites: HashMap<String, Arc<Kite>>,
}

impl KiteTable {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read kites file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse kites file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let entries: Vec<KiteEntry> = serde_yaml::from_str(content)?;
        let mut kites = HashMap::new();
        for entry in entries {
            if entry.secret.is_empty() {
                anyhow::bail!("Kite {}:{} has no secret", entry.proto, entry.domain);
            }
            let kite = Kite::new(
                entry.proto,
                entry.domain.to_ascii_lowercase(),
                entry.port,
                "",
                0,
                entry.secret,
            );
            let name = kite.name();
            if kites.insert(name.clone(), Arc::new(kite)).is_some() {
                anyhow::bail!("Kite {} is listed twice", name);
            }
        }
        Ok(Self { kites })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Kite>> {
        self.kites.get(name)
    }

    pub fn len(&self) -> usize {
        self.kites.len()
    }
}
