use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::registry::{AgentIdentity, AgentRegistry};
use crate::subject::{SubjectScheme, DEFAULT_NAMESPACE};
use crate::{MultiverseError, Result};

/// Environment variable naming the TOML overlay file.
pub const CONFIG_PATH_ENV: &str = "MULTIVERSE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "multiverse.toml";

/// Process-wide configuration, loaded once before any component starts.
///
/// Every live component of a deployment must agree on `namespace`, otherwise
/// they publish and subscribe on disjoint subjects.
#[derive(Clone, Debug)]
pub struct MultiverseConfig {
    pub broker: BrokerConfig,
    pub scheme: SubjectScheme,
    pub agents: Arc<AgentRegistry>,
}

impl Default for MultiverseConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            scheme: SubjectScheme::default(),
            agents: Arc::new(AgentRegistry::stock()),
        }
    }
}

impl MultiverseConfig {
    /// Defaults, overridden by environment variables:
    /// - `NATS_URL`: broker URL
    /// - `NATS_NAMESPACE`: subject namespace
    /// - `MULTIVERSE_CONNECT_TIMEOUT_MS`: connect timeout
    pub fn from_env() -> Result<Self> {
        let mut broker = BrokerConfig::default();
        if let Some(url) = env_nonempty("NATS_URL") {
            broker.url = url;
        }
        if let Some(ms) = env_nonempty("MULTIVERSE_CONNECT_TIMEOUT_MS") {
            let ms = ms.parse::<u64>().map_err(|e| {
                MultiverseError::Config(format!("MULTIVERSE_CONNECT_TIMEOUT_MS={ms:?}: {e}"))
            })?;
            broker.connect_timeout = Duration::from_millis(ms);
        }
        let namespace = env_nonempty("NATS_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.into());

        Ok(Self {
            broker,
            scheme: SubjectScheme::new(namespace)?,
            agents: Arc::new(AgentRegistry::stock()),
        })
    }

    /// Environment defaults with the TOML file from `MULTIVERSE_CONFIG` (or
    /// `./multiverse.toml`) overlaid when it exists.
    pub fn load() -> Result<Self> {
        let base = Self::from_env()?;
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(path = %path, "No TOML config found; using defaults/env");
            return Ok(base);
        }
        Self::load_file(p, base)
    }

    /// Overlays one TOML file onto `base`.
    pub fn load_file(path: &Path, base: Self) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let parsed: MultiverseToml = toml::from_str(&raw)
            .map_err(|e| MultiverseError::Config(format!("{}: {e}", path.display())))?;
        let cfg = parsed.overlay(base)?;
        tracing::info!(
            path = %path.display(),
            namespace = cfg.scheme.namespace(),
            agents = cfg.agents.len(),
            "Loaded TOML config"
        );
        Ok(cfg)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MultiverseToml {
    namespace: Option<String>,
    broker: Option<BrokerToml>,
    agents: Option<BTreeMap<String, AgentToml>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BrokerToml {
    url: Option<String>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentToml {
    display_name: Option<String>,
    role: Option<String>,
}

impl MultiverseToml {
    fn overlay(self, mut cfg: MultiverseConfig) -> Result<MultiverseConfig> {
        if let Some(ns) = self.namespace {
            cfg.scheme = SubjectScheme::new(ns)?;
        }
        if let Some(b) = self.broker {
            if let Some(url) = b.url {
                cfg.broker.url = url;
            }
            if let Some(ms) = b.connect_timeout_ms {
                cfg.broker.connect_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(agents) = self.agents {
            let identities = agents.into_iter().map(|(key, a)| AgentIdentity {
                display_name: a.display_name.unwrap_or_else(|| key.clone()),
                role: a.role.unwrap_or_default(),
                key,
            });
            cfg.agents = Arc::new(AgentRegistry::new(identities)?);
        }
        Ok(cfg)
    }
}
