use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, WarrenError};

/// One configured agent instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Registered kind name, e.g. `geofencing`.
    pub kind: String,
    /// Agents whose events this one listens to. Empty means any origin.
    #[serde(default)]
    pub source_ids: BTreeSet<String>,
    /// Overrides the agent's default check interval.
    #[serde(default)]
    pub schedule_ms: Option<u64>,
    #[serde(default)]
    pub options: Value,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, options: Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: kind.into(),
            source_ids: BTreeSet::new(),
            schedule_ms: None,
            options,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_ids = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_schedule_ms(mut self, ms: u64) -> Self {
        self.schedule_ms = Some(ms);
        self
    }
}

/// Admin HTTP surface configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

/// Top-level runtime configuration, usually read from `warren.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/state")
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            admin: AdminConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| WarrenError::Config(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Load from a TOML file (path via WARREN_CONFIG or ./warren.toml), then
    /// overlay environment overrides. A missing file yields defaults; a
    /// present but unparseable one is an error.
    pub fn load() -> Result<Self> {
        let path = std::env::var("WARREN_CONFIG").unwrap_or_else(|_| "warren.toml".into());
        let p = Path::new(&path);
        let cfg = if p.exists() {
            Self::from_file(p)?
        } else {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            Self::default()
        };
        Ok(cfg.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(path) = std::env::var("WARREN_STATE_PATH")
            .ok()
            .filter(|s| !s.is_empty())
        {
            self.state_path = PathBuf::from(path);
        }
        if let Ok(host) = std::env::var("WARREN_ADMIN_HOST") {
            if !host.is_empty() {
                self.admin.host = host;
            }
        }
        if let Some(port) = std::env::var("WARREN_ADMIN_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.admin.port = port;
        }
        if let Some(enabled) = std::env::var("WARREN_ADMIN")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.admin.enabled = enabled;
        }
        self
    }
}
