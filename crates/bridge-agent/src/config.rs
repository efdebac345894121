//! Agent configuration file.
//!
//! YAML, one entry per logical server plus the local network settings:
//!
//! ```yaml
//! network: 10.10.10.0/24
//! iface: lo0
//! endpoints:
//!   - name: dev
//!     endpoint: dev-cluster.example.com:50000
//!   - name: staging
//!     kubernetes:
//!       config: /home/me/.kube/config
//!       namespace: bridgemux
//!       endpoint: bridgemux
//!       context: staging
//!       port: "50000"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CONFIG";

const DEFAULT_NETWORK: &str = "10.10.10.0/24";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error loading config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Spec for the external Kubernetes port-forward helper. The core only
/// carries it; a non-empty spec means the endpoint is reached through a
/// forwarded local port instead of a direct address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesInfo {
    pub config: String,
    pub namespace: String,
    pub endpoint: String,
    pub context: String,
    pub port: String,
}

impl KubernetesInfo {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub name: String,
    pub endpoint: String,
    pub kubernetes: KubernetesInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: String,
    pub iface: String,
    #[serde(rename = "logLevel")]
    pub log_level: String,
    pub endpoints: Vec<Endpoint>,
}

impl Config {
    /// Load from `path`, the `CONFIG` environment variable, or the platform
    /// default location, in that order of preference (env wins over the
    /// argument, matching the daemon's historical behavior).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(env_path) if !env_path.is_empty() => PathBuf::from(env_path),
            _ => path.map(Path::to_path_buf).unwrap_or_else(Self::default_path),
        };

        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.fill_defaults();
        Ok(config)
    }

    pub fn fill_defaults(&mut self) {
        if self.network.is_empty() {
            self.network = DEFAULT_NETWORK.to_string();
        }
        if self.iface.is_empty() {
            self.iface = default_iface().to_string();
        }
        if self.log_level.is_empty() {
            self.log_level = "info".to_string();
        }
    }

    pub fn find_endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    pub fn default_path() -> PathBuf {
        if cfg!(target_os = "macos") {
            PathBuf::from("/usr/local/etc/bridgemux/bridgemux.yaml")
        } else {
            PathBuf::from("/etc/bridgemux/bridgemux.yaml")
        }
    }
}

fn default_iface() -> &'static str {
    if cfg!(target_os = "macos") {
        "lo0"
    } else {
        "lo"
    }
}
