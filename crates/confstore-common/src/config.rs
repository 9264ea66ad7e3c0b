use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::StoreError;

/// The closed set of backend kinds the selector knows how to construct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Etcd,
    Env,
    File,
}

impl Default for BackendKind {
    fn default() -> Self {
        // Historical default when no backend is configured.
        BackendKind::Etcd
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Etcd => write!(f, "etcd"),
            BackendKind::Env => write!(f, "env"),
            BackendKind::File => write!(f, "file"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "etcd" => Ok(BackendKind::Etcd),
            "env" => Ok(BackendKind::Env),
            "file" => Ok(BackendKind::File),
            other => Err(StoreError::UnknownBackend(other.to_string())),
        }
    }
}

/// Everything needed to construct one store client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Backend node addresses (etcd endpoints, or the document path for
    /// the file backend). Ignored by the env backend.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Client TLS material, used only by network-backed adapters.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub client_ca_keys: Option<PathBuf>,
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            nodes: Vec::new(),
            client_cert: None,
            client_key: None,
            client_ca_keys: None,
            watch: WatchConfig::default(),
        }
    }
}

/// Knobs for the watch retry driver and polling backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// First backoff delay after a transient watch failure (milliseconds).
    pub initial_backoff_ms: u64,
    /// Backoff delay cap (milliseconds).
    pub max_backoff_ms: u64,
    /// Give up after this many retries of a transient failure. `None`
    /// retries until cancelled.
    pub max_retries: Option<u32>,
    /// Poll interval for backends with no native change notification
    /// (milliseconds).
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            max_retries: None,
            poll_interval_ms: 1_000,
        }
    }
}

/// Top-level process configuration for the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: BackendConfig,
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_known_names() {
        assert_eq!("etcd".parse::<BackendKind>().unwrap(), BackendKind::Etcd);
        assert_eq!("env".parse::<BackendKind>().unwrap(), BackendKind::Env);
        assert_eq!("file".parse::<BackendKind>().unwrap(), BackendKind::File);
        // Empty string falls back to the historical default.
        assert_eq!("".parse::<BackendKind>().unwrap(), BackendKind::Etcd);
    }

    #[test]
    fn kind_rejects_unknown_names() {
        let err = "zookeeper".parse::<BackendKind>().unwrap_err();
        match err {
            StoreError::UnknownBackend(name) => assert_eq!(name, "zookeeper"),
            other => panic!("expected UnknownBackend, got {other}"),
        }
    }

    #[test]
    fn backend_config_from_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [store]
            backend = "etcd"
            nodes = ["http://127.0.0.1:2379"]

            [store.watch]
            initial_backoff_ms = 100
            max_backoff_ms = 2000
            max_retries = 5
            poll_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.store.backend, BackendKind::Etcd);
        assert_eq!(cfg.store.nodes, vec!["http://127.0.0.1:2379"]);
        assert_eq!(cfg.store.watch.max_retries, Some(5));
    }

    #[test]
    fn load_from_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confstore.toml");
        std::fs::write(&path, "[store]\nbackend = \"file\"\nnodes = [\"/etc/app.yaml\"]\n")
            .unwrap();
        let cfg = Config::load_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store.backend, BackendKind::File);
        assert_eq!(cfg.store.nodes, vec!["/etc/app.yaml"]);
    }

    #[test]
    fn defaults_when_sections_missing() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.store.backend, BackendKind::Etcd);
        assert!(cfg.store.nodes.is_empty());
        assert_eq!(cfg.store.watch.initial_backoff_ms, 500);
        assert_eq!(cfg.store.watch.max_retries, None);
    }
}
