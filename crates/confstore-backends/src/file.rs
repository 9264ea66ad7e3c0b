use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use confstore_common::{Result, StoreError};

use crate::retry::{watch_with_backoff, RetryPolicy};
use crate::store::{key_in_subtree, StoreClient};

const BACKEND: &str = "file";

/// Store client backed by a local YAML (or JSON) document.
///
/// The document's nested mappings and sequences are flattened into
/// hierarchical keys: `{database: {host: h}}` becomes `/database/host`.
/// The filesystem has no long-poll primitive, so watching polls the
/// subtree under the requested prefix at a bounded interval and reports a
/// change through an internal monotonic version counter. Unreadable or
/// unparsable documents are connectivity failures, absorbed by the watch
/// retry driver and surfaced directly from reads.
pub struct FileClient {
    path: PathBuf,
    poll_interval: Duration,
    retry: RetryPolicy,
    state: Mutex<WatchState>,
}

struct WatchState {
    version: u64,
    /// Last observed content per watched prefix.
    subtrees: HashMap<String, Subtree>,
}

impl Default for WatchState {
    fn default() -> Self {
        Self {
            // Index 0 is reserved for "no prior knowledge", so observed
            // versions start at 1. A caller feeding a returned index back
            // into watch_prefix must block, not re-enter the fast path.
            version: 1,
            subtrees: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy)]
struct Subtree {
    hash: u64,
    /// Version at which the hash last changed. Kept separately from the
    /// hash so a second watcher on the same prefix still sees a change
    /// that another watcher already folded into `hash`.
    changed_at: u64,
}

impl FileClient {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            retry,
            state: Mutex::new(WatchState::default()),
        }
    }

    /// Read and flatten the whole document. One read per call, so every
    /// returned snapshot is consistent with a single file state.
    fn load(&self, op: &'static str) -> Result<BTreeMap<String, String>> {
        let raw = std::fs::read_to_string(&self.path).map_err(|err| StoreError::Connectivity {
            backend: BACKEND,
            op,
            message: format!("{}: {err}", self.path.display()),
        })?;
        let doc: serde_yaml::Value =
            serde_yaml::from_str(&raw).map_err(|err| StoreError::Connectivity {
                backend: BACKEND,
                op,
                message: format!("{}: {err}", self.path.display()),
            })?;
        let mut flat = BTreeMap::new();
        flatten("", &doc, &mut flat);
        Ok(flat)
    }

    /// One bounded-poll pass: return a new version as soon as the subtree
    /// under `prefix` differs from what this client last observed.
    async fn poll_subtree(
        &self,
        prefix: &str,
        wait_index: u64,
        stop: &CancellationToken,
    ) -> Result<u64> {
        loop {
            let flat = self.load("watch")?;
            let hash = subtree_hash(&flat, prefix);

            let mut state = self.state.lock().await;
            match state.subtrees.get(prefix).copied() {
                Some(last) if last.hash != hash => {
                    state.version += 1;
                    let version = state.version;
                    state.subtrees.insert(
                        prefix.to_string(),
                        Subtree {
                            hash,
                            changed_at: version,
                        },
                    );
                    debug!("file subtree {prefix} changed, version {version}");
                    return Ok(version);
                }
                Some(last) if last.changed_at > wait_index => {
                    // Another watcher on this prefix recorded the change
                    // already; report the version it was recorded at.
                    return Ok(last.changed_at);
                }
                Some(_) => {}
                None => {
                    // First observation of this prefix; no change yet.
                    state
                        .subtrees
                        .insert(prefix.to_string(), Subtree { hash, changed_at: 0 });
                }
            }
            let version = state.version;
            drop(state);

            if wait_index == 0 {
                // No prior knowledge: current state is the answer.
                return Ok(version);
            }

            tokio::select! {
                _ = stop.cancelled() => return Ok(wait_index),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

fn flatten(prefix: &str, value: &serde_yaml::Value, out: &mut BTreeMap<String, String>) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                if let Some(name) = k.as_str() {
                    flatten(&format!("{prefix}/{name}"), v, out);
                }
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten(&format!("{prefix}/{i}"), v, out);
            }
        }
        serde_yaml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        serde_yaml::Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
        }
        serde_yaml::Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        serde_yaml::Value::Null | serde_yaml::Value::Tagged(_) => {}
    }
}

fn subtree_hash(flat: &BTreeMap<String, String>, prefix: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (key, value) in flat {
        if key_in_subtree(key, prefix) {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
    }
    hasher.finish()
}

#[async_trait]
impl StoreClient for FileClient {
    async fn get_values(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let flat = self.load("get")?;
        let keys: BTreeSet<&String> = keys.iter().collect();
        let mut values = HashMap::new();
        for (key, value) in &flat {
            if keys.iter().any(|wanted| key_in_subtree(key, wanted.as_str())) {
                values.insert(key.clone(), value.clone());
            }
        }
        Ok(values)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        wait_index: u64,
        stop: &CancellationToken,
    ) -> Result<u64> {
        watch_with_backoff(&self.retry, stop, wait_index, |idx| {
            self.poll_subtree(prefix, idx, stop)
        })
        .await
    }
}
