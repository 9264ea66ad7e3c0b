use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use confstore_common::Result;

use crate::store::StoreClient;

/// Store client backed by the process's own environment variables.
///
/// The environment is captured once at construction and never re-read:
/// for this backend the world is immutable for the process lifetime.
/// Watching therefore degenerates to waiting for the stop token — no
/// change can ever arrive, and pretending otherwise would busy-loop the
/// caller's reactive loop.
pub struct EnvClient {
    vars: BTreeMap<String, String>,
}

impl EnvClient {
    pub fn new() -> Self {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        debug!("captured {} environment variables", vars.len());
        Self { vars }
    }
}

impl Default for EnvClient {
    fn default() -> Self {
        Self::new()
    }
}

/// `/my/key` -> `MY_KEY`.
fn to_var_name(key: &str) -> String {
    key.trim_start_matches('/').replace('/', "_").to_uppercase()
}

/// Map a variable-name remainder back under the key it was requested by:
/// requested `/my`, variable `MY_DB_HOST` -> `/my/db/host`; an exact match
/// keeps the requested spelling.
fn subtree_key(requested: &str, remainder: &str) -> String {
    if remainder.is_empty() {
        return requested.to_string();
    }
    let suffix = remainder.replace('_', "/").to_lowercase();
    let base = requested.trim_end_matches('/');
    if suffix.starts_with('/') {
        format!("{base}{suffix}")
    } else {
        format!("{base}/{suffix}")
    }
}

#[async_trait]
impl StoreClient for EnvClient {
    async fn get_values(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let keys: BTreeSet<&String> = keys.iter().collect();
        let mut values = HashMap::new();
        for key in keys {
            let wanted = to_var_name(key);
            for (name, value) in &self.vars {
                if name == &wanted {
                    values.insert(key.to_string(), value.clone());
                } else if wanted.is_empty()
                    || name.starts_with(&wanted) && name[wanted.len()..].starts_with('_')
                {
                    let remainder = &name[wanted.len()..];
                    values.insert(subtree_key(key, remainder), value.clone());
                }
            }
        }
        Ok(values)
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        wait_index: u64,
        stop: &CancellationToken,
    ) -> Result<u64> {
        // Nothing to wait for; block until the caller shuts down.
        stop.cancelled().await;
        Ok(wait_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(vars: &[(&str, &str)]) -> EnvClient {
        EnvClient::from_vars(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[tokio::test]
    async fn exact_key_keeps_requested_spelling() {
        let c = client(&[("HOSTNAME", "web-1")]);
        let values = c.get_values(&["HOSTNAME".to_string()]).await.unwrap();
        assert_eq!(values.get("HOSTNAME").map(String::as_str), Some("web-1"));

        let values = c.get_values(&["/hostname".to_string()]).await.unwrap();
        assert_eq!(values.get("/hostname").map(String::as_str), Some("web-1"));
    }

    #[tokio::test]
    async fn prefix_expands_into_subtree_keys() {
        let c = client(&[
            ("MY_DB_HOST", "db.internal"),
            ("MY_DB_PORT", "5432"),
            ("MYSQL_ROOT", "nope"),
        ]);
        let values = c.get_values(&["/my/db".to_string()]).await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["/my/db/host"], "db.internal");
        assert_eq!(values["/my/db/port"], "5432");
        // MYSQL_ROOT shares the character prefix but not the path boundary.
        let values = c.get_values(&["/my".to_string()]).await.unwrap();
        assert!(!values.values().any(|v| v == "nope"));
    }

    #[tokio::test]
    async fn root_prefix_covers_everything() {
        let c = client(&[("A_B", "1"), ("C", "2")]);
        let values = c.get_values(&["/".to_string()]).await.unwrap();
        assert_eq!(values["/a/b"], "1");
        assert_eq!(values["/c"], "2");
    }

    #[tokio::test]
    async fn missing_keys_are_omitted_not_errors() {
        let c = client(&[("PRESENT", "yes")]);
        let values = c
            .get_values(&["/absent".to_string(), "PRESENT".to_string()])
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["PRESENT"], "yes");
    }

    #[tokio::test]
    async fn duplicate_keys_coalesce() {
        let c = client(&[("APP_NAME", "confstore")]);
        let keys = vec!["/app".to_string(), "/app".to_string()];
        let values = c.get_values(&keys).await.unwrap();
        assert_eq!(values.len(), 1);
    }

    #[tokio::test]
    async fn consecutive_reads_are_identical() {
        let c = client(&[("A_B", "1"), ("A_C", "2")]);
        let keys = vec!["/a".to_string()];
        let first = c.get_values(&keys).await.unwrap();
        let second = c.get_values(&keys).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn watch_returns_input_index_on_cancel() {
        let c = client(&[]);
        let stop = CancellationToken::new();

        let cancel = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let index = tokio::time::timeout(
            Duration::from_secs(1),
            c.watch_prefix("/anything", 42, &stop),
        )
        .await
        .expect("watch must return promptly after cancellation")
        .unwrap();
        assert_eq!(index, 42);

        // Idempotent: a second watch on the fired token behaves the same.
        let index = c.watch_prefix("/anything", 42, &stop).await.unwrap();
        assert_eq!(index, 42);
    }

    #[tokio::test]
    async fn watch_with_already_cancelled_stop_returns_immediately() {
        let c = client(&[]);
        let stop = CancellationToken::new();
        stop.cancel();
        let index = c.watch_prefix("/", 0, &stop).await.unwrap();
        assert_eq!(index, 0);
    }
}
