use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use confstore_common::Result;

/// Uniform key/value retrieval and change notification over heterogeneous
/// backend stores.
///
/// Implementations are constructed once per process by the selector
/// ([`crate::new_client`]) and shared behind `Arc<dyn StoreClient>`; they
/// must be safe for concurrent use by several watcher tasks over one
/// underlying client connection.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Resolve the given keys (or key prefixes) to their current values.
    ///
    /// Duplicate keys are coalesced. Keys the backend does not hold are
    /// simply omitted from the result; absence is not an error. Errors are
    /// surfaced immediately without retry, leaving retry policy to the
    /// caller.
    async fn get_values(&self, keys: &[String]) -> Result<HashMap<String, String>>;

    /// Block until the backend reports a change under `prefix` at or after
    /// `wait_index`, returning the new index.
    ///
    /// A `wait_index` of 0 means "no prior knowledge": the call returns
    /// promptly with the backend's current index. When `stop` fires, the
    /// call returns the *input* index with no error — cancellation is a
    /// clean return, not a failure. Transient backend failures are retried
    /// internally with bounded backoff; only unrecoverable errors reach
    /// the caller. Within one watch sequence the returned index never goes
    /// below the input, except through the internal stale-index reset.
    async fn watch_prefix(
        &self,
        prefix: &str,
        wait_index: u64,
        stop: &CancellationToken,
    ) -> Result<u64>;
}

/// Whether `key` falls under `prefix` in the hierarchical key space.
///
/// A prefix scopes a subtree: `/app` covers `/app` itself and everything
/// under `/app/`, but not `/apple`. An empty or `/` prefix covers all keys.
pub(crate) fn key_in_subtree(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    key == prefix || key.starts_with(prefix) && key[prefix.len()..].starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_scoping() {
        assert!(key_in_subtree("/app/db/host", "/app"));
        assert!(key_in_subtree("/app/db/host", "/app/"));
        assert!(key_in_subtree("/app", "/app"));
        assert!(key_in_subtree("/anything", "/"));
        assert!(key_in_subtree("/anything", ""));
        assert!(!key_in_subtree("/apple", "/app"));
        assert!(!key_in_subtree("/ap", "/app"));
    }

    #[test]
    fn sibling_keys_sharing_a_byte_prefix_are_excluded() {
        // Backends that range-read by raw byte prefix must still be
        // filtered to path boundaries: `/app/db` is not `/app/db2`.
        assert!(!key_in_subtree("/app/db2", "/app/db"));
        assert!(!key_in_subtree("/app/db2/host", "/app/db"));
        assert!(key_in_subtree("/app/db/host", "/app/db"));
        assert!(key_in_subtree("/app/db", "/app/db"));
    }
}
