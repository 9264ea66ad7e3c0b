pub mod env;
pub mod etcd;
pub mod file;
pub mod retry;
pub mod store;

pub use env::EnvClient;
pub use etcd::EtcdClient;
pub use file::FileClient;
pub use retry::{watch_with_backoff, RetryPolicy};
pub use store::StoreClient;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use confstore_common::{BackendConfig, BackendKind, Result, StoreError};

/// Construct the store client selected by `config`.
///
/// Dispatch is a closed match over [`BackendKind`]; a kind string that
/// fails to parse into the enum is rejected as
/// [`StoreError::UnknownBackend`] before this function is ever reached.
/// The client is expected to be built once and shared for the process
/// lifetime.
pub async fn new_client(config: &BackendConfig) -> Result<Arc<dyn StoreClient>> {
    info!(
        backend = %config.backend,
        "backend nodes set to {}",
        config.nodes.join(", ")
    );
    let retry = RetryPolicy::from(&config.watch);
    match config.backend {
        BackendKind::Etcd => {
            let client = EtcdClient::connect(
                &config.nodes,
                config.client_cert.as_deref(),
                config.client_key.as_deref(),
                config.client_ca_keys.as_deref(),
                retry,
            )
            .await?;
            Ok(Arc::new(client))
        }
        BackendKind::Env => Ok(Arc::new(EnvClient::new())),
        BackendKind::File => {
            let path = config.nodes.first().cloned().map(PathBuf::from).ok_or_else(|| {
                StoreError::Backend {
                    backend: "file",
                    op: "connect",
                    message: "no document path configured in nodes".into(),
                }
            })?;
            Ok(Arc::new(FileClient::new(
                path,
                Duration::from_millis(config.watch.poll_interval_ms),
                retry,
            )))
        }
    }
}
