use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, Error as EtcdError, GetOptions, Identity, TlsOptions,
    WatchOptions, WatchResponse,
};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::debug;

use confstore_common::{Result, StoreError};

use crate::retry::{watch_with_backoff, RetryPolicy};
use crate::store::{key_in_subtree, StoreClient};

const BACKEND: &str = "etcd";

/// Store client backed by an etcd cluster.
///
/// The gRPC client is created once and reused for the process lifetime;
/// it is shared across watcher tasks behind a mutex that is only held for
/// the duration of a unary call or watch-stream creation, never across a
/// blocking wait. Wait indices are etcd revisions.
pub struct EtcdClient {
    client: Mutex<Client>,
    retry: RetryPolicy,
}

impl EtcdClient {
    pub async fn connect(
        endpoints: &[String],
        client_cert: Option<&Path>,
        client_key: Option<&Path>,
        ca_bundle: Option<&Path>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut options = ConnectOptions::new();
        if client_cert.is_some() || ca_bundle.is_some() {
            let mut tls = TlsOptions::new();
            if let Some(ca) = ca_bundle {
                tls = tls.ca_certificate(Certificate::from_pem(read_pem(ca).await?));
            }
            if let (Some(cert), Some(key)) = (client_cert, client_key) {
                let cert_pem = read_pem(cert).await?;
                let key_pem = read_pem(key).await?;
                tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
            }
            options = options.with_tls(tls);
        }
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|err| map_native("connect", err))?;
        debug!("connected etcd client to {endpoints:?}");
        Ok(Self {
            client: Mutex::new(client),
            retry,
        })
    }

    /// One native watch pass; retried by the watch driver.
    async fn watch_once(
        &self,
        prefix: &str,
        wait_index: u64,
        stop: &CancellationToken,
    ) -> Result<u64> {
        if wait_index == 0 {
            // No prior knowledge: report the current revision so the
            // caller can read and come back with real history.
            let mut client = self.client.lock().await;
            let resp = client
                .get(prefix, Some(GetOptions::new().with_prefix().with_count_only()))
                .await
                .map_err(|err| map_native("watch", err))?;
            return Ok(resp.header().map(|h| h.revision() as u64).unwrap_or(0));
        }

        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(wait_index as i64 + 1);
        // Hold the client lock only long enough to open the stream.
        let (mut watcher, mut stream) = {
            let mut client = self.client.lock().await;
            client
                .watch(prefix, Some(options))
                .await
                .map_err(|err| map_native("watch", err))?
        };

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = watcher.cancel().await;
                    return Ok(wait_index);
                }
                message = stream.message() => match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            if resp.compact_revision() > 0 {
                                return Err(StoreError::StaleIndex {
                                    backend: BACKEND,
                                    message: format!(
                                        "history compacted to revision {}",
                                        resp.compact_revision()
                                    ),
                                });
                            }
                            return Err(StoreError::Connectivity {
                                backend: BACKEND,
                                op: "watch",
                                message: format!(
                                    "watch canceled by server: {}",
                                    resp.cancel_reason()
                                ),
                            });
                        }
                        if let Some(revision) = latest_revision(&resp) {
                            return Ok(revision);
                        }
                        // Progress notification without events; keep waiting.
                    }
                    Ok(None) => {
                        return Err(StoreError::Connectivity {
                            backend: BACKEND,
                            op: "watch",
                            message: "watch stream closed".into(),
                        });
                    }
                    Err(err) => return Err(map_native("watch", err)),
                }
            }
        }
    }
}

#[async_trait]
impl StoreClient for EtcdClient {
    async fn get_values(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let keys: BTreeSet<&String> = keys.iter().collect();
        let mut client = self.client.lock().await;
        let mut revision: i64 = 0;
        let mut values = HashMap::new();
        for key in keys {
            let mut options = GetOptions::new().with_prefix();
            if revision > 0 {
                // Pin every read after the first to one revision so the
                // snapshot is consistent with a single store state.
                options = options.with_revision(revision);
            }
            let resp = client
                .get(key.as_str(), Some(options))
                .await
                .map_err(|err| map_native("get", err))?;
            if revision == 0 {
                revision = resp.header().map(|h| h.revision()).unwrap_or(0);
            }
            for kv in resp.kvs() {
                let k = kv.key_str().map_err(|err| map_native("get", err))?;
                // The range read matches raw byte prefixes, so `/app/db`
                // also returns `/app/db2`; keep path-boundary semantics.
                if !key_in_subtree(k, key.as_str()) {
                    continue;
                }
                let v = kv.value_str().map_err(|err| map_native("get", err))?;
                values.insert(k.to_string(), v.to_string());
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
            self.watch_once(prefix, idx, stop)
        })
        .await
    }
}

/// Highest mod revision across a response's events.
fn latest_revision(resp: &WatchResponse) -> Option<u64> {
    resp.events()
        .iter()
        .filter_map(|event| event.kv().map(|kv| kv.mod_revision() as u64))
        .max()
}

/// Normalize a native etcd error into the shared taxonomy.
fn map_native(op: &'static str, err: EtcdError) -> StoreError {
    match err {
        EtcdError::GRpcStatus(status) => match status.code() {
            Code::Unauthenticated | Code::PermissionDenied => StoreError::Auth {
                backend: BACKEND,
                op,
                message: status.message().to_string(),
            },
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Aborted => {
                StoreError::Connectivity {
                    backend: BACKEND,
                    op,
                    message: status.message().to_string(),
                }
            }
            // etcd reports reads/watches behind the compaction horizon
            // as OutOfRange.
            Code::OutOfRange => StoreError::StaleIndex {
                backend: BACKEND,
                message: status.message().to_string(),
            },
            _ => StoreError::Backend {
                backend: BACKEND,
                op,
                message: status.message().to_string(),
            },
        },
        EtcdError::TransportError(err) => StoreError::Connectivity {
            backend: BACKEND,
            op,
            message: err.to_string(),
        },
        EtcdError::IoError(err) => StoreError::Connectivity {
            backend: BACKEND,
            op,
            message: err.to_string(),
        },
        EtcdError::WatchError(message) => StoreError::Connectivity {
            backend: BACKEND,
            op,
            message,
        },
        other => StoreError::Backend {
            backend: BACKEND,
            op,
            message: other.to_string(),
        },
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|err| StoreError::Auth {
        backend: BACKEND,
        op: "connect",
        message: format!("{}: {err}", path.display()),
    })
}
