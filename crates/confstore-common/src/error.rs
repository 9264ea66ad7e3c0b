use thiserror::Error;

/// Errors surfaced by store clients and the backend selector.
///
/// Every native backend error is normalized into one of these variants
/// before it crosses the crate boundary. Cancellation is never an error:
/// a watch interrupted by its stop token returns `Ok` with the index it
/// was called with.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The configured backend kind is not one we know how to construct.
    /// Fatal at selection time, never retried.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Transport-level failure reaching the backend. Retried with backoff
    /// inside watch calls; surfaced as-is from reads so the caller owns
    /// the retry policy there.
    #[error("{backend}: {op}: connection failed: {message}")]
    Connectivity {
        backend: &'static str,
        op: &'static str,
        message: String,
    },

    /// Credential or certificate rejection. Never retried.
    #[error("{backend}: {op}: authentication rejected: {message}")]
    Auth {
        backend: &'static str,
        op: &'static str,
        message: String,
    },

    /// The backend no longer holds history for the supplied wait index
    /// (e.g. etcd compaction). The watch driver recovers by resetting to
    /// index 0 and retrying once.
    #[error("{backend}: wait index no longer valid: {message}")]
    StaleIndex {
        backend: &'static str,
        message: String,
    },

    /// Any other native backend error. Treated as unrecoverable.
    #[error("{backend}: {op}: {message}")]
    Backend {
        backend: &'static str,
        op: &'static str,
        message: String,
    },
}

impl StoreError {
    /// Whether the watch driver may retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connectivity { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connectivity_is_retryable() {
        let conn = StoreError::Connectivity {
            backend: "etcd",
            op: "watch",
            message: "broken pipe".into(),
        };
        let auth = StoreError::Auth {
            backend: "etcd",
            op: "watch",
            message: "bad cert".into(),
        };
        let stale = StoreError::StaleIndex {
            backend: "etcd",
            message: "compacted to 42".into(),
        };
        assert!(conn.is_retryable());
        assert!(!auth.is_retryable());
        assert!(!stale.is_retryable());
        assert!(!StoreError::UnknownBackend("zk".into()).is_retryable());
    }

    #[test]
    fn messages_name_backend_and_operation() {
        let err = StoreError::Connectivity {
            backend: "etcd",
            op: "get",
            message: "connection refused".into(),
        };
        let text = err.to_string();
        assert!(text.contains("etcd"));
        assert!(text.contains("get"));
    }
}
