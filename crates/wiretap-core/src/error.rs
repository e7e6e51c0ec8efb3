use thiserror::Error;

/// Failures surfaced by flow-store implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not open flow store: {0}")]
    Open(String),
    #[error("flow store backend: {0}")]
    Backend(String),
    #[error("corrupt record in flow store: {0}")]
    Corrupt(String),
    #[error("no raw capture initialised for flow {0}")]
    MissingCapture(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("trust store unavailable: {0}")]
    TrustStoreUnavailable(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),
    #[error("malformed http: {0}")]
    Http(String),
    #[error("egress provider error: {0}")]
    Egress(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
