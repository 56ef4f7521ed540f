use crate::types::RemoteAddress;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("engine is not running")]
    NotRunning,

    #[error("instance id query to {remote} failed: {reason}")]
    InstanceQuery {
        remote: RemoteAddress,
        reason: String,
    },

    #[error("transfer to {remote} failed: {reason}")]
    Transfer {
        remote: RemoteAddress,
        reason: String,
    },

    #[error("failed to bind RPC listener on port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("backend setup failed: {0}")]
    BackendSetup(String),

    #[error("memory registration failed: addr={addr:#x} len={len}")]
    Registration { addr: usize, len: usize },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the retry runner may attempt the operation again.
    ///
    /// Argument errors, setup failures, and unimplemented operations are
    /// programmer errors or permanent conditions; retrying them can only
    /// repeat the failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::InstanceQuery { .. }
            | TransportError::Transfer { .. }
            | TransportError::Bind { .. }
            | TransportError::Io(_) => true,
            TransportError::InvalidArgument(_)
            | TransportError::NotRunning
            | TransportError::BackendSetup(_)
            | TransportError::Registration { .. }
            | TransportError::NotImplemented(_) => false,
        }
    }

    /// Create an `InvalidArgument` error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a `Transfer` error against the given peer.
    pub fn transfer(remote: &RemoteAddress, reason: impl Into<String>) -> Self {
        Self::Transfer {
            remote: remote.clone(),
            reason: reason.into(),
        }
    }

    /// Create an `InstanceQuery` error against the given peer.
    pub fn instance_query(remote: &RemoteAddress, reason: impl Into<String>) -> Self {
        Self::InstanceQuery {
            remote: remote.clone(),
            reason: reason.into(),
        }
    }
}
