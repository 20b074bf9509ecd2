use crate::lightning::node_api::NodeError;

pub type SdkResult<T, E = SdkError> = Result<T, E>;

/// Errors surfaced by every public engine operation.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid invoice: {0}")]
    Invoice(String),

    #[error("invoice expired: {0}")]
    InvoiceExpired(String),

    #[error("amount mismatch: {0}")]
    AmountMismatch(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("no route found: {0}")]
    NoRouteFound(String),

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("node session already connected")]
    AlreadyConnected,

    #[error("node session not connected")]
    NotConnected,

    #[error("swap error: {0}")]
    Swap(String),

    #[error("backend unavailable: {0:#}")]
    BackendUnavailable(anyhow::Error),

    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),

    #[error("{0:#}")]
    Generic(anyhow::Error),
}

impl SdkError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn swap(msg: impl Into<String>) -> Self {
        Self::Swap(msg.into())
    }

    pub fn generic(msg: impl std::fmt::Display) -> Self {
        Self::Generic(anyhow::anyhow!("{msg}"))
    }

    /// Transient failures are retried by background loops; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }
}

impl From<NodeError> for SdkError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Credentials(msg) => Self::Auth(msg),
            NodeError::RouteNotFound(msg) => Self::NoRouteFound(msg),
            NodeError::PaymentFailed(msg) => Self::PaymentFailed(msg),
            NodeError::PaymentTimeout(msg) => Self::Timeout(msg),
            NodeError::InvalidInvoice(msg) => Self::Invoice(msg),
            NodeError::Unsupported(msg) => Self::Generic(anyhow::anyhow!("unsupported: {msg}")),
            NodeError::ServiceConnectivity(err) => Self::BackendUnavailable(err),
            NodeError::Generic(err) => Self::Generic(err),
        }
    }
}

impl From<rusqlite::Error> for SdkError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.into())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Generic(err.into())
    }
}
