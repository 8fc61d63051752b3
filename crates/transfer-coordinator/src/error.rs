use std::time::Duration;

use thiserror::Error;

/// Failures resolving the intercept context. Never retried by the registrar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("intercept context install rejected: {0}")]
    Rejected(String),
    #[error("intercept host unavailable: {0}")]
    Unavailable(String),
    #[error("intercept context did not activate within {0:?}")]
    ActivationTimeout(Duration),
    #[error("intercept context became redundant before activating")]
    Redundant,
    #[error("page origin {0} is neither https nor localhost")]
    UntrustedOrigin(String),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("intercept context not registered")]
    NotRegistered,
    #[error("intercept context is not active")]
    InterceptInactive,
    #[error("transfer {id} is already streaming")]
    DuplicateSession { id: String },
    #[error("transfer {id} stalled: sink not ready after {waited:?}")]
    Stalled { id: String, waited: Duration },
    #[error("control channel closed")]
    ChannelClosed,
    #[error("transfer coordinator shut down")]
    ShutDown,
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

pub type TransferResult<T> = Result<T, TransferError>;

/// Problems decoding a download trigger URL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("invalid download url: {0}")]
    Url(String),
    #[error("missing query parameter {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
}
