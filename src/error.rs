//! Error type shared by the driver contract, the proxies and the host layer.

use thiserror::Error;

/// Boxed error produced by an underlying driver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The called capability is not implemented by the wrapped handle.
    ///
    /// This is not a failure: the host layer falls back to its generic path
    /// exactly as if the proxy had never been involved.
    #[error("driver: skip fast-path; continue as if unimplemented")]
    Skip,

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The connection is unusable and must be discarded by the host layer.
    #[error("driver: bad connection")]
    BadConn,

    #[error("sql: unknown driver {0:?} (forgotten registration?)")]
    UnknownDriver(String),

    #[error("sql: register called twice for driver {0}")]
    DuplicateDriver(String),

    #[error("sql: database is closed")]
    Closed,

    #[error("sql: converting argument: {0}")]
    Convert(String),

    /// The driver cannot honour a requested option (e.g. an isolation level).
    #[error("sql: driver does not support {0}")]
    Unsupported(&'static str),

    /// An error raised by an underlying driver, displayed as-is.
    #[error("{0}")]
    Driver(BoxError),
}

impl Error {
    /// Wrap an arbitrary driver error.
    pub fn driver(err: impl Into<BoxError>) -> Self {
        Self::Driver(err.into())
    }

    /// Whether this is the "capability not supported" sentinel.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }

    /// Whether this error originates from a cancelled or expired [`Context`](crate::Context).
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }
}
