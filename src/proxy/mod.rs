//! Driver, connection and statement proxies.
//!
//! Each proxy implements the full optional capability surface of the driver
//! contract. A call the wrapped handle cannot serve yields
//! [`Error::Skip`], so the host layer behaves exactly as if the proxy were
//! absent.

mod conn;
mod driver;
mod stmt;

use std::time::Instant;

pub use self::conn::ConnectionProxy;
pub use self::driver::DriverProxy;
pub use self::stmt::StatementProxy;
use crate::config::AnnotatorConfig;
use crate::error::{Error, Result};

/// The "not supported" outcome for `capability`.
fn skip(capability: &'static str) -> Error {
    tracing::trace!(capability, "wrapped handle does not implement capability");
    Error::Skip
}

/// Log slow or failed calls to the underlying driver.
fn observe<T>(
    config: &AnnotatorConfig,
    operation: &'static str,
    statement: &str,
    start: Instant,
    result: &Result<T>,
) {
    let elapsed = start.elapsed();
    if let Some(threshold) = config.slow_query_threshold {
        if elapsed > threshold {
            tracing::warn!(
                operation,
                duration_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                db.statement = statement,
                "Slow query detected"
            );
        }
    }

    match result {
        Ok(_) => {}
        Err(Error::Skip) => {
            tracing::trace!(operation, "underlying driver skipped the call");
        }
        Err(e) => {
            tracing::debug!(operation, error = %e, "underlying driver returned an error");
        }
    }
}
