//! # sql-annotator
//!
//! A driver proxy that prefixes every SQL statement with a comment naming the
//! code that issued it.
//!
//! Wrapping a registered driver yields a second driver, `<name>:annotator`,
//! that behaves exactly like the first. The only difference is the query
//! text the database receives:
//!
//! ```text
//! /* billing::close_invoice (src/billing.rs:118) */ UPDATE invoices SET closed = ?
//! ```
//!
//! Slow-query logs, `pg_stat_statements` and friends then point straight at
//! the offending line.
//!
//! ## Features
//!
//! - **Transparent**: arguments, results and driver errors pass through untouched
//! - **Capability preserving**: optional driver capabilities (ping, context-aware
//!   exec, session reset, ...) are forwarded when present and reported as
//!   [`Error::Skip`] when absent, so the host falls back to its generic path
//! - **Idempotent registration**: adopting a driver twice registers it once
//! - **Logging**: statements, slow calls and registration through `tracing`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sql_annotator::prelude::*;
//!
//! sql_annotator::register("postgres", Arc::new(PostgresDriver::default()))?;
//!
//! let db = adopt("postgres", "postgres://localhost/app")?;
//! db.exec("DELETE FROM sessions WHERE expires_at < now()", &[])?;
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! use sql_annotator::{adopt_with_config, AnnotatorConfig};
//!
//! let config = AnnotatorConfig::default()
//!     .with_statement_logging(true)   // log every annotated statement at debug
//!     .with_function_names(false)     // skip symbol resolution, file:line only
//!     .with_slow_query_threshold(Duration::from_millis(100));
//!
//! let db = adopt_with_config("postgres", "postgres://localhost/app", config)?;
//! ```
//!
//! ## Log Fields
//!
//! | Field | Description |
//! |-------|-------------|
//! | `caller` | `function (file:line)` the statement is attributed to |
//! | `db.operation` | SQL operation (SELECT, INSERT, UPDATE, DELETE, ...) |
//! | `db.statement` | Annotated SQL (when statement logging is enabled) |
//! | `duration_ms` | Elapsed time of a slow call |
//! | `capabilities` | Capabilities of a freshly wrapped connection |

pub mod annotate;
mod config;
mod context;
pub mod db;
pub mod driver;
mod error;
mod parser;
pub mod proxy;
mod registry;

#[cfg(test)]
mod testing;

pub use annotate::{CallSite, Caller};
pub use config::AnnotatorConfig;
pub use context::Context;
pub use db::{drivers, register, Db, DriverTable, QueryResult, Statement, Transaction};
pub use error::{BoxError, Error, Result};
pub use proxy::{ConnectionProxy, DriverProxy, StatementProxy};
pub use registry::{adopt, adopt_with_config, annotated_name, Registry, DRIVER_SUFFIX};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::driver::{Conn, Driver, Stmt, Value};
    pub use crate::{adopt, AnnotatorConfig, Context, Db, Error, Result};
    pub use std::sync::Arc;
}
