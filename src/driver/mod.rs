//! The driver contract shared by underlying drivers, the proxies and the host layer.
//!
//! A driver implements [`Driver`], [`Conn`] and [`Stmt`]. Everything beyond
//! the mandatory surface is an optional capability: a small trait plus an
//! accessor on `Conn`/`Stmt` returning `None` by default. The host layer
//! probes the accessors at runtime and falls back to its generic path when a
//! capability is missing or a call returns [`Error::Skip`](crate::Error::Skip).

mod convert;

use std::fmt;

pub use sea_orm::{AccessMode, IsolationLevel, Value};

pub use self::convert::{
    default_check_named_value, DefaultParameterConverter, ValueConverter,
    DEFAULT_PARAMETER_CONVERTER,
};
use crate::context::Context;
use crate::error::Result;

/// A bound argument with its position and optional name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    pub name: Option<String>,
    /// 1-based position of the argument.
    pub ordinal: usize,
    pub value: Value,
}

impl NamedValue {
    pub fn positional(ordinal: usize, value: impl Into<Value>) -> Self {
        Self {
            name: None,
            ordinal,
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, ordinal: usize, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            ordinal,
            value: value.into(),
        }
    }

    /// Number positional values starting at 1.
    pub fn from_values(values: &[Value]) -> Vec<NamedValue> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| NamedValue::positional(i + 1, value.clone()))
            .collect()
    }
}

/// Options for [`ConnBeginTx::begin_tx`].
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub access_mode: Option<AccessMode>,
}

impl TxOptions {
    pub fn is_default(&self) -> bool {
        self.isolation_level.is_none() && self.access_mode.is_none()
    }
}

/// Outcome of an exec call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub last_insert_id: Option<i64>,
    pub rows_affected: u64,
}

/// Cursor over a query result.
pub trait Rows: Send {
    fn columns(&self) -> Vec<String>;

    /// Next row, `None` once exhausted.
    fn next(&mut self) -> Result<Option<Vec<Value>>>;

    fn close(&mut self) -> Result<()>;
}

pub trait Tx: Send {
    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Entry point of a database driver.
pub trait Driver: Send + Sync {
    fn open(&self, dsn: &str) -> Result<Box<dyn Conn>>;
}

/// A connection. Used by one caller at a time.
pub trait Conn: Send {
    #[track_caller]
    fn prepare(&mut self, query: &str) -> Result<Box<dyn Stmt>>;

    fn close(&mut self) -> Result<()>;

    fn begin(&mut self) -> Result<Box<dyn Tx>>;

    fn as_prepare_context(&mut self) -> Option<&mut dyn ConnPrepareContext> {
        None
    }

    fn as_begin_tx(&mut self) -> Option<&mut dyn ConnBeginTx> {
        None
    }

    fn as_pinger(&mut self) -> Option<&mut dyn Pinger> {
        None
    }

    fn as_execer(&mut self) -> Option<&mut dyn Execer> {
        None
    }

    fn as_execer_context(&mut self) -> Option<&mut dyn ExecerContext> {
        None
    }

    fn as_queryer(&mut self) -> Option<&mut dyn Queryer> {
        None
    }

    fn as_queryer_context(&mut self) -> Option<&mut dyn QueryerContext> {
        None
    }

    fn as_session_resetter(&mut self) -> Option<&mut dyn SessionResetter> {
        None
    }

    fn as_named_value_checker(&mut self) -> Option<&mut dyn NamedValueChecker> {
        None
    }
}

pub trait ConnPrepareContext {
    #[track_caller]
    fn prepare_context(&mut self, ctx: &Context, query: &str) -> Result<Box<dyn Stmt>>;
}

pub trait ConnBeginTx {
    fn begin_tx(&mut self, ctx: &Context, opts: &TxOptions) -> Result<Box<dyn Tx>>;
}

pub trait Pinger {
    fn ping(&mut self, ctx: &Context) -> Result<()>;
}

pub trait Execer {
    #[track_caller]
    fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult>;
}

pub trait ExecerContext {
    #[track_caller]
    fn exec_context(&mut self, ctx: &Context, query: &str, args: &[NamedValue])
        -> Result<ExecResult>;
}

pub trait Queryer {
    #[track_caller]
    fn query(&mut self, query: &str, args: &[Value]) -> Result<Box<dyn Rows>>;
}

pub trait QueryerContext {
    #[track_caller]
    fn query_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> Result<Box<dyn Rows>>;
}

pub trait SessionResetter {
    /// Called before a pooled connection is reused. [`Error::BadConn`](crate::Error::BadConn)
    /// tells the pool to discard it.
    fn reset_session(&mut self, ctx: &Context) -> Result<()>;
}

/// Checks, and may convert in place, an argument before it is bound.
pub trait NamedValueChecker {
    fn check_named_value(&mut self, nv: &mut NamedValue) -> Result<()>;
}

/// A prepared statement.
pub trait Stmt: Send {
    fn close(&mut self) -> Result<()>;

    /// Number of placeholders, `None` when the driver cannot tell.
    fn num_input(&self) -> Option<usize>;

    fn exec(&mut self, args: &[Value]) -> Result<ExecResult>;

    fn query(&mut self, args: &[Value]) -> Result<Box<dyn Rows>>;

    fn as_exec_context(&mut self) -> Option<&mut dyn StmtExecContext> {
        None
    }

    fn as_query_context(&mut self) -> Option<&mut dyn StmtQueryContext> {
        None
    }

    fn as_column_converter(&self) -> Option<&dyn ColumnConverter> {
        None
    }

    fn as_named_value_checker(&mut self) -> Option<&mut dyn NamedValueChecker> {
        None
    }
}

pub trait StmtExecContext {
    fn exec_context(&mut self, ctx: &Context, args: &[NamedValue]) -> Result<ExecResult>;
}

pub trait StmtQueryContext {
    fn query_context(&mut self, ctx: &Context, args: &[NamedValue]) -> Result<Box<dyn Rows>>;
}

pub trait ColumnConverter {
    /// Converter for the argument at 0-based `idx`.
    fn column_converter(&self, idx: usize) -> &dyn ValueConverter;
}

/// Which optional capabilities a connection implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnCapabilities {
    pub prepare_context: bool,
    pub begin_tx: bool,
    pub ping: bool,
    pub exec: bool,
    pub exec_context: bool,
    pub query: bool,
    pub query_context: bool,
    pub reset_session: bool,
    pub check_named_value: bool,
}

impl ConnCapabilities {
    pub fn of(conn: &mut dyn Conn) -> Self {
        Self {
            prepare_context: conn.as_prepare_context().is_some(),
            begin_tx: conn.as_begin_tx().is_some(),
            ping: conn.as_pinger().is_some(),
            exec: conn.as_execer().is_some(),
            exec_context: conn.as_execer_context().is_some(),
            query: conn.as_queryer().is_some(),
            query_context: conn.as_queryer_context().is_some(),
            reset_session: conn.as_session_resetter().is_some(),
            check_named_value: conn.as_named_value_checker().is_some(),
        }
    }

    pub fn all() -> Self {
        Self {
            prepare_context: true,
            begin_tx: true,
            ping: true,
            exec: true,
            exec_context: true,
            query: true,
            query_context: true,
            reset_session: true,
            check_named_value: true,
        }
    }

    fn names(&self) -> Vec<&'static str> {
        [
            (self.prepare_context, "prepare_context"),
            (self.begin_tx, "begin_tx"),
            (self.ping, "ping"),
            (self.exec, "exec"),
            (self.exec_context, "exec_context"),
            (self.query, "query"),
            (self.query_context, "query_context"),
            (self.reset_session, "reset_session"),
            (self.check_named_value, "check_named_value"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect()
    }
}

impl fmt::Display for ConnCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(","))
    }
}

/// Which optional capabilities a statement implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StmtCapabilities {
    pub exec_context: bool,
    pub query_context: bool,
    pub column_converter: bool,
    pub check_named_value: bool,
}

impl StmtCapabilities {
    pub fn of(stmt: &mut dyn Stmt) -> Self {
        Self {
            exec_context: stmt.as_exec_context().is_some(),
            query_context: stmt.as_query_context().is_some(),
            column_converter: stmt.as_column_converter().is_some(),
            check_named_value: stmt.as_named_value_checker().is_some(),
        }
    }
}

impl fmt::Display for StmtCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.exec_context, "exec_context"),
            (self.query_context, "query_context"),
            (self.column_converter, "column_converter"),
            (self.check_named_value, "check_named_value"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect();
        write!(f, "[{}]", names.join(","))
    }
}
