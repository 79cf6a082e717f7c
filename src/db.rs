//! Host layer: the named driver table and a small pooled database handle.
//!
//! [`Db`] probes the optional capabilities of each connection at runtime.
//! The context-aware call is used when present, the legacy call otherwise.
//! A missing capability, or one answering [`Error::Skip`], sends the call
//! down the generic prepare-and-execute path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::annotate::CallSite;
use crate::context::Context;
use crate::driver::{
    default_check_named_value, AccessMode, Conn, Driver, ExecResult, NamedValue, Rows, Stmt, Tx,
    TxOptions, Value,
};
use crate::error::{Error, Result};

const DEFAULT_MAX_IDLE_CONNS: usize = 2;

static GLOBAL_DRIVERS: Lazy<Arc<DriverTable>> = Lazy::new(|| Arc::new(DriverTable::new()));

/// Drivers by name.
#[derive(Default)]
pub struct DriverTable {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table used by [`register`] and [`Db::open`].
    pub fn global() -> &'static Arc<DriverTable> {
        &GLOBAL_DRIVERS
    }

    /// Register `driver` under `name`. A name can only be registered once.
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Result<()> {
        let name = name.into();
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&name) {
            return Err(Error::DuplicateDriver(name));
        }
        tracing::debug!(driver = %name, "registered driver");
        drivers.insert(name, driver);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for DriverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverTable")
            .field("drivers", &self.names())
            .finish()
    }
}

/// Register a driver in the process-wide table.
pub fn register(name: impl Into<String>, driver: Arc<dyn Driver>) -> Result<()> {
    DriverTable::global().register(name, driver)
}

/// Names of the drivers in the process-wide table, sorted.
pub fn drivers() -> Vec<String> {
    DriverTable::global().names()
}

/// Rows drained from a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

struct Pool {
    idle: Vec<Box<dyn Conn>>,
    closed: bool,
}

/// A database handle over a named driver.
///
/// Opening is lazy: connections are opened on first use and up to
/// `max_idle_conns` of them are kept for reuse. Idle connections are reset
/// through their session resetter before being handed out again.
///
/// Every method taking query text is `#[track_caller]` and records its call
/// site, so an annotating driver attributes the query to the code calling
/// `Db`, not to `Db` itself.
pub struct Db {
    driver_name: String,
    dsn: String,
    driver: Arc<dyn Driver>,
    pool: Mutex<Pool>,
    max_idle_conns: usize,
}

impl Db {
    /// Open a handle over a driver from the process-wide table.
    pub fn open(driver_name: &str, dsn: &str) -> Result<Self> {
        Self::open_in(DriverTable::global(), driver_name, dsn)
    }

    pub fn open_in(drivers: &DriverTable, driver_name: &str, dsn: &str) -> Result<Self> {
        let driver = drivers
            .lookup(driver_name)
            .ok_or_else(|| Error::UnknownDriver(driver_name.to_string()))?;
        Ok(Self {
            driver_name: driver_name.to_string(),
            dsn: dsn.to_string(),
            driver,
            pool: Mutex::new(Pool {
                idle: Vec::new(),
                closed: false,
            }),
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
        })
    }

    pub fn with_max_idle_conns(mut self, max_idle_conns: usize) -> Self {
        self.max_idle_conns = max_idle_conns;
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn idle_conns(&self) -> usize {
        self.pool.lock().idle.len()
    }

    pub fn ping(&self, ctx: &Context) -> Result<()> {
        let mut conn = self.conn(ctx)?;
        let result = ping_conn(conn.as_mut(), ctx);
        self.release(conn, result.as_ref().err());
        result
    }

    #[track_caller]
    pub fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.exec_context(&Context::new(), query, args)
    }

    #[track_caller]
    pub fn exec_context(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        let _site = CallSite::enter();
        let mut conn = self.conn(ctx)?;
        let result = exec_conn(conn.as_mut(), ctx, query, args);
        self.release(conn, result.as_ref().err());
        result
    }

    #[track_caller]
    pub fn query(&self, query: &str, args: &[Value]) -> Result<QueryResult> {
        self.query_context(&Context::new(), query, args)
    }

    #[track_caller]
    pub fn query_context(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<QueryResult> {
        let _site = CallSite::enter();
        let mut conn = self.conn(ctx)?;
        let result = query_conn(conn.as_mut(), ctx, query, args);
        self.release(conn, result.as_ref().err());
        result
    }

    /// Prepare a statement. The statement holds its connection until closed.
    #[track_caller]
    pub fn prepare(&self, query: &str) -> Result<Statement<'_>> {
        self.prepare_context(&Context::new(), query)
    }

    #[track_caller]
    pub fn prepare_context(&self, ctx: &Context, query: &str) -> Result<Statement<'_>> {
        let _site = CallSite::enter();
        let mut conn = self.conn(ctx)?;
        match prepare_conn(conn.as_mut(), ctx, query) {
            Ok(stmt) => Ok(Statement {
                db: self,
                conn: Some(conn),
                stmt: Some(stmt),
            }),
            Err(err) => {
                self.release(conn, Some(&err));
                Err(err)
            }
        }
    }

    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.begin_tx(&Context::new(), &TxOptions::default())
    }

    /// Start a transaction. It holds its connection until committed or
    /// rolled back; dropping it rolls back.
    pub fn begin_tx(&self, ctx: &Context, opts: &TxOptions) -> Result<Transaction<'_>> {
        let mut conn = self.conn(ctx)?;
        match begin_conn(conn.as_mut(), ctx, opts) {
            Ok(tx) => Ok(Transaction {
                db: self,
                conn: Some(conn),
                tx: Some(tx),
            }),
            Err(err) => {
                self.release(conn, Some(&err));
                Err(err)
            }
        }
    }

    /// Close idle connections and refuse further use. Connections held by
    /// open statements or transactions are closed when released.
    pub fn close(&self) -> Result<()> {
        let idle = {
            let mut pool = self.pool.lock();
            pool.closed = true;
            std::mem::take(&mut pool.idle)
        };

        let mut result = Ok(());
        for mut conn in idle {
            if let Err(err) = conn.close() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn conn(&self, ctx: &Context) -> Result<Box<dyn Conn>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        loop {
            let next = {
                let mut pool = self.pool.lock();
                if pool.closed {
                    return Err(Error::Closed);
                }
                pool.idle.pop()
            };
            let Some(mut conn) = next else {
                break;
            };
            match reset_conn(conn.as_mut(), ctx) {
                Ok(()) => return Ok(conn),
                Err(Error::BadConn) => {
                    tracing::debug!(driver = %self.driver_name, "discarding bad idle connection");
                    close_quietly(conn);
                }
                Err(err) => {
                    close_quietly(conn);
                    return Err(err);
                }
            }
        }

        self.driver.open(&self.dsn)
    }

    fn release(&self, conn: Box<dyn Conn>, err: Option<&Error>) {
        if matches!(err, Some(Error::BadConn)) {
            close_quietly(conn);
            return;
        }
        let mut pool = self.pool.lock();
        if !pool.closed && pool.idle.len() < self.max_idle_conns {
            pool.idle.push(conn);
            return;
        }
        drop(pool);
        close_quietly(conn);
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("driver_name", &self.driver_name)
            .field("max_idle_conns", &self.max_idle_conns)
            .finish_non_exhaustive()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(driver = %self.driver_name, error = %err, "closing idle connections failed");
        }
    }
}

/// A prepared statement bound to one connection.
pub struct Statement<'db> {
    db: &'db Db,
    conn: Option<Box<dyn Conn>>,
    stmt: Option<Box<dyn Stmt>>,
}

impl Statement<'_> {
    pub fn num_input(&self) -> Option<usize> {
        self.stmt.as_ref().and_then(|stmt| stmt.num_input())
    }

    pub fn exec(&mut self, args: &[Value]) -> Result<ExecResult> {
        self.exec_context(&Context::new(), args)
    }

    pub fn exec_context(&mut self, ctx: &Context, args: &[Value]) -> Result<ExecResult> {
        let (Some(conn), Some(stmt)) = (self.conn.as_mut(), self.stmt.as_mut()) else {
            return Err(Error::Closed);
        };
        exec_stmt(conn.as_mut(), stmt.as_mut(), ctx, args)
    }

    pub fn query(&mut self, args: &[Value]) -> Result<QueryResult> {
        self.query_context(&Context::new(), args)
    }

    pub fn query_context(&mut self, ctx: &Context, args: &[Value]) -> Result<QueryResult> {
        let (Some(conn), Some(stmt)) = (self.conn.as_mut(), self.stmt.as_mut()) else {
            return Err(Error::Closed);
        };
        query_stmt(conn.as_mut(), stmt.as_mut(), ctx, args).and_then(collect_rows)
    }

    /// Close the statement and return its connection to the pool.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let result = match self.stmt.take() {
            Some(mut stmt) => stmt.close(),
            None => Ok(()),
        };
        if let Some(conn) = self.conn.take() {
            self.db.release(conn, result.as_ref().err());
        }
        result
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::debug!(error = %err, "closing statement failed");
        }
    }
}

/// A transaction bound to one connection.
pub struct Transaction<'db> {
    db: &'db Db,
    conn: Option<Box<dyn Conn>>,
    tx: Option<Box<dyn Tx>>,
}

impl Transaction<'_> {
    #[track_caller]
    pub fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.exec_context(&Context::new(), query, args)
    }

    #[track_caller]
    pub fn exec_context(&mut self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        let _site = CallSite::enter();
        let conn = self.conn.as_mut().ok_or(Error::Closed)?;
        exec_conn(conn.as_mut(), ctx, query, args)
    }

    #[track_caller]
    pub fn query(&mut self, query: &str, args: &[Value]) -> Result<QueryResult> {
        self.query_context(&Context::new(), query, args)
    }

    #[track_caller]
    pub fn query_context(&mut self, ctx: &Context, query: &str, args: &[Value]) -> Result<QueryResult> {
        let _site = CallSite::enter();
        let conn = self.conn.as_mut().ok_or(Error::Closed)?;
        query_conn(conn.as_mut(), ctx, query, args)
    }

    pub fn commit(mut self) -> Result<()> {
        self.finish(true)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finish(false)
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        let tx = self.tx.take().ok_or(Error::Closed)?;
        let result = if commit { tx.commit() } else { tx.rollback() };
        if let Some(conn) = self.conn.take() {
            self.db.release(conn, result.as_ref().err());
        }
        result
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.tx.is_none() {
            return;
        }
        if let Err(err) = self.finish(false) {
            tracing::debug!(error = %err, "rolling back abandoned transaction failed");
        }
    }
}

fn close_quietly(mut conn: Box<dyn Conn>) {
    if let Err(err) = conn.close() {
        tracing::debug!(error = %err, "closing connection failed");
    }
}

fn close_stmt(mut stmt: Box<dyn Stmt>) {
    if let Err(err) = stmt.close() {
        tracing::debug!(error = %err, "closing statement failed");
    }
}

fn values(args: &[NamedValue]) -> Vec<Value> {
    args.iter().map(|nv| nv.value.clone()).collect()
}

fn ping_conn(conn: &mut dyn Conn, ctx: &Context) -> Result<()> {
    match conn.as_pinger() {
        Some(pinger) => match pinger.ping(ctx) {
            Err(Error::Skip) => Ok(()),
            other => other,
        },
        None => Ok(()),
    }
}

fn reset_conn(conn: &mut dyn Conn, ctx: &Context) -> Result<()> {
    match conn.as_session_resetter() {
        Some(resetter) => match resetter.reset_session(ctx) {
            Err(Error::Skip) => Ok(()),
            other => other,
        },
        None => Ok(()),
    }
}

/// Statement checker, else connection checker; on `Skip` the statement's
/// column converter, else the default converter.
fn check_arg(
    conn: &mut dyn Conn,
    mut stmt: Option<&mut (dyn Stmt + '_)>,
    nv: &mut NamedValue,
) -> Result<()> {
    let checker = match stmt.as_deref_mut().and_then(|stmt| stmt.as_named_value_checker()) {
        Some(checker) => Some(checker),
        None => conn.as_named_value_checker(),
    };
    if let Some(checker) = checker {
        match checker.check_named_value(nv) {
            Err(Error::Skip) => {}
            other => return other,
        }
    }

    if let Some(converter) = stmt.as_deref().and_then(|stmt| stmt.as_column_converter()) {
        let idx = nv.ordinal.saturating_sub(1);
        nv.value = converter.column_converter(idx).convert_value(&nv.value)?;
        return Ok(());
    }
    default_check_named_value(nv)
}

fn check_args(
    conn: &mut dyn Conn,
    mut stmt: Option<&mut (dyn Stmt + '_)>,
    args: &[Value],
) -> Result<Vec<NamedValue>> {
    if let Some(want) = stmt.as_deref().and_then(|stmt| stmt.num_input()) {
        if want != args.len() {
            return Err(Error::Convert(format!(
                "expected {want} arguments, got {}",
                args.len()
            )));
        }
    }

    let mut named = NamedValue::from_values(args);
    for nv in &mut named {
        check_arg(conn, stmt.as_deref_mut(), nv)?;
    }
    Ok(named)
}

#[track_caller]
fn prepare_conn(conn: &mut dyn Conn, ctx: &Context, query: &str) -> Result<Box<dyn Stmt>> {
    if let Some(preparer) = conn.as_prepare_context() {
        return preparer.prepare_context(ctx, query);
    }
    if let Some(err) = ctx.err() {
        return Err(err);
    }
    let stmt = conn.prepare(query)?;
    if let Some(err) = ctx.err() {
        close_stmt(stmt);
        return Err(err);
    }
    Ok(stmt)
}

fn exec_stmt(
    conn: &mut dyn Conn,
    stmt: &mut dyn Stmt,
    ctx: &Context,
    args: &[Value],
) -> Result<ExecResult> {
    let named = check_args(conn, Some(&mut *stmt), args)?;
    if let Some(execer) = stmt.as_exec_context() {
        match execer.exec_context(ctx, &named) {
            Err(Error::Skip) => {}
            other => return other,
        }
    }
    if let Some(err) = ctx.err() {
        return Err(err);
    }
    stmt.exec(&values(&named))
}

fn query_stmt(
    conn: &mut dyn Conn,
    stmt: &mut dyn Stmt,
    ctx: &Context,
    args: &[Value],
) -> Result<Box<dyn Rows>> {
    let named = check_args(conn, Some(&mut *stmt), args)?;
    if let Some(queryer) = stmt.as_query_context() {
        match queryer.query_context(ctx, &named) {
            Err(Error::Skip) => {}
            other => return other,
        }
    }
    if let Some(err) = ctx.err() {
        return Err(err);
    }
    stmt.query(&values(&named))
}

#[track_caller]
fn exec_conn(conn: &mut dyn Conn, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
    let named = check_args(conn, None, args)?;
    match conn.as_execer_context() {
        Some(execer) => match execer.exec_context(ctx, query, &named) {
            Err(Error::Skip) => {}
            other => return other,
        },
        None => {
            if let Some(execer) = conn.as_execer() {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
                match execer.exec(query, &values(&named)) {
                    Err(Error::Skip) => {}
                    other => return other,
                }
            }
        }
    }

    let mut stmt = prepare_conn(conn, ctx, query)?;
    let result = exec_stmt(conn, stmt.as_mut(), ctx, args);
    close_stmt(stmt);
    result
}

#[track_caller]
fn query_conn(
    conn: &mut dyn Conn,
    ctx: &Context,
    query: &str,
    args: &[Value],
) -> Result<QueryResult> {
    let named = check_args(conn, None, args)?;
    match conn.as_queryer_context() {
        Some(queryer) => match queryer.query_context(ctx, query, &named) {
            Err(Error::Skip) => {}
            other => return other.and_then(collect_rows),
        },
        None => {
            if let Some(queryer) = conn.as_queryer() {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
                match queryer.query(query, &values(&named)) {
                    Err(Error::Skip) => {}
                    other => return other.and_then(collect_rows),
                }
            }
        }
    }

    let mut stmt = prepare_conn(conn, ctx, query)?;
    let result = query_stmt(conn, stmt.as_mut(), ctx, args).and_then(collect_rows);
    close_stmt(stmt);
    result
}

fn begin_conn(conn: &mut dyn Conn, ctx: &Context, opts: &TxOptions) -> Result<Box<dyn Tx>> {
    if let Some(beginner) = conn.as_begin_tx() {
        match beginner.begin_tx(ctx, opts) {
            Err(Error::Skip) => {}
            other => return other,
        }
    }
    if opts.isolation_level.is_some() {
        return Err(Error::Unsupported("non-default isolation level"));
    }
    if matches!(opts.access_mode, Some(AccessMode::ReadOnly)) {
        return Err(Error::Unsupported("read-only transactions"));
    }
    if let Some(err) = ctx.err() {
        return Err(err);
    }
    conn.begin()
}

fn collect_rows(mut rows: Box<dyn Rows>) -> Result<QueryResult> {
    let columns = rows.columns();
    let mut collected = Vec::new();
    loop {
        match rows.next() {
            Ok(Some(row)) => collected.push(row),
            Ok(None) => break,
            Err(err) => {
                if let Err(close_err) = rows.close() {
                    tracing::debug!(error = %close_err, "closing rows failed");
                }
                return Err(err);
            }
        }
    }
    rows.close()?;
    Ok(QueryResult {
        columns,
        rows: collected,
    })
}
