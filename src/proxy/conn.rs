//! Annotating connection wrapper.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::{observe, skip, StatementProxy};
use crate::annotate::Caller;
use crate::config::AnnotatorConfig;
use crate::context::Context;
use crate::driver::{
    default_check_named_value, Conn, ConnBeginTx, ConnCapabilities, ConnPrepareContext,
    ExecResult, Execer, ExecerContext, NamedValue, NamedValueChecker, Pinger, Queryer,
    QueryerContext, Rows, SessionResetter, Stmt, Tx, TxOptions, Value,
};
use crate::error::Result;
use crate::parser;

/// Shared so statements can hold a `Weak` back-reference. Not contended:
/// one caller uses a connection at a time.
pub(crate) type SharedConn = Arc<Mutex<Box<dyn Conn>>>;

/// Wraps an underlying connection, annotating every query it forwards.
///
/// The proxy implements every optional capability of [`Conn`]. Each one
/// delegates to the wrapped connection when it implements it and returns
/// [`Error::Skip`](crate::Error::Skip) otherwise. Arguments, results and
/// driver errors pass through untouched; only the query text changes.
///
/// The recorded caller is the code above the proxy's entry point: the
/// application when it calls the proxy directly, or the entry point recorded
/// by the host layer through [`CallSite`](crate::CallSite).
///
/// Capabilities are captured once at wrap time and decide dispatch: a call
/// the wrapped connection does not support answers `Skip` without touching
/// it. The connection sits behind a mutex only so statements can reach it
/// through a `Weak` back-reference for argument checking; the proxy is used
/// by one caller at a time and the lock is never held across calls.
///
/// # Example
///
/// ```rust,ignore
/// use sql_annotator::driver::Execer;
/// use sql_annotator::ConnectionProxy;
///
/// let mut conn = ConnectionProxy::wrap(raw_conn);
/// // delivered as "/* app::load (src/app.rs:12) */ DELETE FROM sessions"
/// conn.exec("DELETE FROM sessions", &[])?;
/// ```
pub struct ConnectionProxy {
    inner: SharedConn,
    capabilities: ConnCapabilities,
    config: Arc<AnnotatorConfig>,
}

impl ConnectionProxy {
    pub fn new(mut conn: Box<dyn Conn>, config: Arc<AnnotatorConfig>) -> Self {
        let capabilities = ConnCapabilities::of(conn.as_mut());
        tracing::debug!(%capabilities, "wrapped connection");
        Self {
            inner: Arc::new(Mutex::new(conn)),
            capabilities,
            config,
        }
    }

    /// Wrap with the default configuration.
    pub fn wrap(conn: Box<dyn Conn>) -> Self {
        Self::new(conn, Arc::new(AnnotatorConfig::default()))
    }

    /// Capabilities of the wrapped connection, captured at wrap time.
    pub fn capabilities(&self) -> ConnCapabilities {
        self.capabilities
    }

    pub fn config(&self) -> &AnnotatorConfig {
        &self.config
    }

    #[track_caller]
    fn annotate(&self, query: &str) -> String {
        let caller = Caller::capture(self.config.resolve_function_names);
        let annotated = caller.annotate(query);
        if self.config.log_statements {
            tracing::debug!(
                caller = %caller,
                db.operation = parser::operation(query),
                db.statement = annotated.as_str(),
                "annotated statement"
            );
        }
        annotated
    }

    fn observe<T>(&self, operation: &'static str, statement: &str, start: Instant, result: &Result<T>) {
        observe(&self.config, operation, statement, start, result);
    }

    /// Context-aware prepare, falling back to legacy prepare.
    ///
    /// The legacy call cannot be interrupted. If the context is done by the
    /// time it returns, the fresh statement is closed and the context error
    /// reported instead.
    fn prepare_annotated(&self, ctx: &Context, query: &str) -> Result<Box<dyn Stmt>> {
        let mut conn = self.inner.lock();
        if self.capabilities.prepare_context {
            if let Some(preparer) = conn.as_prepare_context() {
                return preparer.prepare_context(ctx, query);
            }
        }

        let mut stmt = conn.prepare(query)?;
        if let Some(err) = ctx.err() {
            if let Err(close_err) = stmt.close() {
                tracing::debug!(error = %close_err, "closing cancelled statement failed");
            }
            return Err(err);
        }
        Ok(stmt)
    }
}

impl fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProxy")
            .field("capabilities", &self.capabilities)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Conn for ConnectionProxy {
    /// Legacy prepare. The statement is returned unwrapped.
    fn prepare(&mut self, query: &str) -> Result<Box<dyn Stmt>> {
        let query = self.annotate(query);
        let start = Instant::now();
        let result = self.inner.lock().prepare(&query);
        self.observe("prepare", &query, start, &result);
        result
    }

    fn close(&mut self) -> Result<()> {
        self.inner.lock().close()
    }

    fn begin(&mut self) -> Result<Box<dyn Tx>> {
        self.inner.lock().begin()
    }

    fn as_prepare_context(&mut self) -> Option<&mut dyn ConnPrepareContext> {
        Some(self)
    }

    fn as_begin_tx(&mut self) -> Option<&mut dyn ConnBeginTx> {
        Some(self)
    }

    fn as_pinger(&mut self) -> Option<&mut dyn Pinger> {
        Some(self)
    }

    fn as_execer(&mut self) -> Option<&mut dyn Execer> {
        Some(self)
    }

    fn as_execer_context(&mut self) -> Option<&mut dyn ExecerContext> {
        Some(self)
    }

    fn as_queryer(&mut self) -> Option<&mut dyn Queryer> {
        Some(self)
    }

    fn as_queryer_context(&mut self) -> Option<&mut dyn QueryerContext> {
        Some(self)
    }

    fn as_session_resetter(&mut self) -> Option<&mut dyn SessionResetter> {
        Some(self)
    }

    fn as_named_value_checker(&mut self) -> Option<&mut dyn NamedValueChecker> {
        Some(self)
    }
}

impl ConnPrepareContext for ConnectionProxy {
    fn prepare_context(&mut self, ctx: &Context, query: &str) -> Result<Box<dyn Stmt>> {
        let query = self.annotate(query);
        let start = Instant::now();
        let result = self.prepare_annotated(ctx, &query);
        self.observe("prepare_context", &query, start, &result);

        let stmt = result?;
        Ok(Box::new(StatementProxy::new(stmt, Arc::downgrade(&self.inner))))
    }
}

impl ConnBeginTx for ConnectionProxy {
    fn begin_tx(&mut self, ctx: &Context, opts: &TxOptions) -> Result<Box<dyn Tx>> {
        if !self.capabilities.begin_tx {
            return Err(skip("begin_tx"));
        }
        let mut conn = self.inner.lock();
        match conn.as_begin_tx() {
            Some(beginner) => beginner.begin_tx(ctx, opts),
            None => Err(skip("begin_tx")),
        }
    }
}

impl Pinger for ConnectionProxy {
    fn ping(&mut self, ctx: &Context) -> Result<()> {
        if !self.capabilities.ping {
            return Err(skip("ping"));
        }
        let mut conn = self.inner.lock();
        match conn.as_pinger() {
            Some(pinger) => pinger.ping(ctx),
            None => Err(skip("ping")),
        }
    }
}

impl Execer for ConnectionProxy {
    fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        if !self.capabilities.exec {
            return Err(skip("exec"));
        }
        let mut conn = self.inner.lock();
        let Some(execer) = conn.as_execer() else {
            return Err(skip("exec"));
        };
        let query = self.annotate(query);
        let start = Instant::now();
        let result = execer.exec(&query, args);
        self.observe("exec", &query, start, &result);
        result
    }
}

impl ExecerContext for ConnectionProxy {
    fn exec_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> Result<ExecResult> {
        if !self.capabilities.exec_context {
            return Err(skip("exec_context"));
        }
        let mut conn = self.inner.lock();
        let Some(execer) = conn.as_execer_context() else {
            return Err(skip("exec_context"));
        };
        let query = self.annotate(query);
        let start = Instant::now();
        let result = execer.exec_context(ctx, &query, args);
        self.observe("exec_context", &query, start, &result);
        result
    }
}

impl Queryer for ConnectionProxy {
    fn query(&mut self, query: &str, args: &[Value]) -> Result<Box<dyn Rows>> {
        if !self.capabilities.query {
            return Err(skip("query"));
        }
        let mut conn = self.inner.lock();
        let Some(queryer) = conn.as_queryer() else {
            return Err(skip("query"));
        };
        let query = self.annotate(query);
        let start = Instant::now();
        let result = queryer.query(&query, args);
        self.observe("query", &query, start, &result);
        result
    }
}

impl QueryerContext for ConnectionProxy {
    fn query_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> Result<Box<dyn Rows>> {
        if !self.capabilities.query_context {
            return Err(skip("query_context"));
        }
        let mut conn = self.inner.lock();
        let Some(queryer) = conn.as_queryer_context() else {
            return Err(skip("query_context"));
        };
        let query = self.annotate(query);
        let start = Instant::now();
        let result = queryer.query_context(ctx, &query, args);
        self.observe("query_context", &query, start, &result);
        result
    }
}

impl SessionResetter for ConnectionProxy {
    fn reset_session(&mut self, ctx: &Context) -> Result<()> {
        if !self.capabilities.reset_session {
            return Err(skip("reset_session"));
        }
        let mut conn = self.inner.lock();
        match conn.as_session_resetter() {
            Some(resetter) => resetter.reset_session(ctx),
            None => Err(skip("reset_session")),
        }
    }
}

impl NamedValueChecker for ConnectionProxy {
    fn check_named_value(&mut self, nv: &mut NamedValue) -> Result<()> {
        if !self.capabilities.check_named_value {
            return default_check_named_value(nv);
        }
        let mut conn = self.inner.lock();
        match conn.as_named_value_checker() {
            Some(checker) => checker.check_named_value(nv),
            None => default_check_named_value(nv),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::annotate;
    use crate::error::Error;
    use crate::testing::{FakeConn, FakeError, Journal};

    fn proxy(caps: ConnCapabilities) -> (ConnectionProxy, Journal) {
        let journal = Journal::default();
        let conn = FakeConn::new(journal.clone(), caps);
        (ConnectionProxy::wrap(Box::new(conn)), journal)
    }

    fn annotation(line: u32) -> String {
        format!("({}:{line}) */ ", file!())
    }

    #[test]
    fn test_capabilities_are_snapshotted() {
        let caps = ConnCapabilities {
            ping: true,
            query_context: true,
            ..Default::default()
        };
        let (proxy, _) = proxy(caps);
        assert_eq!(proxy.capabilities(), caps);
    }

    #[test]
    fn test_proxy_exposes_every_capability() {
        let (mut proxy, _) = proxy(ConnCapabilities::default());
        assert_eq!(ConnCapabilities::of(&mut proxy), ConnCapabilities::all());
    }

    #[test]
    fn test_exec_context_annotates_query() {
        let (mut proxy, journal) = proxy(ConnCapabilities::all());
        let line = line!() + 1;
        let result = proxy.exec_context(&Context::new(), "UPDATE users SET a = 1", &[]);
        assert_eq!(result.unwrap().rows_affected, 1);

        let delivered = journal.last_query().unwrap();
        assert!(delivered.starts_with("/* "), "{delivered}");
        assert!(
            delivered.ends_with(&format!("{}UPDATE users SET a = 1", annotation(line))),
            "{delivered}"
        );
        assert_eq!(annotate::strip(&delivered), "UPDATE users SET a = 1");
    }

    #[test]
    fn test_arguments_are_untouched() {
        let (mut proxy, journal) = proxy(ConnCapabilities::all());
        let args = vec![Value::from(3i32), Value::from("x")];
        proxy.exec("INSERT INTO t VALUES (?, ?)", &args).unwrap();
        assert_eq!(journal.last_args(), args);
    }

    #[test]
    fn test_query_variants_annotate() {
        let (mut proxy, journal) = proxy(ConnCapabilities::all());
        let line = line!() + 1;
        let mut rows = proxy.query("SELECT 1", &[]).unwrap();
        assert_eq!(rows.next().unwrap(), Some(vec![Value::from(1i64)]));
        assert!(journal
            .last_query()
            .unwrap()
            .ends_with(&format!("{}SELECT 1", annotation(line))));

        let line = line!() + 1;
        proxy.query_context(&Context::new(), "SELECT 2", &[]).unwrap();
        assert!(journal
            .last_query()
            .unwrap()
            .ends_with(&format!("{}SELECT 2", annotation(line))));
        assert_eq!(journal.calls(), vec!["query", "query_context"]);
    }

    #[test]
    fn test_missing_capabilities_yield_skip() {
        let (mut proxy, journal) = proxy(ConnCapabilities::default());
        let ctx = Context::new();

        assert!(proxy.ping(&ctx).unwrap_err().is_skip());
        assert!(proxy.reset_session(&ctx).unwrap_err().is_skip());
        assert!(proxy.begin_tx(&ctx, &TxOptions::default()).err().unwrap().is_skip());
        assert!(proxy.exec("DELETE FROM t", &[]).unwrap_err().is_skip());
        assert!(proxy.exec_context(&ctx, "DELETE FROM t", &[]).unwrap_err().is_skip());
        assert!(proxy.query("SELECT 1", &[]).err().unwrap().is_skip());
        assert!(proxy.query_context(&ctx, "SELECT 1", &[]).err().unwrap().is_skip());

        // nothing reached the wrapped connection
        assert!(journal.calls().is_empty());
        assert!(journal.queries().is_empty());
    }

    #[test]
    fn test_dispatch_uses_captured_capabilities() {
        let (mut proxy, _) = proxy(ConnCapabilities::default());
        let ctx = Context::new();

        // unsupported calls answer without taking the connection lock
        let inner = proxy.inner.clone();
        let _held = inner.lock();
        assert!(proxy.ping(&ctx).unwrap_err().is_skip());
        assert!(proxy.exec_context(&ctx, "DELETE FROM t", &[]).unwrap_err().is_skip());
        assert!(proxy.query("SELECT 1", &[]).err().unwrap().is_skip());

        let mut nv = NamedValue::positional(1, 5i32);
        proxy.check_named_value(&mut nv).unwrap();
        assert_eq!(nv.value, Value::BigInt(Some(5)));
    }

    #[test]
    fn test_supported_capabilities_delegate() {
        let (mut proxy, journal) = proxy(ConnCapabilities::all());
        let ctx = Context::new();
        proxy.ping(&ctx).unwrap();
        proxy.reset_session(&ctx).unwrap();
        let tx = proxy.begin_tx(&ctx, &TxOptions::default()).unwrap();
        tx.commit().unwrap();
        assert_eq!(journal.calls(), vec!["ping", "reset_session", "begin_tx", "commit"]);
    }

    #[test]
    fn test_driver_errors_pass_through() {
        let journal = Journal::default();
        let conn = FakeConn::new(journal.clone(), ConnCapabilities::all()).failing("duplicate key");
        let mut proxy = ConnectionProxy::wrap(Box::new(conn));

        let err = proxy.exec("INSERT INTO t VALUES (1)", &[]).unwrap_err();
        match err {
            Error::Driver(inner) => {
                let fake = inner.downcast_ref::<FakeError>().unwrap();
                assert_eq!(fake.0, "duplicate key");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_prepare_context_wraps_statement() {
        let (mut proxy, journal) = proxy(ConnCapabilities::all());
        let line = line!() + 1;
        let mut stmt = proxy.prepare_context(&Context::new(), "SELECT * FROM t").unwrap();
        assert!(journal
            .last_query()
            .unwrap()
            .ends_with(&format!("{}SELECT * FROM t", annotation(line))));
        assert_eq!(journal.calls(), vec!["prepare_context"]);
        // statement proxies expose the full statement surface
        assert!(stmt.as_exec_context().is_some());
        assert!(stmt.as_column_converter().is_some());
    }

    #[test]
    fn test_prepare_context_falls_back_to_annotated_legacy_prepare() {
        let (mut proxy, journal) = proxy(ConnCapabilities::default());
        let line = line!() + 1;
        let stmt = proxy.prepare_context(&Context::new(), "SELECT 1");
        assert!(stmt.is_ok());
        assert_eq!(journal.calls(), vec!["prepare"]);
        assert!(journal
            .last_query()
            .unwrap()
            .ends_with(&format!("{}SELECT 1", annotation(line))));
    }

    #[test]
    fn test_cancel_during_legacy_prepare_closes_statement() {
        let ctx = Context::new();
        let journal = Journal::default();
        let conn =
            FakeConn::new(journal.clone(), ConnCapabilities::default()).cancel_on_prepare(ctx.clone());
        let mut proxy = ConnectionProxy::wrap(Box::new(conn));

        let err = proxy.prepare_context(&ctx, "SELECT 1").err().unwrap();
        assert!(matches!(err, Error::Canceled));
        // issued to the database, then released
        assert_eq!(journal.calls(), vec!["prepare", "stmt.close"]);
        assert_eq!(journal.queries().len(), 1);
    }

    #[test]
    fn test_expired_deadline_after_legacy_prepare() {
        let ctx = Context::new().with_timeout(Duration::ZERO);
        let (mut proxy, journal) = proxy(ConnCapabilities::default());
        let err = proxy.prepare_context(&ctx, "SELECT 1").err().unwrap();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(journal.calls(), vec!["prepare", "stmt.close"]);
    }

    #[test]
    fn test_legacy_prepare_annotates() {
        let (mut proxy, journal) = proxy(ConnCapabilities::all());
        let line = line!() + 1;
        proxy.prepare("SELECT 3").unwrap();
        assert!(journal
            .last_query()
            .unwrap()
            .ends_with(&format!("{}SELECT 3", annotation(line))));
    }

    #[test]
    fn test_check_named_value_delegates() {
        let (mut proxy, journal) = proxy(ConnCapabilities::all());
        let mut nv = NamedValue::positional(1, 5i32);
        proxy.check_named_value(&mut nv).unwrap();
        assert_eq!(nv.value, Value::from("conn"));
        assert_eq!(journal.calls(), vec!["check_named_value"]);
    }

    #[test]
    fn test_check_named_value_defaults_to_conversion() {
        let (mut proxy, journal) = proxy(ConnCapabilities::default());
        let mut nv = NamedValue::positional(1, 5i32);
        proxy.check_named_value(&mut nv).unwrap();
        assert_eq!(nv.value, Value::BigInt(Some(5)));
        assert!(journal.calls().is_empty());
    }

    #[test]
    fn test_close_and_begin_forward() {
        let (mut proxy, journal) = proxy(ConnCapabilities::default());
        proxy.begin().unwrap().rollback().unwrap();
        proxy.close().unwrap();
        assert_eq!(journal.calls(), vec!["begin", "rollback", "close"]);
    }
}
