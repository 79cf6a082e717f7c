//! Instrumented fake driver for unit tests.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::annotate;
use crate::context::Context;
use crate::driver::{
    ColumnConverter, Conn, ConnBeginTx, ConnCapabilities, ConnPrepareContext, Driver, ExecResult,
    Execer, ExecerContext, NamedValue, NamedValueChecker, Pinger, Queryer, QueryerContext, Rows,
    SessionResetter, Stmt, StmtCapabilities, StmtExecContext, StmtQueryContext, Tx, TxOptions,
    Value, ValueConverter,
};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct FakeError(pub &'static str);

impl fmt::Display for FakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for FakeError {}

#[derive(Debug, Default)]
struct Entries {
    opens: usize,
    calls: Vec<&'static str>,
    queries: Vec<String>,
    args: Vec<Value>,
}

/// Shared record of everything the fake driver saw.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Entries>>,
}

impl Journal {
    fn open(&self) {
        self.entries.lock().opens += 1;
    }

    fn call(&self, name: &'static str) {
        self.entries.lock().calls.push(name);
    }

    fn query(&self, name: &'static str, query: &str) {
        let mut entries = self.entries.lock();
        entries.calls.push(name);
        entries.queries.push(query.to_string());
    }

    fn args(&self, args: Vec<Value>) {
        self.entries.lock().args = args;
    }

    pub fn opens(&self) -> usize {
        self.entries.lock().opens
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.entries.lock().calls.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.entries.lock().queries.clone()
    }

    pub fn last_query(&self) -> Option<String> {
        self.entries.lock().queries.last().cloned()
    }

    /// Arguments of the most recent exec or query.
    pub fn last_args(&self) -> Vec<Value> {
        self.entries.lock().args.clone()
    }
}

fn named_args(args: &[NamedValue]) -> Vec<Value> {
    args.iter().map(|nv| nv.value.clone()).collect()
}

pub struct FakeDriver {
    journal: Journal,
    caps: ConnCapabilities,
    stmt_caps: StmtCapabilities,
    refuse: Option<&'static str>,
    refusals: AtomicUsize,
}

impl FakeDriver {
    pub fn new(caps: ConnCapabilities) -> Self {
        Self {
            journal: Journal::default(),
            caps,
            stmt_caps: StmtCapabilities::default(),
            refuse: None,
            refusals: AtomicUsize::new(0),
        }
    }

    pub fn with_stmt_capabilities(mut self, caps: StmtCapabilities) -> Self {
        self.stmt_caps = caps;
        self
    }

    /// Every open fails with `message`.
    pub fn refusing(mut self, message: &'static str) -> Self {
        self.refuse = Some(message);
        self.refusals = AtomicUsize::new(usize::MAX);
        self
    }

    /// Only the first open fails with `message`.
    pub fn refusing_once(mut self, message: &'static str) -> Self {
        self.refuse = Some(message);
        self.refusals = AtomicUsize::new(1);
        self
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

impl Driver for FakeDriver {
    fn open(&self, _dsn: &str) -> Result<Box<dyn Conn>> {
        self.journal.open();
        if let Some(message) = self.refuse {
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                    0 => None,
                    usize::MAX => Some(left),
                    left => Some(left - 1),
                })
                .is_ok();
            if refused {
                return Err(Error::driver(FakeError(message)));
            }
        }
        let conn =
            FakeConn::new(self.journal.clone(), self.caps).with_stmt_capabilities(self.stmt_caps);
        Ok(Box::new(conn))
    }
}

pub struct FakeConn {
    journal: Journal,
    caps: ConnCapabilities,
    stmt_caps: StmtCapabilities,
    failure: Option<&'static str>,
    cancel_on_prepare: Option<Context>,
}

impl FakeConn {
    pub fn new(journal: Journal, caps: ConnCapabilities) -> Self {
        Self {
            journal,
            caps,
            stmt_caps: StmtCapabilities::default(),
            failure: None,
            cancel_on_prepare: None,
        }
    }

    pub fn with_stmt_capabilities(mut self, caps: StmtCapabilities) -> Self {
        self.stmt_caps = caps;
        self
    }

    /// Exec and query calls fail with `message`.
    pub fn failing(mut self, message: &'static str) -> Self {
        self.failure = Some(message);
        self
    }

    /// Legacy prepare cancels `ctx` before returning, as if the caller gave
    /// up while the call was blocked.
    pub fn cancel_on_prepare(mut self, ctx: Context) -> Self {
        self.cancel_on_prepare = Some(ctx);
        self
    }

    fn outcome(&self) -> Result<()> {
        match self.failure {
            Some(message) => Err(Error::driver(FakeError(message))),
            None => Ok(()),
        }
    }

    fn statement(&self, query: &str) -> Box<dyn Stmt> {
        Box::new(FakeStmt::new(self.journal.clone(), query, self.stmt_caps))
    }
}

impl Conn for FakeConn {
    fn prepare(&mut self, query: &str) -> Result<Box<dyn Stmt>> {
        self.journal.query("prepare", query);
        if let Some(ctx) = &self.cancel_on_prepare {
            ctx.cancel();
        }
        Ok(self.statement(query))
    }

    fn close(&mut self) -> Result<()> {
        self.journal.call("close");
        Ok(())
    }

    fn begin(&mut self) -> Result<Box<dyn Tx>> {
        self.journal.call("begin");
        Ok(Box::new(FakeTx(self.journal.clone())))
    }

    fn as_prepare_context(&mut self) -> Option<&mut dyn ConnPrepareContext> {
        if self.caps.prepare_context {
            Some(self)
        } else {
            None
        }
    }

    fn as_begin_tx(&mut self) -> Option<&mut dyn ConnBeginTx> {
        if self.caps.begin_tx {
            Some(self)
        } else {
            None
        }
    }

    fn as_pinger(&mut self) -> Option<&mut dyn Pinger> {
        if self.caps.ping {
            Some(self)
        } else {
            None
        }
    }

    fn as_execer(&mut self) -> Option<&mut dyn Execer> {
        if self.caps.exec {
            Some(self)
        } else {
            None
        }
    }

    fn as_execer_context(&mut self) -> Option<&mut dyn ExecerContext> {
        if self.caps.exec_context {
            Some(self)
        } else {
            None
        }
    }

    fn as_queryer(&mut self) -> Option<&mut dyn Queryer> {
        if self.caps.query {
            Some(self)
        } else {
            None
        }
    }

    fn as_queryer_context(&mut self) -> Option<&mut dyn QueryerContext> {
        if self.caps.query_context {
            Some(self)
        } else {
            None
        }
    }

    fn as_session_resetter(&mut self) -> Option<&mut dyn SessionResetter> {
        if self.caps.reset_session {
            Some(self)
        } else {
            None
        }
    }

    fn as_named_value_checker(&mut self) -> Option<&mut dyn NamedValueChecker> {
        if self.caps.check_named_value {
            Some(self)
        } else {
            None
        }
    }
}

impl ConnPrepareContext for FakeConn {
    fn prepare_context(&mut self, ctx: &Context, query: &str) -> Result<Box<dyn Stmt>> {
        self.journal.query("prepare_context", query);
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        Ok(self.statement(query))
    }
}

impl ConnBeginTx for FakeConn {
    fn begin_tx(&mut self, _ctx: &Context, _opts: &TxOptions) -> Result<Box<dyn Tx>> {
        self.journal.call("begin_tx");
        Ok(Box::new(FakeTx(self.journal.clone())))
    }
}

impl Pinger for FakeConn {
    fn ping(&mut self, _ctx: &Context) -> Result<()> {
        self.journal.call("ping");
        Ok(())
    }
}

impl Execer for FakeConn {
    fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.journal.query("exec", query);
        self.journal.args(args.to_vec());
        self.outcome()?;
        Ok(ExecResult {
            last_insert_id: None,
            rows_affected: 1,
        })
    }
}

impl ExecerContext for FakeConn {
    fn exec_context(
        &mut self,
        _ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> Result<ExecResult> {
        self.journal.query("exec_context", query);
        self.journal.args(named_args(args));
        self.outcome()?;
        Ok(ExecResult {
            last_insert_id: None,
            rows_affected: 1,
        })
    }
}

impl Queryer for FakeConn {
    fn query(&mut self, query: &str, args: &[Value]) -> Result<Box<dyn Rows>> {
        self.journal.query("query", query);
        self.journal.args(args.to_vec());
        self.outcome()?;
        Ok(Box::new(FakeRows::one()))
    }
}

impl QueryerContext for FakeConn {
    fn query_context(
        &mut self,
        _ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> Result<Box<dyn Rows>> {
        self.journal.query("query_context", query);
        self.journal.args(named_args(args));
        self.outcome()?;
        Ok(Box::new(FakeRows::one()))
    }
}

impl SessionResetter for FakeConn {
    fn reset_session(&mut self, _ctx: &Context) -> Result<()> {
        self.journal.call("reset_session");
        Ok(())
    }
}

impl NamedValueChecker for FakeConn {
    fn check_named_value(&mut self, nv: &mut NamedValue) -> Result<()> {
        self.journal.call("check_named_value");
        nv.value = Value::from("conn");
        Ok(())
    }
}

/// Converts every value to the string `"column"`.
struct MarkingConverter;

impl ValueConverter for MarkingConverter {
    fn convert_value(&self, _value: &Value) -> Result<Value> {
        Ok(Value::from("column"))
    }
}

static MARKING_CONVERTER: MarkingConverter = MarkingConverter;

pub struct FakeStmt {
    journal: Journal,
    num_input: usize,
    caps: StmtCapabilities,
}

impl FakeStmt {
    pub fn new(journal: Journal, query: &str, caps: StmtCapabilities) -> Self {
        let num_input = annotate::strip(query).matches('?').count();
        Self {
            journal,
            num_input,
            caps,
        }
    }
}

impl Stmt for FakeStmt {
    fn close(&mut self) -> Result<()> {
        self.journal.call("stmt.close");
        Ok(())
    }

    fn num_input(&self) -> Option<usize> {
        Some(self.num_input)
    }

    fn exec(&mut self, args: &[Value]) -> Result<ExecResult> {
        self.journal.call("stmt.exec");
        self.journal.args(args.to_vec());
        Ok(ExecResult {
            last_insert_id: Some(7),
            rows_affected: 1,
        })
    }

    fn query(&mut self, args: &[Value]) -> Result<Box<dyn Rows>> {
        self.journal.call("stmt.query");
        self.journal.args(args.to_vec());
        Ok(Box::new(FakeRows::one()))
    }

    fn as_exec_context(&mut self) -> Option<&mut dyn StmtExecContext> {
        if self.caps.exec_context {
            Some(self)
        } else {
            None
        }
    }

    fn as_query_context(&mut self) -> Option<&mut dyn StmtQueryContext> {
        if self.caps.query_context {
            Some(self)
        } else {
            None
        }
    }

    fn as_column_converter(&self) -> Option<&dyn ColumnConverter> {
        if self.caps.column_converter {
            Some(self)
        } else {
            None
        }
    }

    fn as_named_value_checker(&mut self) -> Option<&mut dyn NamedValueChecker> {
        if self.caps.check_named_value {
            Some(self)
        } else {
            None
        }
    }
}

impl StmtExecContext for FakeStmt {
    fn exec_context(&mut self, _ctx: &Context, args: &[NamedValue]) -> Result<ExecResult> {
        self.journal.call("stmt.exec_context");
        self.journal.args(named_args(args));
        Ok(ExecResult {
            last_insert_id: Some(7),
            rows_affected: 1,
        })
    }
}

impl StmtQueryContext for FakeStmt {
    fn query_context(&mut self, _ctx: &Context, args: &[NamedValue]) -> Result<Box<dyn Rows>> {
        self.journal.call("stmt.query_context");
        self.journal.args(named_args(args));
        Ok(Box::new(FakeRows::one()))
    }
}

impl ColumnConverter for FakeStmt {
    fn column_converter(&self, _idx: usize) -> &dyn ValueConverter {
        &MARKING_CONVERTER
    }
}

impl NamedValueChecker for FakeStmt {
    fn check_named_value(&mut self, nv: &mut NamedValue) -> Result<()> {
        self.journal.call("stmt.check_named_value");
        nv.value = Value::from("stmt");
        Ok(())
    }
}

struct FakeTx(Journal);

impl Tx for FakeTx {
    fn commit(self: Box<Self>) -> Result<()> {
        self.0.call("commit");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.0.call("rollback");
        Ok(())
    }
}

/// A single row holding `1`.
pub struct FakeRows {
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl FakeRows {
    pub fn one() -> Self {
        Self {
            rows: vec![vec![Value::from(1i64)]].into_iter(),
        }
    }
}

impl Rows for FakeRows {
    fn columns(&self) -> Vec<String> {
        vec!["1".to_string()]
    }

    fn next(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.rows.next())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
