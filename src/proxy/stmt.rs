//! Statement wrapper returned by [`ConnectionProxy`](super::ConnectionProxy).

use std::fmt;
use std::sync::Weak;

use parking_lot::Mutex;

use super::skip;
use crate::context::Context;
use crate::driver::{
    default_check_named_value, ColumnConverter, Conn, ExecResult, NamedValue, NamedValueChecker,
    Rows, Stmt, StmtCapabilities, StmtExecContext, StmtQueryContext, Value, ValueConverter,
    DEFAULT_PARAMETER_CONVERTER,
};
use crate::error::Result;

/// Wraps a statement prepared through the connection proxy.
///
/// The query text was annotated at prepare time and is not touched again.
/// The back-reference to the connection is weak: it is only consulted for
/// named-value checking and never keeps the connection alive.
pub struct StatementProxy {
    inner: Box<dyn Stmt>,
    conn: Weak<Mutex<Box<dyn Conn>>>,
    capabilities: StmtCapabilities,
}

impl StatementProxy {
    pub(crate) fn new(mut stmt: Box<dyn Stmt>, conn: Weak<Mutex<Box<dyn Conn>>>) -> Self {
        let capabilities = StmtCapabilities::of(stmt.as_mut());
        tracing::trace!(%capabilities, "wrapped statement");
        Self {
            inner: stmt,
            conn,
            capabilities,
        }
    }

    /// Capabilities of the wrapped statement, captured at wrap time.
    pub fn capabilities(&self) -> StmtCapabilities {
        self.capabilities
    }
}

impl fmt::Debug for StatementProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementProxy")
            .field("capabilities", &self.capabilities)
            .field("conn_alive", &(self.conn.strong_count() > 0))
            .finish_non_exhaustive()
    }
}

impl Stmt for StatementProxy {
    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn num_input(&self) -> Option<usize> {
        self.inner.num_input()
    }

    fn exec(&mut self, args: &[Value]) -> Result<ExecResult> {
        self.inner.exec(args)
    }

    fn query(&mut self, args: &[Value]) -> Result<Box<dyn Rows>> {
        self.inner.query(args)
    }

    fn as_exec_context(&mut self) -> Option<&mut dyn StmtExecContext> {
        Some(self)
    }

    fn as_query_context(&mut self) -> Option<&mut dyn StmtQueryContext> {
        Some(self)
    }

    fn as_column_converter(&self) -> Option<&dyn ColumnConverter> {
        Some(self)
    }

    fn as_named_value_checker(&mut self) -> Option<&mut dyn NamedValueChecker> {
        Some(self)
    }
}

impl StmtExecContext for StatementProxy {
    fn exec_context(&mut self, ctx: &Context, args: &[NamedValue]) -> Result<ExecResult> {
        match self.inner.as_exec_context() {
            Some(execer) => execer.exec_context(ctx, args),
            None => Err(skip("stmt.exec_context")),
        }
    }
}

impl StmtQueryContext for StatementProxy {
    fn query_context(&mut self, ctx: &Context, args: &[NamedValue]) -> Result<Box<dyn Rows>> {
        match self.inner.as_query_context() {
            Some(queryer) => queryer.query_context(ctx, args),
            None => Err(skip("stmt.query_context")),
        }
    }
}

impl ColumnConverter for StatementProxy {
    fn column_converter(&self, idx: usize) -> &dyn ValueConverter {
        match self.inner.as_column_converter() {
            Some(converter) => converter.column_converter(idx),
            None => &DEFAULT_PARAMETER_CONVERTER,
        }
    }
}

impl NamedValueChecker for StatementProxy {
    /// Statement checker, then the connection's, then default conversion.
    fn check_named_value(&mut self, nv: &mut NamedValue) -> Result<()> {
        if let Some(checker) = self.inner.as_named_value_checker() {
            return checker.check_named_value(nv);
        }
        if let Some(conn) = self.conn.upgrade() {
            let mut conn = conn.lock();
            if let Some(checker) = conn.as_named_value_checker() {
                return checker.check_named_value(nv);
            }
        }
        default_check_named_value(nv)
    }
}
