//! Basic example showing how to use sql-annotator.
//!
//! Run with: cargo run --example basic
//!
//! The "database" here is an in-memory driver that prints every statement it
//! receives, so the annotations are visible without a real server.

use std::time::Duration;

use sql_annotator::driver::{ExecResult, ExecerContext, NamedValue, Pinger, Rows};
use sql_annotator::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Accepts every statement and prints what arrived.
#[derive(Debug, Default)]
struct EchoDriver;

impl Driver for EchoDriver {
    fn open(&self, dsn: &str) -> Result<Box<dyn Conn>> {
        tracing::info!(dsn, "echo: opened connection");
        Ok(Box::new(EchoConn))
    }
}

struct EchoConn;

impl Conn for EchoConn {
    fn prepare(&mut self, query: &str) -> Result<Box<dyn Stmt>> {
        println!("prepare  {query}");
        Ok(Box::new(EchoStmt))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin(&mut self) -> Result<Box<dyn sql_annotator::driver::Tx>> {
        Err(Error::Unsupported("transactions"))
    }

    fn as_pinger(&mut self) -> Option<&mut dyn Pinger> {
        Some(self)
    }

    fn as_execer_context(&mut self) -> Option<&mut dyn ExecerContext> {
        Some(self)
    }
}

impl Pinger for EchoConn {
    fn ping(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

impl ExecerContext for EchoConn {
    fn exec_context(&mut self, _ctx: &Context, query: &str, args: &[NamedValue]) -> Result<ExecResult> {
        println!("exec     {query}  ({} args)", args.len());
        Ok(ExecResult {
            last_insert_id: None,
            rows_affected: 1,
        })
    }
}

struct EchoStmt;

impl Stmt for EchoStmt {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn num_input(&self) -> Option<usize> {
        None
    }

    fn exec(&mut self, _args: &[Value]) -> Result<ExecResult> {
        Ok(ExecResult::default())
    }

    fn query(&mut self, _args: &[Value]) -> Result<Box<dyn Rows>> {
        Ok(Box::new(NoRows))
    }
}

struct NoRows;

impl Rows for NoRows {
    fn columns(&self) -> Vec<String> {
        vec!["id".to_string()]
    }

    fn next(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn purge_sessions(db: &Db) -> Result<()> {
    db.exec("DELETE FROM sessions WHERE expires_at < ?", &[Value::from(1_700_000_000i64)])?;
    Ok(())
}

fn load_users(db: &Db) -> Result<usize> {
    // EchoConn has no query capability, so this goes through prepare
    let rows = db.query("SELECT id FROM users", &[])?;
    Ok(rows.len())
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sql_annotator=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    sql_annotator::register("echo", Arc::new(EchoDriver))?;

    // Option 1: defaults
    let db = adopt("echo", "echo://memory")?;
    db.ping(&Context::new())?;
    purge_sessions(&db)?;
    let users = load_users(&db)?;
    tracing::info!(users, "loaded users");

    // Option 2: custom configuration, on a handle to the same annotated driver.
    // The configuration of the first adopt for a driver sticks.
    let config = AnnotatorConfig::development()
        .with_slow_query_threshold(Duration::from_millis(50));
    let again = sql_annotator::adopt_with_config("echo", "echo://memory", config)?;
    again.exec("UPDATE users SET active = ?", &[Value::from(true)])?;

    db.close()?;
    again.close()?;
    Ok(())
}
