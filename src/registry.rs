//! Registration of annotating drivers.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::AnnotatorConfig;
use crate::db::{Db, DriverTable};
use crate::error::{Error, Result};
use crate::proxy::DriverProxy;

/// Suffix of the name the annotating driver is registered under.
pub const DRIVER_SUFFIX: &str = ":annotator";

static GLOBAL_REGISTRY: Lazy<Registry> =
    Lazy::new(|| Registry::new(DriverTable::global().clone()));

/// Name of the annotating driver wrapping `driver_name`.
pub fn annotated_name(driver_name: &str) -> String {
    format!("{driver_name}{DRIVER_SUFFIX}")
}

/// Tracks which drivers already have an annotating counterpart.
///
/// Registration is idempotent and serialized: concurrent callers for the same
/// name open exactly one probe connection between them.
#[derive(Debug)]
pub struct Registry {
    drivers: Arc<DriverTable>,
    registered: Mutex<HashMap<String, bool>>,
}

impl Registry {
    /// A registry over `drivers`, isolated from the process-wide one.
    pub fn new(drivers: Arc<DriverTable>) -> Self {
        Self {
            drivers,
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static Registry {
        &GLOBAL_REGISTRY
    }

    pub fn drivers(&self) -> &Arc<DriverTable> {
        &self.drivers
    }

    pub fn is_registered(&self, driver_name: &str) -> bool {
        self.registered
            .lock()
            .get(driver_name)
            .copied()
            .unwrap_or(false)
    }

    pub fn ensure_registered(&self, driver_name: &str, dsn: &str) -> Result<()> {
        self.ensure_registered_with(driver_name, dsn, AnnotatorConfig::default())
    }

    /// Register `<driver_name>:annotator` unless already done.
    ///
    /// A probe connection is opened through the raw driver first; its error
    /// is returned as-is and leaves the name unregistered. The config of the
    /// first successful registration sticks.
    pub fn ensure_registered_with(
        &self,
        driver_name: &str,
        dsn: &str,
        config: AnnotatorConfig,
    ) -> Result<()> {
        let mut registered = self.registered.lock();
        if registered.get(driver_name).copied().unwrap_or(false) {
            tracing::debug!(driver = driver_name, "annotating driver already registered");
            return Ok(());
        }

        let driver = self
            .drivers
            .lookup(driver_name)
            .ok_or_else(|| Error::UnknownDriver(driver_name.to_string()))?;
        let mut probe = driver.open(dsn)?;

        let name = annotated_name(driver_name);
        let proxy = DriverProxy::new(driver, driver_name, config);
        let result = self.drivers.register(name.as_str(), Arc::new(proxy));
        if result.is_ok() {
            registered.insert(driver_name.to_string(), true);
            tracing::info!(driver = driver_name, annotated = %name, "registered annotating driver");
        }

        if let Err(err) = probe.close() {
            tracing::warn!(driver = driver_name, error = %err, "closing probe connection failed");
        }
        result
    }

    /// Ensure the annotating driver exists and open a handle through it.
    pub fn adopt(&self, driver_name: &str, dsn: &str) -> Result<Db> {
        self.adopt_with_config(driver_name, dsn, AnnotatorConfig::default())
    }

    pub fn adopt_with_config(
        &self,
        driver_name: &str,
        dsn: &str,
        config: AnnotatorConfig,
    ) -> Result<Db> {
        self.ensure_registered_with(driver_name, dsn, config)?;
        Db::open_in(&self.drivers, &annotated_name(driver_name), dsn)
    }
}

/// Open `dsn` through an annotating wrapper of the registered driver
/// `driver_name`. Every query sent through the returned handle carries a
/// comment naming the code that issued it.
///
/// ```rust,ignore
/// let db = sql_annotator::adopt("postgres", "postgres://localhost/app")?;
/// // delivered as "/* app::purge (src/app.rs:40) */ DELETE FROM sessions"
/// db.exec("DELETE FROM sessions", &[])?;
/// ```
pub fn adopt(driver_name: &str, dsn: &str) -> Result<Db> {
    Registry::global().adopt(driver_name, dsn)
}

pub fn adopt_with_config(driver_name: &str, dsn: &str, config: AnnotatorConfig) -> Result<Db> {
    Registry::global().adopt_with_config(driver_name, dsn, config)
}
