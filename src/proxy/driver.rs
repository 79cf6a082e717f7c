//! Driver wrapper registered under `<name>:annotator`.

use std::fmt;
use std::sync::Arc;

use super::ConnectionProxy;
use crate::config::AnnotatorConfig;
use crate::driver::{Conn, Driver};
use crate::error::Result;

/// Opens connections through the wrapped driver and wraps each one in a
/// [`ConnectionProxy`].
pub struct DriverProxy {
    driver: Arc<dyn Driver>,
    base_name: String,
    config: Arc<AnnotatorConfig>,
}

impl DriverProxy {
    pub fn new(driver: Arc<dyn Driver>, base_name: impl Into<String>, config: AnnotatorConfig) -> Self {
        Self {
            driver,
            base_name: base_name.into(),
            config: Arc::new(config),
        }
    }

    /// Name of the wrapped driver.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn config(&self) -> &AnnotatorConfig {
        &self.config
    }
}

impl fmt::Debug for DriverProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverProxy")
            .field("base_name", &self.base_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Driver for DriverProxy {
    fn open(&self, dsn: &str) -> Result<Box<dyn Conn>> {
        let conn = self.driver.open(dsn)?;
        tracing::debug!(driver = %self.base_name, "opened annotated connection");
        Ok(Box::new(ConnectionProxy::new(conn, self.config.clone())))
    }
}
