//! Configuration for annotation and statement logging.

use std::time::Duration;

/// Configuration options for an annotated driver.
///
/// The configuration is fixed when a driver name is first adopted; later
/// calls for the same name reuse the registered proxy as-is.
///
/// # Example
///
/// ```rust
/// use sql_annotator::AnnotatorConfig;
/// use std::time::Duration;
///
/// let config = AnnotatorConfig::default()
///     .with_statement_logging(true)
///     .with_slow_query_threshold(Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct AnnotatorConfig {
    /// Whether to emit a `DEBUG` event with every annotated statement.
    /// Default: `false` (statements may embed literals with sensitive data)
    pub log_statements: bool,

    /// Whether to resolve the calling function's name from a backtrace.
    /// When disabled, or when no symbol can be resolved, the function is
    /// rendered as `unknown` while file and line stay exact.
    /// Default: `true`
    pub resolve_function_names: bool,

    /// Calls to the underlying driver taking longer than this are logged at
    /// WARN level together with the annotation. `None` disables the check.
    /// Default: 500ms
    pub slow_query_threshold: Option<Duration>,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            log_statements: false,
            resolve_function_names: true,
            slow_query_threshold: Some(Duration::from_millis(500)),
        }
    }
}

impl AnnotatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the per-statement `DEBUG` event.
    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    /// Enable or disable function name resolution.
    ///
    /// Resolution captures and symbolises a backtrace the first time each
    /// call site is seen; disable it where `file:line` is enough.
    pub fn with_function_names(mut self, enabled: bool) -> Self {
        self.resolve_function_names = enabled;
        self
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = Some(threshold);
        self
    }

    pub fn without_slow_query_threshold(mut self) -> Self {
        self.slow_query_threshold = None;
        self
    }

    /// Log every statement and flag anything over 100ms.
    ///
    /// **Warning**: Do not use in production as it logs all SQL.
    pub fn development() -> Self {
        Self {
            log_statements: true,
            resolve_function_names: true,
            slow_query_threshold: Some(Duration::from_millis(100)),
        }
    }

    /// Only `file:line` in annotations, no statement logging, 1s slow threshold.
    pub fn production() -> Self {
        Self {
            log_statements: false,
            resolve_function_names: false,
            slow_query_threshold: Some(Duration::from_secs(1)),
        }
    }
}
