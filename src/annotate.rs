//! Caller annotation: `/* <function> (<file>:<line>) */ <query>`.
//!
//! File and line come from [`Location::caller`], propagated through
//! `#[track_caller]` from the outermost public entry point. Calls that reach
//! the proxy through a `dyn Conn` lose that propagation, so the host layer
//! records its own entry point with [`CallSite::enter`] for the duration of
//! the call and the annotator prefers it.
//!
//! The function name is not known to `Location`; it is resolved by matching
//! the `file:line` against a captured backtrace.

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;

/// Rendered when the function name cannot be resolved.
pub const UNKNOWN_FUNCTION: &str = "unknown";

static ANNOTATION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^/\* (.*?) \(([^()]*):(\d+)\) \*/ (.*)$").unwrap()
});

static FRAME_SYMBOL_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+:\s+(.+?)\s*$").unwrap());

static FRAME_LOCATION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*at\s+(.+):(\d+):\d+\s*$").unwrap());

static SYMBOL_HASH_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"::h[0-9a-f]{16}$").unwrap());

// Resolved names by call site. A call site always belongs to the same
// function, so misses are cached too.
static FUNCTION_NAMES: Lazy<RwLock<HashMap<(&'static str, u32), Option<String>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

thread_local! {
    static ENTRY_POINT: Cell<Option<&'static Location<'static>>> = const { Cell::new(None) };
}

/// Marks the call site of a public entry point for the current thread.
///
/// The outermost guard wins, so entry points calling other entry points keep
/// the application's location. Dropping the outermost guard clears it.
#[must_use = "the call site is only recorded while the guard is alive"]
pub struct CallSite {
    outermost: bool,
    // Bound to the thread that recorded the location.
    _not_send: PhantomData<*const ()>,
}

impl CallSite {
    #[track_caller]
    pub fn enter() -> Self {
        let location = Location::caller();
        let outermost = ENTRY_POINT.with(|entry| {
            if entry.get().is_some() {
                return false;
            }
            entry.set(Some(location));
            true
        });
        Self {
            outermost,
            _not_send: PhantomData,
        }
    }

    /// The location recorded by the active outermost guard on this thread.
    pub fn current() -> Option<&'static Location<'static>> {
        ENTRY_POINT.with(Cell::get)
    }
}

impl Drop for CallSite {
    fn drop(&mut self) {
        if self.outermost {
            ENTRY_POINT.with(|entry| entry.set(None));
        }
    }
}

/// The code that issued a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl Caller {
    /// Capture the caller above the public entry point.
    #[track_caller]
    pub fn capture(resolve_function: bool) -> Self {
        let location = match CallSite::current() {
            Some(location) => location,
            None => Location::caller(),
        };
        let function = if resolve_function {
            cached_function_name(location.file(), location.line())
        } else {
            None
        };
        Self {
            function: function.unwrap_or_else(|| UNKNOWN_FUNCTION.to_string()),
            file: location.file().to_string(),
            line: location.line(),
        }
    }

    /// Prefix `query` with this caller. `query` is reproduced byte-for-byte.
    pub fn annotate(&self, query: &str) -> String {
        format!("/* {self} */ {query}")
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.function, self.file, self.line)
    }
}

/// Annotate `query` with the calling function, file and line.
#[track_caller]
pub fn annotate(query: &str) -> String {
    Caller::capture(true).annotate(query)
}

/// Split an annotated query into its caller and the query text it wraps.
///
/// Returns `None` when `text` does not start with an annotation.
pub fn parse(text: &str) -> Option<(Caller, &str)> {
    let caps = ANNOTATION_REGEX.captures(text)?;
    let line = caps.get(3)?.as_str().parse().ok()?;
    let caller = Caller {
        function: caps.get(1)?.as_str().to_string(),
        file: caps.get(2)?.as_str().to_string(),
        line,
    };
    Some((caller, caps.get(4)?.as_str()))
}

/// Strip a leading annotation, if any.
pub fn strip(text: &str) -> &str {
    parse(text).map_or(text, |(_, query)| query)
}

/// Function name for a call site, resolving each site once per process.
fn cached_function_name(file: &'static str, line: u32) -> Option<String> {
    if let Some(function) = FUNCTION_NAMES.read().get(&(file, line)) {
        return function.clone();
    }
    let function = resolve_function_name(file, line);
    FUNCTION_NAMES
        .write()
        .entry((file, line))
        .or_insert(function)
        .clone()
}

/// Find the symbol of the frame executing at `file:line`.
///
/// An exact line match is preferred; otherwise the innermost frame in `file`
/// is used (multi-line call expressions may report a different line).
fn resolve_function_name(file: &str, line: u32) -> Option<String> {
    let trace = Backtrace::force_capture().to_string();
    let mut symbol: Option<&str> = None;
    let mut same_file: Option<&str> = None;

    for text in trace.lines() {
        if let Some(caps) = FRAME_SYMBOL_REGEX.captures(text) {
            symbol = caps.get(1).map(|m| m.as_str());
            continue;
        }
        let Some(caps) = FRAME_LOCATION_REGEX.captures(text) else {
            continue;
        };
        let (Some(frame_file), Some(frame_line)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if !same_path(frame_file.as_str(), file) {
            continue;
        }
        if frame_line.as_str().parse::<u32>().ok() == Some(line) {
            return symbol.map(clean_symbol);
        }
        if same_file.is_none() && !symbol.is_some_and(is_annotator_frame) {
            same_file = symbol;
        }
    }

    same_file.map(clean_symbol)
}

fn same_path(frame_file: &str, file: &str) -> bool {
    let frame_file = frame_file.replace('\\', "/");
    let file = file.replace('\\', "/");
    let file = file.trim_start_matches("./");
    frame_file == file || frame_file.ends_with(&format!("/{file}"))
}

/// Frames of this crate's own machinery (proxies, host layer), not of the
/// code being attributed. Unit tests inside the crate count as callers.
fn is_annotator_frame(symbol: &str) -> bool {
    let crate_name = module_path!().split("::").next().unwrap_or_default();
    symbol
        .trim_start_matches('<')
        .strip_prefix(crate_name)
        .and_then(|rest| rest.strip_prefix("::"))
        .is_some_and(|rest| !rest.contains("tests::"))
}

fn clean_symbol(symbol: &str) -> String {
    SYMBOL_HASH_REGEX.replace(symbol, "").into_owned()
}
