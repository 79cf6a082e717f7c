//! Statement classification for log fields.

use once_cell::sync::Lazy;
use regex::Regex;

// Leading block comments (annotations included) and line comments.
static LEADING_COMMENTS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?s)(?:\s*/\*.*?\*/|\s*--[^\n]*(?:\n|$))*\s*").unwrap());

static KEYWORD_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]+").unwrap());

/// Operation keyword of a statement, e.g. `"SELECT"`, for use as a log
/// field. Leading comments are skipped; unrecognised statements map to
/// `"QUERY"`.
pub fn operation(sql: &str) -> &'static str {
    let body = match LEADING_COMMENTS_REGEX.find(sql) {
        Some(comments) => &sql[comments.end()..],
        None => sql,
    };
    let Some(keyword) = KEYWORD_REGEX.find(body) else {
        return "QUERY";
    };

    match keyword.as_str().to_ascii_uppercase().as_str() {
        "SELECT" | "WITH" | "VALUES" => "SELECT",
        "INSERT" | "REPLACE" => "INSERT",
        "UPDATE" => "UPDATE",
        "DELETE" => "DELETE",
        "CREATE" => "CREATE",
        "DROP" => "DROP",
        "ALTER" => "ALTER",
        "TRUNCATE" => "TRUNCATE",
        "BEGIN" | "START" => "BEGIN",
        "COMMIT" => "COMMIT",
        "ROLLBACK" => "ROLLBACK",
        "SET" => "SET",
        _ => "QUERY",
    }
}
