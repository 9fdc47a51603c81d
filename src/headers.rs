//! The internal header map shared by every protocol.
//!
//! All four wire protocols normalize header names into a single form:
//! ASCII upper-case with `-` replaced by `_` (`Content-Type` becomes
//! `CONTENT_TYPE`). FastCGI delivers names this way already; the HTTP
//! parsers convert on insert. Insertion order is preserved and a name may
//! appear more than once.

use std::fmt;
use std::slice;

/// An ordered, multi-valued map of request or response headers.
#[derive(Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

/// Normalizes a wire header name into the internal form.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Renders an internal-form name back into its wire spelling
/// (`CONTENT_TYPE` becomes `Content-Type`).
pub fn camel_case_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = true;
    for c in key.chars() {
        if c == '_' {
            out.push('-');
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

impl Headers {
    pub fn new() -> Headers {
        Headers {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(cap: usize) -> Headers {
        Headers {
            entries: Vec::with_capacity(cap),
        }
    }

    /// Appends a header, normalizing the name.
    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((normalize_key(key), value.into()));
    }

    /// Appends a header whose name is already in the internal form.
    pub fn push_normalized(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Returns the first value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = normalize_key(key);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `key` in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> {
        let key = normalize_key(key);
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replaces every value of `key` with a single one.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = normalize_key(key);
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        let key = normalize_key(key);
        self.entries.retain(|(k, _)| *k != key);
    }

    pub fn iter(&self) -> slice::Iter<'_, (String, String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Parses the first `Content-Length` value, `-1` when absent or bad.
    pub fn content_length(&self) -> i64 {
        self.get("CONTENT_LENGTH")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v >= 0)
            .unwrap_or(-1)
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a (String, String);
    type IntoIter = slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_on_push() {
        let mut h = Headers::new();
        h.push("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.iter().next().unwrap().0, "CONTENT_TYPE");
    }

    #[test]
    fn preserves_order_and_duplicates() {
        let mut h = Headers::new();
        h.push("Accept", "text/html");
        h.push("X-One", "1");
        h.push("Accept", "application/json");
        let all: Vec<_> = h.get_all("accept").collect();
        assert_eq!(all, ["text/html", "application/json"]);
        assert_eq!(h.get("accept"), Some("text/html"));
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn set_collapses_values() {
        let mut h = Headers::new();
        h.push("Vary", "accept");
        h.push("Vary", "cookie");
        h.set("Vary", "*");
        let all: Vec<_> = h.get_all("VARY").collect();
        assert_eq!(all, ["*"]);
    }

    #[test]
    fn camel_case_round_trip() {
        assert_eq!(camel_case_key("CONTENT_TYPE"), "Content-Type");
        assert_eq!(camel_case_key("SEC_WEBSOCKET_ACCEPT"), "Sec-Websocket-Accept");
        assert_eq!(camel_case_key("HOST"), "Host");
        assert_eq!(normalize_key("Sec-WebSocket-Key"), "SEC_WEBSOCKET_KEY");
    }

    #[test]
    fn content_length_parsing() {
        let mut h = Headers::new();
        assert_eq!(h.content_length(), -1);
        h.push("Content-Length", "42");
        assert_eq!(h.content_length(), 42);
        let mut bad = Headers::new();
        bad.push("Content-Length", "nope");
        assert_eq!(bad.content_length(), -1);
    }
}
