//! Runtime expressions: `$message.header#/a/b` and `$message.payload#/a`.
//!
//! A runtime expression names a location inside a message. The grammar is:
//!
//! ```text
//! expression = "$message" "." source "#" fragment
//! source     = "header" | "payload"
//! fragment   = "" | "/" | ( "/" segment )+
//! ```
//!
//! Fragment segments follow JSON pointer escaping (`~1` is `/`, `~0` is `~`).
//! Parsing is pure; [`ExpressionCache`] keeps one parsed copy per distinct
//! expression string so inbound hot paths never re-parse.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::types::{Headers, Value};

/// Root token every runtime expression starts with.
pub const ROOT_TOKEN: &str = "$message";

/// Errors raised while parsing a runtime expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("runtime expression is empty")]
    Empty,
    #[error("runtime expression `{expression}` must start with `$message.`")]
    MissingRoot { expression: String },
    #[error("runtime expression `{expression}` has unknown source `{segment}`, expected `header` or `payload`")]
    UnknownSource { expression: String, segment: String },
    #[error("runtime expression `{expression}` has no `#` fragment")]
    MissingFragment { expression: String },
    #[error("runtime expression `{expression}` has a fragment that does not start with `/`")]
    InvalidFragment { expression: String },
    #[error("runtime expression `{expression}` contains an invalid `~` escape")]
    InvalidEscape { expression: String },
}

/// Part of the message an expression reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpressionSource {
    Header,
    Payload,
}

impl fmt::Display for ExpressionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => f.write_str("header"),
            Self::Payload => f.write_str("payload"),
        }
    }
}

/// A parsed runtime expression. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeExpression {
    raw: String,
    source: ExpressionSource,
    segments: Vec<String>,
}

impl RuntimeExpression {
    /// Parses an expression string.
    ///
    /// # Errors
    ///
    /// Returns an [`ExpressionError`] when the string does not follow the
    /// `$message.{header|payload}#/path` grammar.
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let rest = trimmed
            .strip_prefix(ROOT_TOKEN)
            .and_then(|r| r.strip_prefix('.'))
            .ok_or_else(|| ExpressionError::MissingRoot {
                expression: trimmed.to_string(),
            })?;

        let (source_text, fragment) = match rest.split_once('#') {
            Some((s, f)) => (s, Some(f)),
            None => (rest, None),
        };

        let source = match source_text {
            "header" => ExpressionSource::Header,
            "payload" => ExpressionSource::Payload,
            other => {
                return Err(ExpressionError::UnknownSource {
                    expression: trimmed.to_string(),
                    segment: other.to_string(),
                })
            }
        };

        let fragment = fragment.ok_or_else(|| ExpressionError::MissingFragment {
            expression: trimmed.to_string(),
        })?;

        let segments = parse_fragment(fragment).map_err(|kind| match kind {
            FragmentError::NoLeadingSlash => ExpressionError::InvalidFragment {
                expression: trimmed.to_string(),
            },
            FragmentError::BadEscape => ExpressionError::InvalidEscape {
                expression: trimmed.to_string(),
            },
        })?;

        Ok(Self {
            raw: trimmed.to_string(),
            source,
            segments,
        })
    }

    /// The expression text as parsed.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn source(&self) -> ExpressionSource {
        self.source
    }

    /// Unescaped fragment segments. Empty when the whole source is selected.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Walks the fragment and returns the referenced value, if every segment
    /// resolves.
    #[must_use]
    pub fn resolve<'a>(&self, payload: &'a Value, headers: &'a Headers) -> Option<&'a Value> {
        match self.source {
            ExpressionSource::Payload => walk(payload, &self.segments),
            ExpressionSource::Header => {
                let (first, rest) = self.segments.split_first()?;
                walk(headers.get(first)?, rest)
            }
        }
    }

    /// Evaluates the expression to its string form.
    ///
    /// `None` means "no value": a segment did not resolve or the value is
    /// `null`. This is not an error; callers treat it as non-matching.
    #[must_use]
    pub fn evaluate(&self, payload: &Value, headers: &Headers) -> Option<String> {
        if self.source == ExpressionSource::Header && self.segments.is_empty() {
            if headers.is_empty() {
                return None;
            }
            return serde_json::to_string(headers).ok();
        }
        self.resolve(payload, headers).and_then(stringify)
    }
}

impl fmt::Display for RuntimeExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for RuntimeExpression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parses and evaluates `expression` in one step.
///
/// # Errors
///
/// Returns an [`ExpressionError`] when `expression` is malformed. An
/// unresolved path is `Ok(None)`, not an error.
pub fn evaluate(
    expression: &str,
    payload: &Value,
    headers: &Headers,
) -> Result<Option<String>, ExpressionError> {
    Ok(RuntimeExpression::parse(expression)?.evaluate(payload, headers))
}

// ---------------------------------------------------------------------------
// ExpressionCache
// ---------------------------------------------------------------------------

/// Concurrent cache of parsed expressions keyed by their literal text.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    parsed: DashMap<String, Arc<RuntimeExpression>>,
}

impl ExpressionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached parse of `expression`, parsing it on first use.
    ///
    /// Malformed expressions are not cached.
    ///
    /// # Errors
    ///
    /// Returns an [`ExpressionError`] when `expression` is malformed.
    pub fn get_or_parse(&self, expression: &str) -> Result<Arc<RuntimeExpression>, ExpressionError> {
        if let Some(hit) = self.parsed.get(expression) {
            return Ok(Arc::clone(hit.value()));
        }
        let parsed = Arc::new(RuntimeExpression::parse(expression)?);
        tracing::trace!(expression, "parsed runtime expression");
        let entry = self
            .parsed
            .entry(expression.to_string())
            .or_insert(parsed);
        Ok(Arc::clone(entry.value()))
    }

    /// Cached counterpart of [`evaluate`].
    ///
    /// # Errors
    ///
    /// Returns an [`ExpressionError`] when `expression` is malformed.
    pub fn evaluate(
        &self,
        expression: &str,
        payload: &Value,
        headers: &Headers,
    ) -> Result<Option<String>, ExpressionError> {
        Ok(self.get_or_parse(expression)?.evaluate(payload, headers))
    }

    /// Number of distinct expressions cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parsed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parsed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

enum FragmentError {
    NoLeadingSlash,
    BadEscape,
}

fn parse_fragment(fragment: &str) -> Result<Vec<String>, FragmentError> {
    if fragment.is_empty() || fragment == "/" {
        return Ok(Vec::new());
    }
    let body = fragment
        .strip_prefix('/')
        .ok_or(FragmentError::NoLeadingSlash)?;
    body.split('/').map(unescape_segment).collect()
}

fn unescape_segment(segment: &str) -> Result<String, FragmentError> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return Err(FragmentError::BadEscape),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn walk<'a>(mut current: &'a Value, segments: &[String]) -> Option<&'a Value> {
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => {
            Some(value.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn headers(value: Value) -> Headers {
        match value {
            Value::Object(map) => map,
            _ => panic!("headers must be an object"),
        }
    }

    #[test]
    fn parses_header_expression() {
        let expr = RuntimeExpression::parse("$message.header#/a/b").unwrap();
        assert_eq!(expr.source(), ExpressionSource::Header);
        assert_eq!(expr.segments(), ["a".to_string(), "b".to_string()]);
        assert_eq!(expr.to_string(), "$message.header#/a/b");
    }

    #[test]
    fn parses_escaped_segments() {
        let expr = RuntimeExpression::parse("$message.payload#/a~1b/c~0d").unwrap();
        assert_eq!(expr.segments(), ["a/b".to_string(), "c~d".to_string()]);
    }

    #[test]
    fn rejects_missing_root() {
        let err = RuntimeExpression::parse("$msg.header#/a").unwrap_err();
        assert!(matches!(err, ExpressionError::MissingRoot { .. }));
        let err = RuntimeExpression::parse("header#/a").unwrap_err();
        assert!(matches!(err, ExpressionError::MissingRoot { .. }));
    }

    #[test]
    fn rejects_unknown_source() {
        let err = RuntimeExpression::parse("$message.body#/a").unwrap_err();
        assert!(matches!(
            err,
            ExpressionError::UnknownSource { segment, .. } if segment == "body"
        ));
    }

    #[test]
    fn rejects_missing_fragment_and_bad_fragment() {
        assert!(matches!(
            RuntimeExpression::parse("$message.payload").unwrap_err(),
            ExpressionError::MissingFragment { .. }
        ));
        assert!(matches!(
            RuntimeExpression::parse("$message.payload#a").unwrap_err(),
            ExpressionError::InvalidFragment { .. }
        ));
        assert!(matches!(
            RuntimeExpression::parse("$message.payload#/a~2").unwrap_err(),
            ExpressionError::InvalidEscape { .. }
        ));
        assert_eq!(RuntimeExpression::parse("  ").unwrap_err(), ExpressionError::Empty);
    }

    #[test]
    fn evaluates_nested_header() {
        let h = headers(json!({"a": {"b": "v"}}));
        let value = evaluate("$message.header#/a/b", &Value::Null, &h).unwrap();
        assert_eq!(value.as_deref(), Some("v"));
    }

    #[test]
    fn missing_segment_is_no_value_not_error() {
        let h = headers(json!({"a": {}}));
        let value = evaluate("$message.header#/a/b", &Value::Null, &h).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn evaluates_payload_scalars_and_arrays() {
        let payload = json!({"id": 42, "ok": true, "items": [{"n": "first"}], "none": null});
        let empty = Headers::new();
        assert_eq!(evaluate("$message.payload#/id", &payload, &empty).unwrap().as_deref(), Some("42"));
        assert_eq!(evaluate("$message.payload#/ok", &payload, &empty).unwrap().as_deref(), Some("true"));
        assert_eq!(
            evaluate("$message.payload#/items/0/n", &payload, &empty).unwrap().as_deref(),
            Some("first")
        );
        assert_eq!(evaluate("$message.payload#/items/7/n", &payload, &empty).unwrap(), None);
        assert_eq!(evaluate("$message.payload#/none", &payload, &empty).unwrap(), None);
        assert_eq!(evaluate("$message.payload#/id/deeper", &payload, &empty).unwrap(), None);
    }

    #[test]
    fn empty_fragment_selects_whole_source() {
        let payload = json!({"x": 1});
        let value = evaluate("$message.payload#", &payload, &Headers::new()).unwrap();
        assert_eq!(value.as_deref(), Some(r#"{"x":1}"#));
    }

    #[test]
    fn cache_parses_once_per_string() {
        let cache = ExpressionCache::new();
        let a = cache.get_or_parse("$message.payload#/id").unwrap();
        let b = cache.get_or_parse("$message.payload#/id").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        assert!(cache.get_or_parse("nope").is_err());
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn header_path_resolves_nested_value(
            a in "[a-zA-Z0-9_]{1,12}",
            b in "[a-zA-Z0-9_]{1,12}",
            v in "[ -~]{0,24}",
        ) {
            let expr = format!("$message.header#/{a}/{b}");
            let mut inner = serde_json::Map::new();
            inner.insert(b.clone(), Value::String(v.clone()));
            let mut h = Headers::new();
            h.insert(a.clone(), Value::Object(inner));
            prop_assert_eq!(evaluate(&expr, &Value::Null, &h).unwrap(), Some(v));

            let mut empty_inner = Headers::new();
            empty_inner.insert(a, Value::Object(serde_json::Map::new()));
            prop_assert_eq!(evaluate(&expr, &Value::Null, &empty_inner).unwrap(), None);
        }

        #[test]
        fn parsing_is_deterministic(path in "(/[a-z]{1,6}){0,4}") {
            let expr = format!("$message.payload#{path}");
            let first = RuntimeExpression::parse(&expr).unwrap();
            let second = RuntimeExpression::parse(&expr).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
