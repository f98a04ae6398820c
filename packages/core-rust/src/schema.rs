//! Schema handlers: "validate this value against that schema".
//!
//! Schemas arrive pre-resolved from the document model (no `$ref` chasing).
//! [`SchemaRegistry`] routes a [`SchemaDefinition`] to the first
//! [`SchemaHandler`] that claims its format. [`JsonSchemaHandler`] covers the
//! JSON Schema keywords message payloads use in practice.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::serialization::essence;
use crate::types::Value;

/// Schema format assumed when a message does not declare one.
pub const DEFAULT_SCHEMA_FORMAT: &str = "application/schema+json;version=draft-07";

/// A schema together with the format it is written in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Schema format (media type). `None` means [`DEFAULT_SCHEMA_FORMAT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// The schema document itself.
    pub schema: Value,
}

impl SchemaDefinition {
    /// Wraps a JSON Schema in the default format.
    #[must_use]
    pub fn json(schema: Value) -> Self {
        Self {
            format: None,
            schema,
        }
    }

    #[must_use]
    pub fn format(&self) -> &str {
        self.format.as_deref().unwrap_or(DEFAULT_SCHEMA_FORMAT)
    }

    /// Borrowed view of this definition.
    #[must_use]
    pub fn view(&self) -> SchemaRef<'_> {
        SchemaRef {
            format: self.format.as_deref(),
            schema: &self.schema,
        }
    }
}

/// A schema borrowed from the document, with its format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchemaRef<'a> {
    pub format: Option<&'a str>,
    pub schema: &'a Value,
}

impl SchemaRef<'_> {
    #[must_use]
    pub fn format(&self) -> &str {
        self.format.unwrap_or(DEFAULT_SCHEMA_FORMAT)
    }
}

/// Result of validating a value against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// The value conforms to the schema.
    Valid,
    /// The value violates one or more schema constraints.
    Invalid {
        /// Human-readable descriptions of each validation failure.
        errors: Vec<String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    fn from_errors(errors: Vec<String>) -> Self {
        if errors.is_empty() {
            Self::Valid
        } else {
            Self::Invalid { errors }
        }
    }
}

/// Errors raised by the registry itself, not by validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("no schema handler registered for format `{format}`")]
    UnsupportedFormat { format: String },
}

/// Validates values against schemas of one or more formats.
pub trait SchemaHandler: Send + Sync + fmt::Debug {
    /// Whether this handler understands `format` (a media type).
    fn supports(&self, format: &str) -> bool;

    /// Validates `value` against `schema`.
    fn validate(&self, value: &Value, schema: &Value) -> ValidationResult;
}

// ---------------------------------------------------------------------------
// SchemaRegistry
// ---------------------------------------------------------------------------

/// Ordered collection of schema handlers.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    handlers: Vec<Arc<dyn SchemaHandler>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in [`JsonSchemaHandler`].
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(JsonSchemaHandler::new()));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn SchemaHandler>) {
        self.handlers.push(handler);
    }

    /// Validates `value` against `definition`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnsupportedFormat`] when no handler claims the
    /// definition's format.
    pub fn validate(
        &self,
        value: &Value,
        definition: &SchemaDefinition,
    ) -> Result<ValidationResult, SchemaError> {
        self.validate_ref(value, definition.view())
    }

    /// [`validate`](Self::validate) against a borrowed schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnsupportedFormat`] when no handler claims the
    /// schema's format.
    pub fn validate_ref(&self, value: &Value, schema: SchemaRef<'_>) -> Result<ValidationResult, SchemaError> {
        let format = schema.format();
        let handler = self
            .handlers
            .iter()
            .find(|h| h.supports(format))
            .ok_or_else(|| SchemaError::UnsupportedFormat {
                format: format.to_string(),
            })?;
        Ok(handler.validate(value, schema.schema))
    }

    /// Whether some handler understands `format`.
    #[must_use]
    pub fn supports(&self, format: &str) -> bool {
        self.handlers.iter().any(|h| h.supports(format))
    }
}

// ---------------------------------------------------------------------------
// JsonSchemaHandler
// ---------------------------------------------------------------------------

/// JSON Schema subset validator.
///
/// Supported keywords: `type`, `const`, `enum`, `properties`, `required`,
/// `additionalProperties`, `items`, `minItems`, `maxItems`, `minLength`,
/// `maxLength`, `pattern`, `minimum`, `maximum`, `exclusiveMinimum`,
/// `exclusiveMaximum`, `allOf`, `anyOf`, `oneOf`, `not`. Unknown keywords are
/// ignored, as JSON Schema requires.
#[derive(Debug, Default)]
pub struct JsonSchemaHandler {
    patterns: DashMap<String, Option<Regex>>,
}

impl JsonSchemaHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, value: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
        let rules = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                errors.push(format!("{}: schema `false` rejects every value", display_path(path)));
                return;
            }
            Value::Object(rules) => rules,
            _ => return,
        };

        if let Some(expected) = rules.get("type") {
            if !type_matches(value, expected) {
                errors.push(format!(
                    "{}: expected type {expected}, found {}",
                    display_path(path),
                    type_name(value)
                ));
                return;
            }
        }

        if let Some(expected) = rules.get("const") {
            if !json_eq(value, expected) {
                errors.push(format!("{}: expected const {expected}", display_path(path)));
            }
        }

        if let Some(Value::Array(options)) = rules.get("enum") {
            if !options.iter().any(|o| json_eq(value, o)) {
                errors.push(format!("{}: value is not one of the enumerated values", display_path(path)));
            }
        }

        match value {
            Value::Object(map) => self.check_object(map, rules, path, errors),
            Value::Array(items) => self.check_array(items, rules, path, errors),
            Value::String(s) => self.check_string(s, rules, path, errors),
            Value::Number(n) => {
                if let Some(n) = n.as_f64() {
                    check_number(n, rules, path, errors);
                }
            }
            Value::Null | Value::Bool(_) => {}
        }

        self.check_combinators(value, rules, path, errors);
    }

    fn check_object(
        &self,
        map: &serde_json::Map<String, Value>,
        rules: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        if let Some(Value::Array(required)) = rules.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(name) {
                    errors.push(format!("{}: missing required property `{name}`", display_path(path)));
                }
            }
        }

        let properties = rules.get("properties").and_then(Value::as_object);
        if let Some(properties) = properties {
            for (name, sub) in properties {
                if let Some(child) = map.get(name) {
                    self.check(child, sub, &format!("{path}/{name}"), errors);
                }
            }
        }

        if let Some(additional) = rules.get("additionalProperties") {
            for (name, child) in map {
                if properties.is_some_and(|p| p.contains_key(name)) {
                    continue;
                }
                match additional {
                    Value::Bool(false) => errors.push(format!(
                        "{}: additional property `{name}` is not allowed",
                        display_path(path)
                    )),
                    Value::Object(_) => self.check(child, additional, &format!("{path}/{name}"), errors),
                    _ => {}
                }
            }
        }
    }

    fn check_array(
        &self,
        items: &[Value],
        rules: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        if let Some(min) = rules.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                errors.push(format!("{}: expected at least {min} items", display_path(path)));
            }
        }
        if let Some(max) = rules.get("maxItems").and_then(Value::as_u64) {
            if (items.len() as u64) > max {
                errors.push(format!("{}: expected at most {max} items", display_path(path)));
            }
        }
        if let Some(item_schema) = rules.get("items") {
            for (index, item) in items.iter().enumerate() {
                self.check(item, item_schema, &format!("{path}/{index}"), errors);
            }
        }
    }

    fn check_string(
        &self,
        s: &str,
        rules: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let length = s.chars().count() as u64;
        if let Some(min) = rules.get("minLength").and_then(Value::as_u64) {
            if length < min {
                errors.push(format!("{}: shorter than {min} characters", display_path(path)));
            }
        }
        if let Some(max) = rules.get("maxLength").and_then(Value::as_u64) {
            if length > max {
                errors.push(format!("{}: longer than {max} characters", display_path(path)));
            }
        }
        if let Some(pattern) = rules.get("pattern").and_then(Value::as_str) {
            match self.compiled(pattern) {
                Some(re) if !re.is_match(s) => errors.push(format!(
                    "{}: does not match pattern `{pattern}`",
                    display_path(path)
                )),
                Some(_) => {}
                None => errors.push(format!("{}: invalid pattern `{pattern}`", display_path(path))),
            }
        }
    }

    fn check_combinators(
        &self,
        value: &Value,
        rules: &serde_json::Map<String, Value>,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        if let Some(Value::Array(all)) = rules.get("allOf") {
            for sub in all {
                self.check(value, sub, path, errors);
            }
        }
        if let Some(Value::Array(any)) = rules.get("anyOf") {
            if !any.iter().any(|sub| self.passes(value, sub, path)) {
                errors.push(format!("{}: no `anyOf` branch matched", display_path(path)));
            }
        }
        if let Some(Value::Array(one)) = rules.get("oneOf") {
            let passing = one.iter().filter(|sub| self.passes(value, sub, path)).count();
            if passing != 1 {
                errors.push(format!(
                    "{}: expected exactly one `oneOf` branch to match, {passing} matched",
                    display_path(path)
                ));
            }
        }
        if let Some(not) = rules.get("not") {
            if self.passes(value, not, path) {
                errors.push(format!("{}: value matches a `not` schema", display_path(path)));
            }
        }
    }

    fn passes(&self, value: &Value, schema: &Value, path: &str) -> bool {
        let mut scratch = Vec::new();
        self.check(value, schema, path, &mut scratch);
        scratch.is_empty()
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        if let Some(hit) = self.patterns.get(pattern) {
            return hit.value().clone();
        }
        let compiled = Regex::new(pattern).ok();
        self.patterns.insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

impl SchemaHandler for JsonSchemaHandler {
    fn supports(&self, format: &str) -> bool {
        let essence = essence(format);
        essence == "application/schema+json"
            || essence == "application/schema+yaml"
            || essence == "application/json"
            || essence.starts_with("application/vnd.aai.asyncapi")
    }

    fn validate(&self, value: &Value, schema: &Value) -> ValidationResult {
        let mut errors = Vec::new();
        self.check(value, schema, "", &mut errors);
        ValidationResult::from_errors(errors)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(value: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(value, name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(value, name)),
        _ => true,
    }
}

fn single_type_matches(value: &Value, name: &str) -> bool {
    match (name, value) {
        ("null", Value::Null)
        | ("boolean", Value::Bool(_))
        | ("number", Value::Number(_))
        | ("string", Value::String(_))
        | ("array", Value::Array(_))
        | ("object", Value::Object(_)) => true,
        ("integer", Value::Number(n)) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => false,
    }
}

/// Equality where `1` and `1.0` are the same number.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

fn check_number(n: f64, rules: &serde_json::Map<String, Value>, path: &str, errors: &mut Vec<String>) {
    if let Some(min) = rules.get("minimum").and_then(Value::as_f64) {
        if n < min {
            errors.push(format!("{}: {n} is below minimum {min}", display_path(path)));
        }
    }
    if let Some(max) = rules.get("maximum").and_then(Value::as_f64) {
        if n > max {
            errors.push(format!("{}: {n} is above maximum {max}", display_path(path)));
        }
    }
    if let Some(min) = rules.get("exclusiveMinimum").and_then(Value::as_f64) {
        if n <= min {
            errors.push(format!("{}: {n} is not above {min}", display_path(path)));
        }
    }
    if let Some(max) = rules.get("exclusiveMaximum").and_then(Value::as_f64) {
        if n >= max {
            errors.push(format!("{}: {n} is not below {max}", display_path(path)));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
