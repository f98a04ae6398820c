//! Helpers shared by every protocol: binding lookup, content type, header
//! codec, destination parameters, and correlation ids.

use bindwire_core::{
    BindingSet, ExpressionCache, ExpressionSource, Headers, MessageDefinition, Value,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::context::{placeholders, substitute, OperationContext};
use crate::error::{binding_error, ClientError};

use super::HandlerServices;

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Typed binding for `key`, or `T::default()` when none is declared.
///
/// # Errors
///
/// Returns [`ClientError::InvalidBinding`] when the binding does not fit `T`.
pub fn typed_binding<T>(bindings: &BindingSet, key: &str) -> Result<T, ClientError>
where
    T: DeserializeOwned + Default,
{
    Ok(bindings
        .typed::<T>(key)
        .map_err(binding_error)?
        .unwrap_or_default())
}

/// A single field of the binding declared for `key`.
#[must_use]
pub fn binding_field<'a>(bindings: &'a BindingSet, key: &str, field: &str) -> Option<&'a Value> {
    bindings.get(key).and_then(|binding| binding.get(field))
}

/// Fixed value of a binding field that may be written either as a plain
/// scalar or as a schema pinning one value (`const`, or the first `enum`
/// entry).
#[must_use]
pub fn schema_literal(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(schema) => schema
            .get("const")
            .or_else(|| schema.get("enum").and_then(|e| e.get(0)))
            .and_then(schema_literal),
        _ => None,
    }
}

/// Outbound content type: message binding, then message, then document
/// default, then configured default.
#[must_use]
pub fn content_type_for(ctx: &OperationContext, message: &MessageDefinition, binding_key: &str) -> String {
    binding_field(&message.bindings, binding_key, "contentType")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| message.content_type.clone())
        .unwrap_or_else(|| ctx.default_content_type().to_string())
}

// ---------------------------------------------------------------------------
// Header codec
// ---------------------------------------------------------------------------

/// Strings travel as their UTF-8 bytes unless that text would itself read
/// back as JSON (`"1"`, `"true"`, `"null"`), in which case they are quoted.
/// Everything else is compact JSON.
#[must_use]
pub fn encode_header(value: &Value) -> Bytes {
    match value {
        Value::String(s) if serde_json::from_str::<Value>(s).is_err() => {
            Bytes::copy_from_slice(s.as_bytes())
        }
        other => Bytes::from(other.to_string()),
    }
}

/// Inverse of [`encode_header`]: JSON text is decoded, anything else is
/// kept as a string. Returns `None` for bytes that are not UTF-8.
#[must_use]
pub fn decode_header(raw: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(raw).ok()?;
    Some(serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

/// Serializes every header independently, keeping insertion order.
#[must_use]
pub fn encode_headers(headers: &Headers) -> Vec<(String, Bytes)> {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), encode_header(value)))
        .collect()
}

/// Decodes native headers; undecodable values are skipped.
#[must_use]
pub fn decode_headers(raw: &[(String, Bytes)]) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in raw {
        match decode_header(value) {
            Some(decoded) => {
                headers.insert(name.clone(), decoded);
            }
            None => debug!(header = %name, "dropping header that is not UTF-8"),
        }
    }
    headers
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

/// Which side of an operation a destination is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Publish,
    Subscribe,
}

/// Resolves the placeholders left in `raw`.
///
/// On publish a parameter's `location` expression is evaluated against the
/// outbound payload and headers. On subscribe an unresolved parameter
/// becomes `wildcard` when the protocol has one.
///
/// # Errors
///
/// Returns [`ClientError::MissingParameter`] for the first placeholder that
/// cannot be resolved.
pub fn resolve_destination(
    ctx: &OperationContext,
    raw: &str,
    direction: Direction,
    wildcard: Option<&str>,
    outbound: Option<(&Value, &Headers)>,
    expressions: &ExpressionCache,
) -> Result<String, ClientError> {
    let pending = placeholders(raw);
    if pending.is_empty() {
        return Ok(raw.to_string());
    }

    let parameters = &ctx.template().channel.parameters;
    let mut missing: Option<String> = None;
    let resolved = substitute(raw, |name| {
        let value = match direction {
            Direction::Publish => {
                let location = parameters.get(name).and_then(|p| p.location.as_deref());
                match (location, outbound) {
                    (Some(location), Some((payload, headers))) => expressions
                        .evaluate(location, payload, headers)
                        .ok()
                        .flatten(),
                    _ => None,
                }
            }
            Direction::Subscribe => wildcard.map(str::to_string),
        };
        if value.is_none() && missing.is_none() {
            missing = Some(name.to_string());
        }
        value
    });

    match missing {
        Some(parameter) => Err(ClientError::MissingParameter {
            channel: ctx.channel_name().to_string(),
            parameter,
        }),
        None => Ok(resolved),
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Evaluates the message's correlation-id descriptor for an outbound message.
///
/// A missing header-sourced id with a single-segment path is generated
/// (UUID v4) and written into `headers` when enabled. Header-sourced ids
/// resolve to `None` when the transport carries no headers.
///
/// # Errors
///
/// Returns [`ClientError::Expression`] when the descriptor is malformed.
pub fn outbound_correlation(
    message: &MessageDefinition,
    payload: &Value,
    headers: &mut Headers,
    services: &HandlerServices,
    headers_supported: bool,
) -> Result<Option<String>, ClientError> {
    let Some(descriptor) = &message.correlation_id else {
        return Ok(None);
    };
    let expression = services.expressions.get_or_parse(&descriptor.location)?;
    let from_header = expression.source() == ExpressionSource::Header;
    if from_header && !headers_supported {
        return Ok(None);
    }
    if let Some(value) = expression.evaluate(payload, headers) {
        return Ok(Some(value));
    }

    let generate = services.config.generate_correlation_ids && from_header;
    match expression.segments() {
        [name] if generate => {
            let id = uuid::Uuid::new_v4().to_string();
            debug!(message_name = %message.name, header = %name, "generated correlation id");
            headers.insert(name.clone(), Value::String(id.clone()));
            Ok(Some(id))
        }
        _ => Ok(None),
    }
}

/// Evaluates `raw` as a runtime expression when it looks like one,
/// otherwise returns it verbatim.
///
/// # Errors
///
/// Returns [`ClientError::Expression`] when an expression is malformed.
pub fn literal_or_expression(
    raw: &str,
    payload: &Value,
    headers: &Headers,
    expressions: &ExpressionCache,
) -> Result<Option<String>, ClientError> {
    if raw.trim_start().starts_with('$') {
        Ok(expressions.evaluate(raw, payload, headers)?)
    } else {
        Ok(Some(raw.to_string()))
    }
}
