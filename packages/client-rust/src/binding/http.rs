//! HTTP binding. Publish only: HTTP has no server push.

use bindwire_core::Value;
use serde::Deserialize;

use super::common::{schema_literal, typed_binding};
use super::{Capabilities, CorrelationField, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::native::{HttpOptions, ProtocolOptions};

const KEY: &str = "http";
const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "CONNECT", "TRACE",
];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OperationBinding {
    method: Option<String>,
    query: Option<Value>,
}

/// HTTP adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpAdapter;

impl ProtocolAdapter for HttpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["http", "https"]
    }

    fn binding_key(&self) -> &'static str {
        KEY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            headers: true,
            correlation: CorrelationField::Header("X-Correlation-ID"),
            subscribe: false,
            wildcard: None,
        }
    }

    fn publish_options(&self, ctx: &OperationContext, _outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError> {
        let operation: OperationBinding = typed_binding(ctx.operation_bindings(), KEY)?;
        let method = operation
            .method
            .map_or_else(|| "POST".to_string(), |m| m.to_ascii_uppercase());
        if !METHODS.contains(&method.as_str()) {
            return Err(ClientError::invalid_binding(
                KEY,
                format!("unknown method `{method}`"),
            ));
        }

        let query = match operation.query.as_ref().and_then(|q| q.get("properties")) {
            Some(Value::Object(properties)) => properties
                .iter()
                .filter_map(|(name, schema)| {
                    let value = schema_literal(schema)
                        .or_else(|| schema.get("default").and_then(schema_literal))?;
                    Some((name.clone(), value))
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(ProtocolOptions::Http(HttpOptions { method, query }))
    }

    fn subscribe_options(&self, _ctx: &OperationContext) -> Result<ProtocolOptions, ClientError> {
        Err(ClientError::UnsupportedOperation {
            protocol: KEY.to_string(),
            operation: "subscribe",
        })
    }
}
