//! WebSocket binding.
//!
//! The channel binding describes the handshake (`method`, `query`,
//! `headers`); messages themselves are bare frames, so headers and
//! correlation ids have nowhere to go. Payloads whose content type is not
//! textual are sent as binary frames.

use bindwire_core::{serialization::essence, Value};
use serde::Deserialize;

use super::common::{content_type_for, schema_literal, typed_binding};
use super::{Capabilities, CorrelationField, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::native::{ProtocolOptions, WebSocketOptions};

const KEY: &str = "ws";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChannelBinding {
    method: Option<String>,
    query: Option<Value>,
    headers: Option<Value>,
}

/// Fixed name/value pairs from a binding object, either a plain map or a
/// schema whose properties pin their values.
fn pairs(value: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(object)) = value else {
        return Vec::new();
    };
    let fields = match object.get("properties") {
        Some(Value::Object(properties)) => properties,
        _ => object,
    };
    fields
        .iter()
        .filter_map(|(name, field)| {
            let value = schema_literal(field)
                .or_else(|| field.get("default").and_then(schema_literal))?;
            Some((name.clone(), value))
        })
        .collect()
}

fn is_textual(content_type: &str) -> bool {
    let essence = essence(content_type);
    essence.starts_with("text/") || essence == "application/json" || essence.ends_with("+json")
}

/// WebSocket adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketAdapter;

impl WebSocketAdapter {
    fn handshake(ctx: &OperationContext) -> Result<WebSocketOptions, ClientError> {
        let channel: ChannelBinding = typed_binding(ctx.channel_bindings(), KEY)?;
        let method = channel.method.unwrap_or_else(|| "GET".to_string()).to_ascii_uppercase();
        if method != "GET" && method != "POST" {
            return Err(ClientError::invalid_binding(
                KEY,
                format!("method must be GET or POST, got `{method}`"),
            ));
        }
        Ok(WebSocketOptions {
            method,
            query: pairs(channel.query.as_ref()),
            headers: pairs(channel.headers.as_ref()),
            binary: false,
        })
    }
}

impl ProtocolAdapter for WebSocketAdapter {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["ws", "wss"]
    }

    fn binding_key(&self) -> &'static str {
        KEY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            headers: false,
            correlation: CorrelationField::Unsupported,
            subscribe: true,
            wildcard: None,
        }
    }

    fn publish_options(&self, ctx: &OperationContext, outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError> {
        let mut options = Self::handshake(ctx)?;
        options.binary = !is_textual(&content_type_for(ctx, outbound.message, KEY));
        Ok(ProtocolOptions::WebSocket(options))
    }

    fn subscribe_options(&self, ctx: &OperationContext) -> Result<ProtocolOptions, ClientError> {
        Ok(ProtocolOptions::WebSocket(Self::handshake(ctx)?))
    }
}
