//! Per-operation context handed to binding handlers.
//!
//! The facade resolves an operation against the document once and keeps the
//! result as a [`ContextTemplate`]. Each call then wraps the shared template
//! in an [`OperationContext`] together with its payload, headers, channel
//! parameters, and cancellation token. Handlers only read it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bindwire_core::{
    BindingSet, ChannelDescriptor, ExpressionCache, Headers, MessageDefinition, OperationAction,
    ResolvedOperation, ServerDefinition, Value,
};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::native::Endpoint;

/// Picks one server when an operation's channel is available on several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ServerSelector {
    /// First declared server whose protocol has a registered handler.
    #[default]
    Any,
    /// Server declared under this name.
    Name(String),
    /// First server speaking this protocol.
    Protocol(String),
}

impl fmt::Display for ServerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Name(name) => write!(f, "name:{name}"),
            Self::Protocol(protocol) => write!(f, "protocol:{protocol}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextTemplate
// ---------------------------------------------------------------------------

/// Call-independent part of an operation context, cached by the facade.
#[derive(Debug, Clone)]
pub struct ContextTemplate {
    pub operation_id: String,
    pub action: OperationAction,
    pub server: Arc<ServerDefinition>,
    pub channel: ChannelDescriptor,
    pub operation_bindings: BindingSet,
    /// Candidate messages in declaration order.
    pub messages: Vec<Arc<MessageDefinition>>,
    /// Content type used to decode inbound payloads.
    pub content_type: String,
    /// The document's `defaultContentType`, falling back to the configured default.
    pub default_content_type: String,
}

impl ContextTemplate {
    /// Builds a template for `server`, checking every runtime expression the
    /// operation declares.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Expression`] when a correlation-id or parameter
    /// location is malformed.
    pub fn build(
        resolved: ResolvedOperation,
        server: Arc<ServerDefinition>,
        config: &ClientConfig,
        expressions: &ExpressionCache,
    ) -> Result<Self, ClientError> {
        for message in &resolved.messages {
            if let Some(correlation) = &message.correlation_id {
                expressions.get_or_parse(&correlation.location)?;
            }
        }
        for (_, parameter) in resolved.channel.parameters.iter() {
            if let Some(location) = &parameter.location {
                expressions.get_or_parse(location)?;
            }
        }

        let default_content_type = resolved
            .default_content_type
            .clone()
            .unwrap_or_else(|| config.default_content_type.clone());
        let content_type = common_content_type(&resolved.messages)
            .unwrap_or_else(|| default_content_type.clone());

        Ok(Self {
            operation_id: resolved.operation_id,
            action: resolved.action,
            server,
            channel: resolved.channel,
            operation_bindings: resolved.bindings,
            messages: resolved.messages,
            content_type,
            default_content_type,
        })
    }

    /// Connection target for the selected server.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            protocol: self.server.protocol.clone(),
            protocol_version: self.server.protocol_version.clone(),
            host: self.server.host.clone(),
            pathname: self.server.pathname.clone(),
            bindings: self.server.bindings.clone(),
        }
    }

    /// Channel address with known parameters substituted.
    ///
    /// Explicit values win over declared defaults. Placeholders with neither
    /// are left in place for the handler to resolve.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Validation`] when a value is outside the
    /// parameter's declared `enum`.
    pub fn address(&self, parameters: &BTreeMap<String, String>) -> Result<String, ClientError> {
        let raw = self
            .channel
            .address
            .clone()
            .unwrap_or_else(|| self.channel.name.clone());

        let mut invalid = Vec::new();
        let substituted = substitute(&raw, |name| {
            let definition = self.channel.parameters.get(name);
            let value = parameters
                .get(name)
                .cloned()
                .or_else(|| definition.and_then(|d| d.default.clone()))?;
            if let Some(allowed) = definition.and_then(|d| d.allowed_values.as_ref()) {
                if !allowed.contains(&value) {
                    invalid.push(format!(
                        "parameter `{name}` must be one of [{}], got `{value}`",
                        allowed.join(", ")
                    ));
                }
            }
            Some(value)
        });

        if invalid.is_empty() {
            Ok(substituted)
        } else {
            Err(ClientError::Validation {
                message: self.channel.name.clone(),
                errors: invalid,
            })
        }
    }
}

/// The content type every candidate declares, if they agree.
fn common_content_type(messages: &[Arc<MessageDefinition>]) -> Option<String> {
    let mut declared = messages.iter().map(|m| m.content_type.as_deref());
    let first = declared.next()??;
    declared
        .all(|ct| ct == Some(first))
        .then(|| first.to_string())
}

/// Replaces `{name}` placeholders for which `lookup` returns a value.
pub(crate) fn substitute(address: &str, mut lookup: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(address.len());
    let mut rest = address;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|i| open + i) else {
            break;
        };
        out.push_str(&rest[..open]);
        let name = &rest[open + 1..close];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[open..=close]),
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Names of the `{name}` placeholders still present in `address`.
pub(crate) fn placeholders(address: &str) -> Vec<String> {
    let mut names = Vec::new();
    substitute(address, |name| {
        names.push(name.to_string());
        None
    });
    names
}

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Immutable per-call context.
#[derive(Debug, Clone)]
pub struct OperationContext {
    template: Arc<ContextTemplate>,
    address: String,
    payload: Option<Value>,
    headers: Headers,
    parameters: BTreeMap<String, String>,
    message_name: Option<String>,
    cancellation: CancellationToken,
}

impl OperationContext {
    /// Context for publishing `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Validation`] when a channel parameter value is
    /// not allowed.
    pub fn for_publish(
        template: Arc<ContextTemplate>,
        payload: Value,
        headers: Headers,
        parameters: BTreeMap<String, String>,
        message_name: Option<String>,
        cancellation: CancellationToken,
    ) -> Result<Self, ClientError> {
        let address = template.address(&parameters)?;
        Ok(Self {
            template,
            address,
            payload: Some(payload),
            headers,
            parameters,
            message_name,
            cancellation,
        })
    }

    /// Context for subscribing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Validation`] when a channel parameter value is
    /// not allowed.
    pub fn for_subscribe(
        template: Arc<ContextTemplate>,
        parameters: BTreeMap<String, String>,
        cancellation: CancellationToken,
    ) -> Result<Self, ClientError> {
        let address = template.address(&parameters)?;
        Ok(Self {
            template,
            address,
            payload: None,
            headers: Headers::new(),
            parameters,
            message_name: None,
            cancellation,
        })
    }

    #[must_use]
    pub fn template(&self) -> &Arc<ContextTemplate> {
        &self.template
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.template.operation_id
    }

    #[must_use]
    pub fn action(&self) -> OperationAction {
        self.template.action
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.template.server.protocol
    }

    #[must_use]
    pub fn protocol_version(&self) -> Option<&str> {
        self.template.server.protocol_version.as_deref()
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.template.server.host
    }

    #[must_use]
    pub fn pathname(&self) -> Option<&str> {
        self.template.server.pathname.as_deref()
    }

    #[must_use]
    pub fn channel_name(&self) -> &str {
        &self.template.channel.name
    }

    /// Channel address after parameter substitution; may still contain
    /// placeholders that had no value.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.template.content_type
    }

    #[must_use]
    pub fn default_content_type(&self) -> &str {
        &self.template.default_content_type
    }

    #[must_use]
    pub fn messages(&self) -> &[Arc<MessageDefinition>] {
        &self.template.messages
    }

    #[must_use]
    pub fn server_bindings(&self) -> &BindingSet {
        &self.template.server.bindings
    }

    #[must_use]
    pub fn channel_bindings(&self) -> &BindingSet {
        &self.template.channel.bindings
    }

    #[must_use]
    pub fn operation_bindings(&self) -> &BindingSet {
        &self.template.operation_bindings
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Explicitly requested message name, publish only.
    #[must_use]
    pub fn message_name(&self) -> Option<&str> {
        self.message_name.as_deref()
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

#[cfg(test)]
mod tests {
    use bindwire_core::{AsyncApiDocument, DocumentModel};
    use serde_json::json;

    use super::*;

    fn resolved() -> ResolvedOperation {
        AsyncApiDocument::from_value(json!({
            "servers": {"local": {"host": "localhost", "protocol": "mqtt"}},
            "channels": {
                "user": {
                    "address": "users/{userId}/{region}",
                    "parameters": {
                        "userId": {},
                        "region": {"default": "eu", "enum": ["eu", "us"]}
                    },
                    "messages": {
                        "A": {"contentType": "application/msgpack", "correlationId": {"location": "$message.header#/cid"}},
                        "B": {"contentType": "application/msgpack"}
                    }
                }
            },
            "operations": {"onUser": {"action": "receive", "channel": "user"}}
        }))
        .unwrap()
        .resolve_operation("onUser")
        .unwrap()
    }

    fn template() -> ContextTemplate {
        let resolved = resolved();
        let server = Arc::clone(&resolved.servers[0]);
        ContextTemplate::build(resolved, server, &ClientConfig::default(), &ExpressionCache::new())
            .unwrap()
    }

    #[test]
    fn substitutes_explicit_and_default_parameters() {
        let template = template();
        let params = BTreeMap::from([("userId".to_string(), "42".to_string())]);
        assert_eq!(template.address(&params).unwrap(), "users/42/eu");
        assert_eq!(template.address(&BTreeMap::new()).unwrap(), "users/{userId}/eu");
    }

    #[test]
    fn rejects_values_outside_enum() {
        let template = template();
        let params = BTreeMap::from([("region".to_string(), "mars".to_string())]);
        assert!(matches!(
            template.address(&params),
            Err(ClientError::Validation { .. })
        ));
    }

    #[test]
    fn content_type_agreed_by_all_candidates() {
        let template = template();
        assert_eq!(template.content_type, "application/msgpack");
        assert_eq!(template.default_content_type, "application/json");
    }

    #[test]
    fn malformed_correlation_expression_fails_at_build() {
        let mut resolved = resolved();
        let mut broken = (*resolved.messages[0]).clone();
        broken.correlation_id = Some(bindwire_core::CorrelationIdDefinition {
            description: None,
            location: "$request.header#/x".into(),
        });
        resolved.messages[0] = Arc::new(broken);
        let server = Arc::clone(&resolved.servers[0]);
        let err = ContextTemplate::build(resolved, server, &ClientConfig::default(), &ExpressionCache::new())
            .unwrap_err();
        assert!(matches!(err, ClientError::Expression(_)));
    }

    #[test]
    fn placeholder_scan() {
        assert_eq!(placeholders("a/{x}/b/{y}"), vec!["x", "y"]);
        assert!(placeholders("plain").is_empty());
        assert_eq!(substitute("open{", |_| Some("v".into())), "open{");
    }
}
