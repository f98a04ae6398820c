//! Read-only API document model.
//!
//! The client consumes an already-validated description through the
//! [`DocumentModel`] trait: given an operation id it needs the channel, the
//! candidate servers, the ordered candidate messages, and the binding
//! metadata of every scope. [`AsyncApiDocument`] is a serde model of an
//! AsyncAPI 3 style document with references pre-resolved to names.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::schema::SchemaRef;
use crate::types::{OrderedMap, Value};

/// Errors raised while resolving an operation against the document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("operation `{operation_id}` is not declared")]
    OperationNotFound { operation_id: String },
    #[error("operation `{operation_id}` references unknown channel `{channel}`")]
    ChannelNotFound { operation_id: String, channel: String },
    #[error("operation `{operation_id}` references unknown message `{message}`")]
    MessageNotFound { operation_id: String, message: String },
    #[error("channel `{channel}` references unknown server `{server}`")]
    ServerNotFound { channel: String, server: String },
    #[error("operation `{operation_id}` has no server to run on")]
    NoServers { operation_id: String },
    #[error("invalid `{protocol}` binding: {reason}")]
    InvalidBinding { protocol: String, reason: String },
    #[error("failed to parse document: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Protocol-tagged binding metadata for one scope (server, channel,
/// operation, or message). Opaque to everything except the protocol
/// adapter that owns the tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingSet(BTreeMap<String, Value>);

impl BindingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the binding for `protocol`.
    #[must_use]
    pub fn with(mut self, protocol: impl Into<String>, binding: Value) -> Self {
        self.0.insert(protocol.into(), binding);
        self
    }

    /// Raw binding object for `protocol`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, protocol: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(protocol))
            .map(|(_, v)| v)
    }

    /// Deserializes the binding for `protocol` into its typed form.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::InvalidBinding`] when the binding exists but
    /// does not fit `T`.
    pub fn typed<T: DeserializeOwned>(&self, protocol: &str) -> Result<Option<T>, DocumentError> {
        self.get(protocol)
            .map(|raw| {
                serde_json::from_value(raw.clone()).map_err(|e| DocumentError::InvalidBinding {
                    protocol: protocol.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Document objects
// ---------------------------------------------------------------------------

/// Whether an operation sends messages to the channel or receives from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    #[serde(alias = "publish")]
    Send,
    #[serde(alias = "subscribe")]
    Receive,
}

/// A reference written either as a bare name or as `{"$ref": "#/.../name"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference {
    Name(String),
    Ref {
        #[serde(rename = "$ref")]
        reference: String,
    },
}

impl Reference {
    /// The referenced component name (last pointer segment for `$ref`).
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Ref { reference } => reference.rsplit('/').next().unwrap_or(reference),
        }
    }
}

impl From<&str> for Reference {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A broker or endpoint the client can talk to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    /// Key under which the server is declared. Filled in on resolution.
    #[serde(skip)]
    pub name: String,
    pub host: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BindingSet::is_empty")]
    pub bindings: BindingSet,
}

/// Where a message's correlation id lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIdDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Runtime expression, e.g. `$message.header#/correlationId`.
    pub location: String,
}

/// One message shape an operation may carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDefinition {
    /// Message name; defaults to the key it is declared under.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationIdDefinition>,
    #[serde(default, skip_serializing_if = "BindingSet::is_empty")]
    pub bindings: BindingSet,
}

impl MessageDefinition {
    /// Payload schema in the message's declared schema format.
    #[must_use]
    pub fn payload_schema(&self) -> Option<SchemaRef<'_>> {
        self.payload.as_ref().map(|schema| SchemaRef {
            format: self.schema_format.as_deref(),
            schema,
        })
    }

    /// Headers are always described with JSON Schema.
    #[must_use]
    pub fn headers_schema(&self) -> Option<SchemaRef<'_>> {
        self.headers.as_ref().map(|schema| SchemaRef {
            format: None,
            schema,
        })
    }
}

/// A channel address parameter such as `userId` in `users/{userId}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    /// Runtime expression the value can be read from on outbound messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    /// Concrete address; `None` means the address is dynamic or unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub messages: OrderedMap<MessageDefinition>,
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub parameters: OrderedMap<ParameterDefinition>,
    /// Servers this channel is available on; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BindingSet::is_empty")]
    pub bindings: BindingSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDefinition {
    pub action: OperationAction,
    pub channel: Reference,
    /// Subset of the channel's messages; empty means all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "BindingSet::is_empty")]
    pub bindings: BindingSet,
}

/// Root document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncApiDocument {
    #[serde(default)]
    pub asyncapi: String,
    #[serde(default)]
    pub info: Info,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_content_type: Option<String>,
    #[serde(default)]
    pub servers: OrderedMap<ServerDefinition>,
    #[serde(default)]
    pub channels: OrderedMap<ChannelDefinition>,
    #[serde(default)]
    pub operations: OrderedMap<OperationDefinition>,
}

impl AsyncApiDocument {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Parse`] when the text is not a valid document.
    pub fn from_json(text: &str) -> Result<Self, DocumentError> {
        serde_json::from_str(text).map_err(|e| DocumentError::Parse(e.to_string()))
    }

    /// Builds a document from an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Parse`] when the value is not a valid document.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        serde_json::from_value(value).map_err(|e| DocumentError::Parse(e.to_string()))
    }

    fn servers_for(
        &self,
        channel_name: &str,
        channel: &ChannelDefinition,
    ) -> Result<Vec<Arc<ServerDefinition>>, DocumentError> {
        let named = |name: &str, server: &ServerDefinition| {
            let mut server = server.clone();
            server.name = name.to_string();
            Arc::new(server)
        };

        if channel.servers.is_empty() {
            return Ok(self.servers.iter().map(|(n, s)| named(n, s)).collect());
        }

        channel
            .servers
            .iter()
            .map(|reference| {
                let name = reference.name();
                self.servers
                    .get(name)
                    .map(|server| named(name, server))
                    .ok_or_else(|| DocumentError::ServerNotFound {
                        channel: channel_name.to_string(),
                        server: name.to_string(),
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Channel facts an operation needs at call time.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub name: String,
    pub address: Option<String>,
    pub parameters: OrderedMap<ParameterDefinition>,
    pub bindings: BindingSet,
}

/// Everything the client needs to run one operation.
#[derive(Debug, Clone)]
pub struct ResolvedOperation {
    pub operation_id: String,
    pub action: OperationAction,
    pub channel: ChannelDescriptor,
    /// Candidate servers in declaration order; never empty.
    pub servers: Vec<Arc<ServerDefinition>>,
    pub bindings: BindingSet,
    /// Candidate messages in declaration order.
    pub messages: Vec<Arc<MessageDefinition>>,
    pub default_content_type: Option<String>,
}

/// Read-only view over an API description.
pub trait DocumentModel: Send + Sync {
    /// Resolves an operation id to its channel, servers, and messages.
    ///
    /// # Errors
    ///
    /// Returns a [`DocumentError`] when the operation or anything it
    /// references is missing.
    fn resolve_operation(&self, operation_id: &str) -> Result<ResolvedOperation, DocumentError>;

    /// Every declared operation id.
    fn operation_ids(&self) -> Vec<String>;
}

impl DocumentModel for AsyncApiDocument {
    fn resolve_operation(&self, operation_id: &str) -> Result<ResolvedOperation, DocumentError> {
        let operation =
            self.operations
                .get(operation_id)
                .ok_or_else(|| DocumentError::OperationNotFound {
                    operation_id: operation_id.to_string(),
                })?;

        let channel_name = operation.channel.name();
        let channel =
            self.channels
                .get(channel_name)
                .ok_or_else(|| DocumentError::ChannelNotFound {
                    operation_id: operation_id.to_string(),
                    channel: channel_name.to_string(),
                })?;

        let with_name = |key: &str, message: &MessageDefinition| {
            let mut message = message.clone();
            if message.name.is_empty() {
                message.name = key.to_string();
            }
            Arc::new(message)
        };

        let messages = if operation.messages.is_empty() {
            channel
                .messages
                .iter()
                .map(|(key, m)| with_name(key, m))
                .collect()
        } else {
            operation
                .messages
                .iter()
                .map(|reference| {
                    let key = reference.name();
                    channel
                        .messages
                        .get(key)
                        .map(|m| with_name(key, m))
                        .ok_or_else(|| DocumentError::MessageNotFound {
                            operation_id: operation_id.to_string(),
                            message: key.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let servers = self.servers_for(channel_name, channel)?;
        if servers.is_empty() {
            return Err(DocumentError::NoServers {
                operation_id: operation_id.to_string(),
            });
        }

        Ok(ResolvedOperation {
            operation_id: operation_id.to_string(),
            action: operation.action,
            channel: ChannelDescriptor {
                name: channel_name.to_string(),
                address: channel.address.clone(),
                parameters: channel.parameters.clone(),
                bindings: channel.bindings.clone(),
            },
            servers,
            bindings: operation.bindings.clone(),
            messages,
            default_content_type: self.default_content_type.clone(),
        })
    }

    fn operation_ids(&self) -> Vec<String> {
        self.operations.keys().map(str::to_string).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
