//! Protocol binding handlers.
//!
//! [`BindingHandler`] is the single capability every protocol exposes to the
//! registry. Protocols are thin [`ProtocolAdapter`]s that map binding
//! metadata onto native options; the shared
//! [`ProtocolBindingHandler`](handler::ProtocolBindingHandler) owns
//! connection reuse, the subscription slots, and the envelope pipeline.

pub mod amqp;
pub mod common;
pub mod handler;
pub mod http;
pub mod kafka;
pub mod mqtt;
pub mod nats;
pub mod redis;
pub mod state;
pub mod stomp;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use async_trait::async_trait;
use bindwire_core::{ExpressionCache, Headers, MessageDefinition, SchemaRegistry, SerializerProvider, Value};

pub use amqp::AmqpAdapter;
pub use handler::ProtocolBindingHandler;
pub use http::HttpAdapter;
pub use kafka::KafkaAdapter;
pub use mqtt::MqttAdapter;
pub use nats::NatsAdapter;
pub use redis::RedisAdapter;
pub use stomp::StompAdapter;
pub use websocket::WebSocketAdapter;

use crate::config::ClientConfig;
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::message::PublishReceipt;
use crate::native::{NativeConnector, ProtocolOptions};
use crate::subscription::SharedSubscription;

// ---------------------------------------------------------------------------
// HandlerServices
// ---------------------------------------------------------------------------

/// Collaborators shared by every handler of one client.
#[derive(Debug, Clone)]
pub struct HandlerServices {
    pub config: Arc<ClientConfig>,
    pub serializers: Arc<SerializerProvider>,
    pub schemas: Arc<SchemaRegistry>,
    pub expressions: Arc<ExpressionCache>,
}

impl HandlerServices {
    #[must_use]
    pub fn new(
        config: ClientConfig,
        serializers: SerializerProvider,
        schemas: SchemaRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            serializers: Arc::new(serializers),
            schemas: Arc::new(schemas),
            expressions: Arc::new(ExpressionCache::new()),
        }
    }
}

impl Default for HandlerServices {
    fn default() -> Self {
        Self::new(
            ClientConfig::default(),
            SerializerProvider::with_defaults(),
            SchemaRegistry::with_defaults(),
        )
    }
}

// ---------------------------------------------------------------------------
// BindingHandler trait
// ---------------------------------------------------------------------------

/// One protocol's publish/subscribe capability.
#[async_trait]
pub trait BindingHandler: Send + Sync {
    /// Name used in logs and registry lookups (e.g. `"kafka"`).
    fn name(&self) -> &'static str;

    /// Protocol names this handler claims, lowercase.
    fn protocols(&self) -> &'static [&'static str];

    /// Case-insensitive protocol match; the version check is advisory.
    fn supports(&self, protocol: &str, version: Option<&str>) -> bool;

    /// Builds an envelope from the context and sends it.
    ///
    /// # Errors
    ///
    /// Native failures come back as [`ClientError::Connection`]; the other
    /// variants describe bad input or bad binding metadata.
    async fn publish(&self, ctx: &OperationContext) -> Result<PublishReceipt, ClientError>;

    /// Returns the shared subscription for the context's operation, opening
    /// the native consumer on first use.
    ///
    /// # Errors
    ///
    /// Returns an error when connecting or opening the consumer fails, times
    /// out, or is cancelled.
    async fn subscribe(&self, ctx: &OperationContext) -> Result<Arc<SharedSubscription>, ClientError>;

    /// Closes every subscription and connection. Idempotent.
    async fn dispose(&self);
}

// ---------------------------------------------------------------------------
// ProtocolAdapter trait
// ---------------------------------------------------------------------------

/// Where a protocol carries the correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationField {
    /// Written as a message header with this name.
    Header(&'static str),
    /// Written to the envelope's native correlation field.
    Native,
    /// The protocol has nowhere to put it.
    Unsupported,
}

/// Static facts about a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The transport carries message headers.
    pub headers: bool,
    pub correlation: CorrelationField,
    /// The transport can push messages to a subscriber.
    pub subscribe: bool,
    /// Single-level wildcard substituted for unresolved channel parameters
    /// on subscribe.
    pub wildcard: Option<&'static str>,
}

/// Maps binding metadata onto one protocol's native options.
pub trait ProtocolAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn protocols(&self) -> &'static [&'static str];

    /// Key this protocol's bindings are declared under in the document.
    fn binding_key(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Advisory version check.
    fn supports_version(&self, _version: Option<&str>) -> bool {
        true
    }

    /// Destination before parameter resolution. Defaults to the channel
    /// address.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidBinding`] for malformed channel bindings.
    fn destination(&self, ctx: &OperationContext) -> Result<String, ClientError> {
        Ok(ctx.address().to_string())
    }

    /// Native send options.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidBinding`] for malformed bindings.
    fn publish_options(&self, ctx: &OperationContext, outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError>;

    /// Native consumer options.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidBinding`] for malformed bindings.
    fn subscribe_options(&self, ctx: &OperationContext) -> Result<ProtocolOptions, ClientError>;
}

/// Outbound message facts available to an adapter while building options.
#[derive(Debug)]
pub struct Outbound<'a> {
    pub message: &'a MessageDefinition,
    pub payload: &'a Value,
    pub headers: &'a Headers,
    pub services: &'a HandlerServices,
}

/// Handlers for every built-in protocol, all sharing one connector.
#[must_use]
pub fn standard_handlers(
    connector: &Arc<dyn NativeConnector>,
    services: &HandlerServices,
) -> Vec<Arc<dyn BindingHandler>> {
    fn make<A: ProtocolAdapter>(
        adapter: A,
        connector: &Arc<dyn NativeConnector>,
        services: &HandlerServices,
    ) -> Arc<dyn BindingHandler> {
        Arc::new(ProtocolBindingHandler::new(
            adapter,
            Arc::clone(connector),
            services.clone(),
        ))
    }

    vec![
        make(KafkaAdapter, connector, services),
        make(MqttAdapter, connector, services),
        make(AmqpAdapter, connector, services),
        make(NatsAdapter, connector, services),
        make(RedisAdapter, connector, services),
        make(StompAdapter, connector, services),
        make(WebSocketAdapter, connector, services),
        make(HttpAdapter, connector, services),
    ]
}
