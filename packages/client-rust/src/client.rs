//! Client facade.
//!
//! [`AsyncApiClient`] turns an operation id into a context, picks the
//! binding handler for the operation's server, and delegates. It owns no
//! transport state: connections and subscriptions live in the handlers.
//! Resolved operations are cached per (operation id, server selector) as
//! [`ContextTemplate`]s, so the document is traversed once per operation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bindwire_core::{
    DocumentError, DocumentModel, Headers, SchemaRegistry, SerializerProvider, ServerDefinition,
    Value,
};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::binding::{standard_handlers, BindingHandler, HandlerServices, ProtocolAdapter, ProtocolBindingHandler};
use crate::config::ClientConfig;
use crate::context::{ContextTemplate, OperationContext, ServerSelector};
use crate::error::ClientError;
use crate::message::PublishReceipt;
use crate::native::NativeConnector;
use crate::observer::MessageObserver;
use crate::registry::BindingHandlerRegistry;
use crate::subscription::SubscriptionHandle;

/// Attempts to attach to a shared subscription that was closed between
/// lookup and attach.
const ATTACH_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A publish call.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    operation_id: String,
    payload: Value,
    headers: Headers,
    message: Option<String>,
    server: ServerSelector,
    parameters: BTreeMap<String, String>,
    cancellation: CancellationToken,
}

impl PublishRequest {
    #[must_use]
    pub fn new(operation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            operation_id: operation_id.into(),
            payload,
            headers: Headers::new(),
            message: None,
            server: ServerSelector::Any,
            parameters: BTreeMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Adds a header; insertion order is kept.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Publishes as this declared message instead of selecting one.
    #[must_use]
    pub fn message(mut self, name: impl Into<String>) -> Self {
        self.message = Some(name.into());
        self
    }

    #[must_use]
    pub fn server(mut self, selector: ServerSelector) -> Self {
        self.server = selector;
        self
    }

    /// Value for a `{name}` placeholder in the channel address.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }
}

/// A subscribe call.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    operation_id: String,
    server: ServerSelector,
    parameters: BTreeMap<String, String>,
    cancellation: CancellationToken,
}

impl SubscribeRequest {
    #[must_use]
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            server: ServerSelector::Any,
            parameters: BTreeMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn server(mut self, selector: ServerSelector) -> Self {
        self.server = selector;
        self
    }

    /// Value for a `{name}` placeholder; unset placeholders become the
    /// protocol wildcard where there is one.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Cancels this caller's wait only; a subscription shared with other
    /// observers stays open.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }
}

// ---------------------------------------------------------------------------
// ClientState
// ---------------------------------------------------------------------------

/// Client lifecycle.
///
/// State machine: Running -> Disposing -> Disposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Running,
    Disposing,
    Disposed,
}

// ---------------------------------------------------------------------------
// AsyncApiClient
// ---------------------------------------------------------------------------

/// Document-driven messaging client.
pub struct AsyncApiClient {
    document: Arc<dyn DocumentModel>,
    registry: Arc<BindingHandlerRegistry>,
    services: HandlerServices,
    templates: DashMap<(String, ServerSelector), Arc<ContextTemplate>>,
    state: ArcSwap<ClientState>,
    dispose_started: AtomicBool,
}

impl AsyncApiClient {
    /// Starts building a client for `document`.
    #[must_use]
    pub fn builder(document: impl DocumentModel + 'static) -> ClientBuilder {
        ClientBuilder::new(Arc::new(document))
    }

    /// Client over an already-populated registry.
    #[must_use]
    pub fn new(
        document: Arc<dyn DocumentModel>,
        registry: Arc<BindingHandlerRegistry>,
        services: HandlerServices,
    ) -> Self {
        Self {
            document,
            registry,
            services,
            templates: DashMap::new(),
            state: ArcSwap::from_pointee(ClientState::Running),
            dispose_started: AtomicBool::new(false),
        }
    }

    /// Publishes one message.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Document`] for unknown operations,
    /// [`ClientError::UnsupportedProtocol`] when no handler serves the
    /// selected server, and whatever the handler reports.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishReceipt, ClientError> {
        self.ensure_running()?;
        let template = self.template(&request.operation_id, &request.server)?;
        let handler = self.handler_for(&template.server)?;
        let ctx = OperationContext::for_publish(
            template,
            request.payload,
            request.headers,
            request.parameters,
            request.message,
            request.cancellation,
        )?;
        handler.publish(&ctx).await
    }

    /// Attaches `observer` to the operation's shared subscription, opening
    /// it on first use.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish), plus connect and consumer
    /// failures, timeouts, and cancellation.
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
        observer: Arc<dyn MessageObserver>,
    ) -> Result<SubscriptionHandle, ClientError> {
        self.ensure_running()?;
        let template = self.template(&request.operation_id, &request.server)?;
        let handler = self.handler_for(&template.server)?;
        let ctx = OperationContext::for_subscribe(template, request.parameters, request.cancellation)?;

        for attempt in 1..=ATTACH_ATTEMPTS {
            let subscription = handler.subscribe(&ctx).await?;
            match subscription.attach(Arc::clone(&observer)) {
                Ok(handle) => return Ok(handle),
                Err(ClientError::Disposed) => {
                    debug!(
                        operation = %ctx.operation_id(),
                        attempt,
                        "subscription closed before attach, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(ClientError::Disposed)
    }

    /// Disposes every registered handler, closing all subscriptions and
    /// connections. Idempotent.
    pub async fn dispose(&self) {
        if self.dispose_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(Arc::new(ClientState::Disposing));
        self.registry.dispose_all().await;
        self.templates.clear();
        self.state.store(Arc::new(ClientState::Disposed));
        info!(handlers = self.registry.len(), "client disposed");
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        **self.state.load()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<BindingHandlerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn services(&self) -> &HandlerServices {
        &self.services
    }

    /// Number of cached context templates.
    #[must_use]
    pub fn cached_templates(&self) -> usize {
        self.templates.len()
    }

    fn ensure_running(&self) -> Result<(), ClientError> {
        if self.state() == ClientState::Running {
            Ok(())
        } else {
            Err(ClientError::Disposed)
        }
    }

    fn handler_for(&self, server: &ServerDefinition) -> Result<Arc<dyn BindingHandler>, ClientError> {
        self.registry
            .select(&server.protocol, server.protocol_version.as_deref())
    }

    /// Cached template for `operation_id` on the selected server.
    fn template(
        &self,
        operation_id: &str,
        selector: &ServerSelector,
    ) -> Result<Arc<ContextTemplate>, ClientError> {
        let key = (operation_id.to_string(), selector.clone());
        if let Some(template) = self.templates.get(&key) {
            return Ok(Arc::clone(template.value()));
        }

        let resolved = self.document.resolve_operation(operation_id)?;
        let server = self.select_server(&resolved.channel.name, &resolved.servers, selector)?;
        let template = Arc::new(ContextTemplate::build(
            resolved,
            server,
            &self.services.config,
            &self.services.expressions,
        )?);
        debug!(
            operation = %operation_id,
            server = %template.server.name,
            protocol = %template.server.protocol,
            selector = %selector,
            "built context template"
        );
        Ok(Arc::clone(self.templates.entry(key).or_insert(template).value()))
    }

    fn select_server(
        &self,
        channel: &str,
        servers: &[Arc<ServerDefinition>],
        selector: &ServerSelector,
    ) -> Result<Arc<ServerDefinition>, ClientError> {
        let not_found = |server: &str| {
            ClientError::Document(DocumentError::ServerNotFound {
                channel: channel.to_string(),
                server: server.to_string(),
            })
        };
        let found = match selector {
            ServerSelector::Any => {
                let supported = servers.iter().find(|s| {
                    self.registry
                        .supports(&s.protocol, s.protocol_version.as_deref())
                });
                match (supported, servers.first()) {
                    (Some(server), _) => server,
                    // Report the protocol nobody serves.
                    (None, Some(first)) => {
                        return Err(ClientError::UnsupportedProtocol {
                            protocol: first.protocol.clone(),
                            version: first.protocol_version.clone(),
                        })
                    }
                    (None, None) => return Err(not_found("*")),
                }
            }
            ServerSelector::Name(name) => servers
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| not_found(name))?,
            ServerSelector::Protocol(protocol) => servers
                .iter()
                .find(|s| s.protocol.eq_ignore_ascii_case(protocol))
                .ok_or_else(|| not_found(protocol))?,
        };
        Ok(Arc::clone(found))
    }
}

impl std::fmt::Debug for AsyncApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncApiClient")
            .field("state", &self.state())
            .field("handlers", &self.registry.len())
            .field("cached_templates", &self.templates.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ClientBuilder
// ---------------------------------------------------------------------------

type HandlerFactory = Box<dyn FnOnce(&HandlerServices) -> Vec<Arc<dyn BindingHandler>> + Send>;

/// Assembles an [`AsyncApiClient`].
pub struct ClientBuilder {
    document: Arc<dyn DocumentModel>,
    config: ClientConfig,
    serializers: SerializerProvider,
    schemas: SchemaRegistry,
    factories: Vec<HandlerFactory>,
}

impl ClientBuilder {
    #[must_use]
    pub fn new(document: Arc<dyn DocumentModel>) -> Self {
        Self {
            document,
            config: ClientConfig::default(),
            serializers: SerializerProvider::with_defaults(),
            schemas: SchemaRegistry::with_defaults(),
            factories: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn serializers(mut self, serializers: SerializerProvider) -> Self {
        self.serializers = serializers;
        self
    }

    #[must_use]
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Registers a ready-made handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn BindingHandler>) -> Self {
        self.factories.push(Box::new(move |_| vec![handler]));
        self
    }

    /// Registers one protocol adapter backed by `connector`.
    #[must_use]
    pub fn with_adapter<A: ProtocolAdapter>(
        mut self,
        adapter: A,
        connector: Arc<dyn NativeConnector>,
    ) -> Self {
        self.factories.push(Box::new(move |services| {
            let handler: Arc<dyn BindingHandler> =
                Arc::new(ProtocolBindingHandler::new(adapter, connector, services.clone()));
            vec![handler]
        }));
        self
    }

    /// Registers every built-in protocol, all backed by `connector`.
    #[must_use]
    pub fn with_standard_adapters(mut self, connector: Arc<dyn NativeConnector>) -> Self {
        self.factories
            .push(Box::new(move |services| standard_handlers(&connector, services)));
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DuplicateProtocol`] when two handlers claim the
    /// same protocol.
    pub fn build(self) -> Result<AsyncApiClient, ClientError> {
        let services = HandlerServices::new(self.config, self.serializers, self.schemas);
        let registry = BindingHandlerRegistry::new();
        for factory in self.factories {
            for handler in factory(&services) {
                registry.register(handler)?;
            }
        }
        info!(handlers = registry.len(), "client ready");
        Ok(AsyncApiClient::new(self.document, Arc::new(registry), services))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bindwire_core::AsyncApiDocument;
    use serde_json::json;

    use super::*;
    use crate::binding::{KafkaAdapter, MqttAdapter};
    use crate::native::InMemoryBroker;
    use crate::observer::ChannelObserver;

    fn document() -> AsyncApiDocument {
        AsyncApiDocument::from_value(json!({
            "servers": {
                "legacy": {"host": "old:5555", "protocol": "sqs"},
                "edge": {"host": "mqtt.local", "protocol": "mqtt"},
                "core": {"host": "kafka.local", "protocol": "kafka"}
            },
            "channels": {"events": {
                "address": "events",
                "messages": {"Event": {"payload": {"type": "object"}}}
            }},
            "operations": {
                "sendEvent": {"action": "send", "channel": "events"},
                "onEvent": {"action": "receive", "channel": "events"}
            }
        }))
        .unwrap()
    }

    fn client(broker: &InMemoryBroker) -> AsyncApiClient {
        AsyncApiClient::builder(document())
            .with_standard_adapters(Arc::new(broker.clone()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn any_selector_skips_servers_without_handler() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        let receipt = client
            .publish(PublishRequest::new("sendEvent", json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(receipt.protocol, "mqtt");
    }

    #[tokio::test]
    async fn selectors_pick_by_name_and_protocol() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        let by_name = client
            .publish(PublishRequest::new("sendEvent", json!({})).server(ServerSelector::Name("core".into())))
            .await
            .unwrap();
        assert_eq!(by_name.protocol, "kafka");

        let by_protocol = client
            .publish(PublishRequest::new("sendEvent", json!({})).server(ServerSelector::Protocol("KAFKA".into())))
            .await
            .unwrap();
        assert_eq!(by_protocol.protocol, "kafka");

        let err = client
            .publish(PublishRequest::new("sendEvent", json!({})).server(ServerSelector::Name("nope".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Document(DocumentError::ServerNotFound { .. })));

        let err = client
            .publish(PublishRequest::new("sendEvent", json!({})).server(ServerSelector::Name("legacy".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedProtocol { ref protocol, .. } if protocol == "sqs"));
    }

    #[tokio::test]
    async fn templates_are_cached_per_operation_and_selector() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        for _ in 0..3 {
            client.publish(PublishRequest::new("sendEvent", json!({}))).await.unwrap();
        }
        assert_eq!(client.cached_templates(), 1);
        client
            .publish(PublishRequest::new("sendEvent", json!({})).server(ServerSelector::Name("core".into())))
            .await
            .unwrap();
        assert_eq!(client.cached_templates(), 2);
    }

    #[tokio::test]
    async fn unknown_operation_is_a_document_error() {
        let client = client(&InMemoryBroker::new());
        let err = client
            .publish(PublishRequest::new("missing", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Document(DocumentError::OperationNotFound { .. })));
    }

    #[test]
    fn duplicate_registration_fails_build() {
        let broker: Arc<dyn NativeConnector> = Arc::new(InMemoryBroker::new());
        let result = AsyncApiClient::builder(document())
            .with_adapter(MqttAdapter, Arc::clone(&broker))
            .with_adapter(KafkaAdapter, Arc::clone(&broker))
            .with_adapter(MqttAdapter, broker)
            .build();
        assert!(matches!(result, Err(ClientError::DuplicateProtocol { .. })));
    }

    #[tokio::test]
    async fn dispose_closes_everything_and_rejects_new_calls() {
        let broker = InMemoryBroker::new();
        let client = client(&broker);
        let (observer, mut rx) = ChannelObserver::channel();
        let _handle = client
            .subscribe(SubscribeRequest::new("onEvent"), observer)
            .await
            .unwrap();
        assert_eq!(broker.stats().active_consumers(), 1);

        client.dispose().await;
        client.dispose().await;

        assert_eq!(client.state(), ClientState::Disposed);
        let stats = broker.stats();
        assert_eq!(stats.active_consumers(), 0);
        assert_eq!(stats.open_connections(), 0);
        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            client.publish(PublishRequest::new("sendEvent", json!({}))).await,
            Err(ClientError::Disposed)
        ));
    }
}
