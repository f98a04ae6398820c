//! Generic binding handler shared by every protocol.
//!
//! [`ProtocolBindingHandler`] owns everything that is the same across
//! protocols: lazy connections per endpoint, one subscription slot per
//! (operation, server, destination), outbound message selection,
//! validation, serialization, and correlation handling. The
//! [`ProtocolAdapter`] it wraps only contributes destinations and native
//! options.
//!
//! Native connect and subscribe calls run on their own task, bounded by the
//! configured timeout and the caller's cancellation token. When the caller
//! gives up first, whatever the task eventually yields is closed again so
//! half-open connections and consumers never leak.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bindwire_core::{MessageDefinition, ValidationResult, Value};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::common::{
    content_type_for, encode_header, encode_headers, outbound_correlation, resolve_destination, Direction,
};
use super::state::SubscriptionSlot;
use super::{BindingHandler, CorrelationField, HandlerServices, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::matcher::{select_outbound, MessageMatcher};
use crate::message::PublishReceipt;
use crate::native::{NativeConnection, NativeConnector, NativeEnvelope, NativeSubscribeRequest};
use crate::pipeline::InboundPipeline;
use crate::stream::MessageStream;
use crate::subscription::SharedSubscription;
use crate::telemetry;

type ConnectionCell = Arc<tokio::sync::Mutex<Option<Arc<dyn NativeConnection>>>>;

/// [`BindingHandler`] built from a [`ProtocolAdapter`].
pub struct ProtocolBindingHandler<A: ProtocolAdapter> {
    adapter: A,
    connector: Arc<dyn NativeConnector>,
    services: HandlerServices,
    matcher: MessageMatcher,
    /// Endpoint key -> lazily opened connection.
    connections: DashMap<String, ConnectionCell>,
    /// `operation|server|destination` -> subscription slot.
    subscriptions: DashMap<String, Arc<SubscriptionSlot>>,
    disposed: AtomicBool,
}

impl<A: ProtocolAdapter> ProtocolBindingHandler<A> {
    #[must_use]
    pub fn new(adapter: A, connector: Arc<dyn NativeConnector>, services: HandlerServices) -> Self {
        let matcher = MessageMatcher::from_services(&services);
        Self {
            adapter,
            connector,
            services,
            matcher,
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Number of endpoints with an open connection.
    pub async fn open_connections(&self) -> usize {
        let cells: Vec<ConnectionCell> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut open = 0;
        for cell in cells {
            if cell.lock().await.is_some() {
                open += 1;
            }
        }
        open
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    /// The connection for the context's endpoint, opened on first use.
    async fn connection(
        &self,
        ctx: &OperationContext,
        protocol: &str,
    ) -> Result<Arc<dyn NativeConnection>, ClientError> {
        let endpoint = ctx.template().endpoint();
        let key = endpoint.key();
        let cell = Arc::clone(self.connections.entry(key.clone()).or_default().value());

        let token = ctx.cancellation();
        let mut guard = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ClientError::Cancelled),
            guard = cell.lock() => guard,
        };
        if let Some(connection) = guard.as_ref() {
            return Ok(Arc::clone(connection));
        }

        let connector = Arc::clone(&self.connector);
        let connection = bounded(
            protocol,
            "connect",
            self.services.config.connect_timeout,
            token,
            async move { connector.connect(&endpoint).await },
            |orphan: Arc<dyn NativeConnection>| async move {
                if let Err(err) = orphan.disconnect().await {
                    warn!(error = %err, "failed to close abandoned connection");
                }
            },
        )
        .await?;

        debug!(protocol, endpoint = %key, "connection opened");
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Checks the payload against the selected message's schema.
    fn validate_outbound(&self, message: &MessageDefinition, payload: &Value) -> Result<(), ClientError> {
        let Some(schema) = message.payload_schema() else {
            return Ok(());
        };
        match self.services.schemas.validate_ref(payload, schema) {
            Ok(ValidationResult::Valid) => Ok(()),
            Ok(ValidationResult::Invalid { errors }) => Err(ClientError::Validation {
                message: message.name.clone(),
                errors,
            }),
            Err(err) => {
                debug!(message_name = %message.name, error = %err, "skipping outbound validation");
                Ok(())
            }
        }
    }

    async fn send(&self, ctx: &OperationContext, protocol: &str) -> Result<PublishReceipt, ClientError> {
        let capabilities = self.adapter.capabilities();
        let payload = ctx.payload().cloned().unwrap_or(Value::Null);

        let message = select_outbound(ctx, &payload, &self.matcher)?;
        let content_type = content_type_for(ctx, &message, self.adapter.binding_key());
        if self.services.config.validate_outbound {
            self.validate_outbound(&message, &payload)?;
        }

        let mut headers = ctx.headers().clone();
        let correlation_id = outbound_correlation(
            &message,
            &payload,
            &mut headers,
            &self.services,
            capabilities.headers,
        )?;
        let body = self.services.serializers.serialize_for(&content_type, &payload)?;

        let raw = self.adapter.destination(ctx)?;
        let destination = resolve_destination(
            ctx,
            &raw,
            Direction::Publish,
            None,
            Some((&payload, &headers)),
            &self.services.expressions,
        )?;
        let options = self.adapter.publish_options(
            ctx,
            &Outbound {
                message: &message,
                payload: &payload,
                headers: &headers,
                services: &self.services,
            },
        )?;

        let mut native_headers = if capabilities.headers {
            encode_headers(&headers)
        } else {
            if !headers.is_empty() {
                warn!(
                    protocol,
                    operation = %ctx.operation_id(),
                    dropped = headers.len(),
                    "transport has no message headers, dropping them"
                );
            }
            Vec::new()
        };
        let mut native_correlation = None;
        match (capabilities.correlation, &correlation_id) {
            (CorrelationField::Header(name), Some(id)) => {
                if !native_headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
                    native_headers.push((name.to_string(), encode_header(&Value::String(id.clone()))));
                }
            }
            (CorrelationField::Native, Some(id)) => native_correlation = Some(id.clone()),
            _ => {}
        }

        let envelope = NativeEnvelope {
            destination: destination.clone(),
            payload: body,
            headers: native_headers,
            content_type,
            correlation_id: native_correlation,
            options,
        };

        let connection = self.connection(ctx, protocol).await?;
        let limit = self.services.config.publish_timeout;
        let metadata = tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => return Err(ClientError::Cancelled),
            outcome = tokio::time::timeout(limit, connection.publish(envelope)) => match outcome {
                Ok(result) => result.map_err(|err| ClientError::connection(protocol, err))?,
                Err(_) => {
                    return Err(ClientError::Timeout {
                        operation: "publish",
                        after: limit,
                    })
                }
            },
        };

        debug!(
            protocol,
            operation = %ctx.operation_id(),
            destination = %destination,
            message_name = %message.name,
            "published"
        );
        Ok(PublishReceipt {
            operation_id: ctx.operation_id().to_string(),
            protocol: protocol.to_string(),
            destination,
            message_name: message.name.clone(),
            correlation_id,
            metadata,
        })
    }
}

#[async_trait]
impl<A: ProtocolAdapter> BindingHandler for ProtocolBindingHandler<A> {
    fn name(&self) -> &'static str {
        self.adapter.name()
    }

    fn protocols(&self) -> &'static [&'static str] {
        self.adapter.protocols()
    }

    fn supports(&self, protocol: &str, version: Option<&str>) -> bool {
        self.adapter
            .protocols()
            .iter()
            .any(|p| p.eq_ignore_ascii_case(protocol))
            && self.adapter.supports_version(version)
    }

    async fn publish(&self, ctx: &OperationContext) -> Result<PublishReceipt, ClientError> {
        self.ensure_live()?;
        let protocol = ctx.protocol().to_ascii_lowercase();
        let result = self.send(ctx, &protocol).await;
        match &result {
            Ok(_) => telemetry::record_published(&protocol),
            Err(err) => {
                debug!(protocol = %protocol, operation = %ctx.operation_id(), error = %err, "publish failed");
                telemetry::record_publish_failed(&protocol);
            }
        }
        result
    }

    async fn subscribe(&self, ctx: &OperationContext) -> Result<Arc<SharedSubscription>, ClientError> {
        self.ensure_live()?;
        let protocol = ctx.protocol().to_ascii_lowercase();
        let capabilities = self.adapter.capabilities();
        if !capabilities.subscribe {
            return Err(ClientError::UnsupportedOperation {
                protocol,
                operation: "subscribe",
            });
        }

        let raw = self.adapter.destination(ctx)?;
        let destination = resolve_destination(
            ctx,
            &raw,
            Direction::Subscribe,
            capabilities.wildcard,
            None,
            &self.services.expressions,
        )?;
        let options = self.adapter.subscribe_options(ctx)?;

        let key = format!(
            "{}|{}|{}",
            ctx.operation_id(),
            ctx.template().server.name,
            destination
        );
        let slot = Arc::clone(self.subscriptions.entry(key).or_default().value());
        let token = ctx.cancellation();
        let mut guard = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ClientError::Cancelled),
            guard = slot.lock() => guard,
        };
        if let Some(active) = guard.active() {
            return Ok(active);
        }

        guard.begin_connecting();
        let connection = match self.connection(ctx, &protocol).await {
            Ok(connection) => connection,
            Err(err) => {
                guard.reset();
                return Err(err);
            }
        };

        guard.begin_subscribing();
        let stream = Arc::new(MessageStream::new());
        let pipeline = Arc::new(InboundPipeline::new(
            ctx.template(),
            capabilities.headers,
            &self.services,
            Arc::clone(&stream),
        ));
        let request = NativeSubscribeRequest {
            destination: destination.clone(),
            options,
        };
        let consumer = bounded(
            &protocol,
            "subscribe",
            self.services.config.subscribe_timeout,
            token,
            async move { connection.subscribe(request, pipeline).await },
            |orphan| async move {
                if let Err(err) = orphan.close().await {
                    warn!(error = %err, "failed to close abandoned consumer");
                }
            },
        )
        .await;
        let consumer = match consumer {
            Ok(consumer) => consumer,
            Err(err) => {
                guard.reset();
                return Err(err);
            }
        };

        let subscription = Arc::new(SharedSubscription::new(
            ctx.operation_id(),
            protocol.clone(),
            destination.clone(),
            consumer,
            stream,
        ));
        guard.activate(Arc::clone(&subscription));
        telemetry::record_subscription_opened(&protocol);
        info!(
            protocol = %protocol,
            operation = %ctx.operation_id(),
            destination = %destination,
            "subscription opened"
        );
        Ok(subscription)
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let slots: Vec<Arc<SubscriptionSlot>> = self
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.subscriptions.clear();
        for slot in slots {
            let active = slot.lock().await.reset();
            if let Some(subscription) = active {
                subscription.dispose().await;
            }
        }

        let cells: Vec<ConnectionCell> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();
        for cell in cells {
            let connection = cell.lock().await.take();
            if let Some(connection) = connection {
                if let Err(err) = connection.disconnect().await {
                    warn!(handler = self.adapter.name(), error = %err, "disconnect failed");
                }
            }
        }
        info!(handler = self.adapter.name(), "binding handler disposed");
    }
}

/// Runs `work` on its own task, bounded by `limit` and `token`.
///
/// When the caller stops waiting, the task keeps running and its eventual
/// output is handed to `reap`.
async fn bounded<T, Work, Reap, ReapFut>(
    protocol: &str,
    operation: &'static str,
    limit: Duration,
    token: &CancellationToken,
    work: Work,
    reap: Reap,
) -> Result<T, ClientError>
where
    T: Send + 'static,
    Work: Future<Output = anyhow::Result<T>> + Send + 'static,
    Reap: FnOnce(T) -> ReapFut + Send + 'static,
    ReapFut: Future<Output = ()> + Send,
{
    let mut task = tokio::spawn(work);
    let abandoned = tokio::select! {
        biased;
        () = token.cancelled() => ClientError::Cancelled,
        joined = &mut task => {
            return match joined {
                Ok(result) => result.map_err(|err| ClientError::connection(protocol, err)),
                Err(join) => Err(ClientError::connection(protocol, anyhow::Error::new(join))),
            };
        }
        () = tokio::time::sleep(limit) => ClientError::Timeout { operation, after: limit },
    };

    debug!(protocol, operation, reason = %abandoned, "abandoning native call");
    tokio::spawn(async move {
        if let Ok(Ok(orphan)) = task.await {
            reap(orphan).await;
        }
    });
    Err(abandoned)
}
