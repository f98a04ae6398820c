//! NATS binding.
//!
//! Subjects come from the channel address; unresolved subject tokens become
//! `*` on subscribe. The operation binding's `queue` joins a queue group.

use serde::Deserialize;

use super::common::{literal_or_expression, typed_binding};
use super::{Capabilities, CorrelationField, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::native::{NatsOptions, ProtocolOptions};

const KEY: &str = "nats";
const MAX_QUEUE_LEN: usize = 255;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OperationBinding {
    queue: Option<String>,
    /// Reply subject; literal or runtime expression.
    reply: Option<String>,
}

impl OperationBinding {
    fn load(ctx: &OperationContext) -> Result<Self, ClientError> {
        let binding: Self = typed_binding(ctx.operation_bindings(), KEY)?;
        if let Some(queue) = &binding.queue {
            if queue.is_empty() || queue.len() > MAX_QUEUE_LEN {
                return Err(ClientError::invalid_binding(
                    KEY,
                    format!("queue must be 1..={MAX_QUEUE_LEN} characters, got {}", queue.len()),
                ));
            }
        }
        Ok(binding)
    }
}

/// NATS adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsAdapter;

impl ProtocolAdapter for NatsAdapter {
    fn name(&self) -> &'static str {
        "nats"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["nats"]
    }

    fn binding_key(&self) -> &'static str {
        KEY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            headers: true,
            correlation: CorrelationField::Header("correlationId"),
            subscribe: true,
            wildcard: Some("*"),
        }
    }

    fn publish_options(&self, ctx: &OperationContext, outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError> {
        let operation = OperationBinding::load(ctx)?;
        let reply_to = match &operation.reply {
            Some(raw) => literal_or_expression(
                raw,
                outbound.payload,
                outbound.headers,
                &outbound.services.expressions,
            )?,
            None => None,
        };
        Ok(ProtocolOptions::Nats(NatsOptions {
            queue_group: None,
            reply_to,
        }))
    }

    fn subscribe_options(&self, ctx: &OperationContext) -> Result<ProtocolOptions, ClientError> {
        let operation = OperationBinding::load(ctx)?;
        Ok(ProtocolOptions::Nats(NatsOptions {
            queue_group: operation.queue,
            reply_to: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bindwire_core::{Headers, Value};
    use serde_json::json;

    use super::*;
    use crate::binding::test_support::{header, make_handler, make_publish_ctx, make_subscribe_ctx, only_envelope};
    use crate::binding::BindingHandler;
    use crate::native::InMemoryBroker;
    use crate::observer::ChannelObserver;

    fn document(receive_binding: Value) -> Value {
        json!({
            "servers": {"nats": {"host": "localhost:4222", "protocol": "nats"}},
            "channels": {"orders": {
                "address": "orders.{region}.created",
                "parameters": {"region": {"enum": ["eu", "us"]}},
                "messages": {"OrderCreated": {
                    "payload": {"type": "object", "required": ["orderId"]},
                    "correlationId": {"location": "$message.payload#/orderId"}
                }}
            }},
            "operations": {
                "sendOrder": {"action": "send", "channel": "orders",
                              "bindings": {"nats": {"reply": "$message.payload#/replyTo"}}},
                "onOrder": {"action": "receive", "channel": "orders", "bindings": {"nats": receive_binding}}
            }
        })
    }

    #[tokio::test]
    async fn publishes_with_reply_subject_and_correlation_header() {
        let broker = InMemoryBroker::new();
        let handler = make_handler(NatsAdapter, &broker);
        let ctx = make_publish_ctx(
            document(json!({})),
            "sendOrder",
            json!({"orderId": "o-9", "replyTo": "_INBOX.1"}),
            Headers::new(),
            &[("region", "eu")],
        );
        handler.publish(&ctx).await.unwrap();

        let envelope = only_envelope(&broker);
        assert_eq!(envelope.destination, "orders.eu.created");
        assert_eq!(header(&envelope, "correlationId"), Some("o-9"));
        assert_eq!(
            envelope.options,
            ProtocolOptions::Nats(NatsOptions {
                queue_group: None,
                reply_to: Some("_INBOX.1".into()),
            })
        );
    }

    #[tokio::test]
    async fn wildcard_subscription_receives_every_region() {
        let broker = InMemoryBroker::new();
        let handler = make_handler(NatsAdapter, &broker);
        let subscription = handler
            .subscribe(&make_subscribe_ctx(document(json!({"queue": "workers"})), "onOrder"))
            .await
            .unwrap();
        assert_eq!(subscription.destination(), "orders.*.created");
        let (observer, mut rx) = ChannelObserver::channel();
        let _handle = subscription.attach(observer).unwrap();

        for region in ["eu", "us"] {
            let ctx = make_publish_ctx(
                document(json!({})),
                "sendOrder",
                json!({"orderId": region}),
                Headers::new(),
                &[("region", region)],
            );
            handler.publish(&ctx).await.unwrap();
        }

        for expected in ["orders.eu.created", "orders.us.created"] {
            let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.destination, expected);
        }
    }

    #[test]
    fn queue_group_is_validated() {
        let ctx = make_subscribe_ctx(document(json!({"queue": "workers"})), "onOrder");
        assert_eq!(
            NatsAdapter.subscribe_options(&ctx).unwrap(),
            ProtocolOptions::Nats(NatsOptions {
                queue_group: Some("workers".into()),
                reply_to: None,
            })
        );

        let long = "q".repeat(300);
        let ctx = make_subscribe_ctx(document(json!({"queue": long})), "onOrder");
        assert!(matches!(
            NatsAdapter.subscribe_options(&ctx),
            Err(ClientError::InvalidBinding { .. })
        ));
    }
}
