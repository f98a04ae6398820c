//! AMQP 0-9-1 binding.
//!
//! The channel binding's `is` decides the addressing mode:
//!
//! - `routingKey` (default): publish to `exchange.name`, the channel address
//!   is the routing key.
//! - `queue`: publish through the default exchange straight to
//!   `queue.name`.
//!
//! Delivery properties come from the operation binding, `contentEncoding`
//! and `messageType` from the message binding.

use serde::Deserialize;

use super::common::typed_binding;
use super::{Capabilities, CorrelationField, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::native::{AmqpOptions, ProtocolOptions};

const KEY: &str = "amqp";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Named {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChannelBinding {
    is: Option<String>,
    exchange: Named,
    queue: Named,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OperationBinding {
    expiration: Option<i64>,
    user_id: Option<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    priority: Option<i64>,
    delivery_mode: Option<i64>,
    mandatory: bool,
    timestamp: bool,
    ack: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MessageBinding {
    content_encoding: Option<String>,
    message_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    RoutingKey,
    Queue,
}

impl ChannelBinding {
    fn mode(&self) -> Result<Mode, ClientError> {
        match self.is.as_deref() {
            None | Some("routingKey") => Ok(Mode::RoutingKey),
            Some("queue") => Ok(Mode::Queue),
            Some(other) => Err(ClientError::invalid_binding(
                KEY,
                format!("`is` must be `routingKey` or `queue`, got `{other}`"),
            )),
        }
    }
}

/// AMQP 0-9-1 adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpAdapter;

impl AmqpAdapter {
    fn channel(ctx: &OperationContext) -> Result<ChannelBinding, ClientError> {
        typed_binding(ctx.channel_bindings(), KEY)
    }
}

impl ProtocolAdapter for AmqpAdapter {
    fn name(&self) -> &'static str {
        "amqp"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["amqp", "amqps"]
    }

    fn binding_key(&self) -> &'static str {
        KEY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            headers: true,
            correlation: CorrelationField::Native,
            subscribe: true,
            wildcard: None,
        }
    }

    fn supports_version(&self, version: Option<&str>) -> bool {
        matches!(version, None | Some("0.9.1" | "0-9-1"))
    }

    fn destination(&self, ctx: &OperationContext) -> Result<String, ClientError> {
        let channel = Self::channel(ctx)?;
        match channel.mode()? {
            Mode::Queue => Ok(channel
                .queue
                .name
                .unwrap_or_else(|| ctx.address().to_string())),
            Mode::RoutingKey => Ok(ctx.address().to_string()),
        }
    }

    fn publish_options(&self, ctx: &OperationContext, outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError> {
        let channel = Self::channel(ctx)?;
        let operation: OperationBinding = typed_binding(ctx.operation_bindings(), KEY)?;
        let message: MessageBinding = typed_binding(&outbound.message.bindings, KEY)?;

        let delivery_mode = match operation.delivery_mode {
            None => None,
            Some(mode @ (1 | 2)) => u8::try_from(mode).ok(),
            Some(other) => {
                return Err(ClientError::invalid_binding(
                    KEY,
                    format!("deliveryMode must be 1 (transient) or 2 (persistent), got {other}"),
                ))
            }
        };
        let priority = operation
            .priority
            .map(|p| {
                u8::try_from(p).map_err(|_| {
                    ClientError::invalid_binding(KEY, format!("priority must be within 0..=255, got {p}"))
                })
            })
            .transpose()?;
        let expiration = operation
            .expiration
            .map(|ms| {
                u64::try_from(ms).map_err(|_| {
                    ClientError::invalid_binding(KEY, format!("expiration must not be negative, got {ms}"))
                })
            })
            .transpose()?;

        let (exchange, queue) = match channel.mode()? {
            Mode::RoutingKey => (channel.exchange.name, None),
            // Default exchange routes by queue name.
            Mode::Queue => (Some(String::new()), channel.queue.name),
        };

        Ok(ProtocolOptions::Amqp(AmqpOptions {
            exchange,
            routing_key: None,
            queue,
            delivery_mode,
            priority,
            expiration,
            mandatory: operation.mandatory,
            user_id: operation.user_id,
            cc: operation.cc,
            bcc: operation.bcc,
            timestamp: operation.timestamp,
            content_encoding: message.content_encoding,
            message_type: message.message_type,
            ack: false,
        }))
    }

    fn subscribe_options(&self, ctx: &OperationContext) -> Result<ProtocolOptions, ClientError> {
        let channel = Self::channel(ctx)?;
        let operation: OperationBinding = typed_binding(ctx.operation_bindings(), KEY)?;
        channel.mode()?;
        Ok(ProtocolOptions::Amqp(AmqpOptions {
            exchange: channel.exchange.name,
            queue: channel.queue.name,
            ack: operation.ack,
            ..AmqpOptions::default()
        }))
    }
}
