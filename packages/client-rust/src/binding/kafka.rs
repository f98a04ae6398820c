//! Kafka binding.
//!
//! The topic comes from the channel binding's `topic`, falling back to the
//! channel address. The record key is declared on the message binding as a
//! literal, a runtime expression, or a schema pinning one value.

use bindwire_core::Value;
use serde::Deserialize;

use super::common::{literal_or_expression, schema_literal, typed_binding};
use super::{Capabilities, CorrelationField, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::native::{KafkaOptions, ProtocolOptions};

const KEY: &str = "kafka";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChannelBinding {
    topic: Option<String>,
    partitions: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OperationBinding {
    group_id: Option<Value>,
    client_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MessageBinding {
    key: Option<Value>,
    partition: Option<i32>,
}

/// Kafka adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaAdapter;

impl KafkaAdapter {
    fn operation_binding(ctx: &OperationContext) -> Result<OperationBinding, ClientError> {
        typed_binding(ctx.operation_bindings(), KEY)
    }
}

impl ProtocolAdapter for KafkaAdapter {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["kafka", "kafka-secure"]
    }

    fn binding_key(&self) -> &'static str {
        KEY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            headers: true,
            correlation: CorrelationField::Header("correlationId"),
            subscribe: true,
            wildcard: None,
        }
    }

    fn destination(&self, ctx: &OperationContext) -> Result<String, ClientError> {
        let channel: ChannelBinding = typed_binding(ctx.channel_bindings(), KEY)?;
        Ok(channel.topic.unwrap_or_else(|| ctx.address().to_string()))
    }

    fn publish_options(&self, ctx: &OperationContext, outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError> {
        let channel: ChannelBinding = typed_binding(ctx.channel_bindings(), KEY)?;
        let operation = Self::operation_binding(ctx)?;
        let message: MessageBinding = typed_binding(&outbound.message.bindings, KEY)?;

        let key = match &message.key {
            Some(Value::String(raw)) => literal_or_expression(
                raw,
                outbound.payload,
                outbound.headers,
                &outbound.services.expressions,
            )?,
            Some(schema) => schema_literal(schema),
            None => None,
        };

        if let Some(partition) = message.partition {
            if partition < 0 {
                return Err(ClientError::invalid_binding(
                    KEY,
                    format!("partition must not be negative, got {partition}"),
                ));
            }
            if let Some(partitions) = channel.partitions {
                if i64::from(partition) >= i64::from(partitions) {
                    return Err(ClientError::invalid_binding(
                        KEY,
                        format!("partition {partition} is outside the {partitions} declared partitions"),
                    ));
                }
            }
        }

        Ok(ProtocolOptions::Kafka(KafkaOptions {
            key,
            partition: message.partition,
            client_id: operation.client_id.as_ref().and_then(schema_literal),
            group_id: None,
        }))
    }

    fn subscribe_options(&self, ctx: &OperationContext) -> Result<ProtocolOptions, ClientError> {
        let operation = Self::operation_binding(ctx)?;
        Ok(ProtocolOptions::Kafka(KafkaOptions {
            key: None,
            partition: None,
            client_id: operation.client_id.as_ref().and_then(schema_literal),
            group_id: operation.group_id.as_ref().and_then(schema_literal),
        }))
    }
}
