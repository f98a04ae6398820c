//! MQTT binding (3.1.1 and 5).
//!
//! Delivery settings live on the operation binding, MQTT 5 message
//! properties on the message binding. Correlation ids travel in the native
//! correlation-data property; unresolved topic parameters become `+` on
//! subscribe.

use bindwire_core::Value;
use serde::Deserialize;

use super::common::{schema_literal, typed_binding};
use super::{Capabilities, CorrelationField, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::native::{MqttOptions, ProtocolOptions};

const KEY: &str = "mqtt";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OperationBinding {
    qos: Option<i64>,
    retain: Option<bool>,
    message_expiry_interval: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MessageBinding {
    payload_format_indicator: Option<i64>,
    response_topic: Option<Value>,
}

/// MQTT adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttAdapter;

fn qos(binding: &OperationBinding) -> Result<u8, ClientError> {
    match binding.qos {
        None => Ok(0),
        Some(level @ 0..=2) => Ok(u8::try_from(level).unwrap_or_default()),
        Some(other) => Err(ClientError::invalid_binding(
            KEY,
            format!("qos must be 0, 1 or 2, got {other}"),
        )),
    }
}

impl ProtocolAdapter for MqttAdapter {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["mqtt", "mqtts", "secure-mqtt"]
    }

    fn binding_key(&self) -> &'static str {
        KEY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            headers: true,
            correlation: CorrelationField::Native,
            subscribe: true,
            wildcard: Some("+"),
        }
    }

    fn supports_version(&self, version: Option<&str>) -> bool {
        matches!(version, None | Some("3.1.1" | "5" | "5.0"))
    }

    fn publish_options(&self, ctx: &OperationContext, outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError> {
        let operation: OperationBinding = typed_binding(ctx.operation_bindings(), KEY)?;
        let message: MessageBinding = typed_binding(&outbound.message.bindings, KEY)?;

        let message_expiry = operation
            .message_expiry_interval
            .map(|secs| {
                u32::try_from(secs).map_err(|_| {
                    ClientError::invalid_binding(
                        KEY,
                        format!("messageExpiryInterval must fit in 0..=4294967295 seconds, got {secs}"),
                    )
                })
            })
            .transpose()?;

        let payload_format_indicator = match message.payload_format_indicator {
            None => None,
            Some(0) => Some(0),
            Some(1) => Some(1),
            Some(other) => {
                return Err(ClientError::invalid_binding(
                    KEY,
                    format!("payloadFormatIndicator must be 0 or 1, got {other}"),
                ))
            }
        };

        Ok(ProtocolOptions::Mqtt(MqttOptions {
            qos: qos(&operation)?,
            retain: operation.retain.unwrap_or(false),
            message_expiry,
            response_topic: message.response_topic.as_ref().and_then(schema_literal),
            payload_format_indicator,
        }))
    }

    fn subscribe_options(&self, ctx: &OperationContext) -> Result<ProtocolOptions, ClientError> {
        let operation: OperationBinding = typed_binding(ctx.operation_bindings(), KEY)?;
        Ok(ProtocolOptions::Mqtt(MqttOptions {
            qos: qos(&operation)?,
            ..MqttOptions::default()
        }))
    }
}
