//! STOMP binding.

use serde::Deserialize;

use super::common::typed_binding;
use super::{Capabilities, CorrelationField, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::native::{ProtocolOptions, StompOptions};

const KEY: &str = "stomp";
const ACK_MODES: [&str; 3] = ["auto", "client", "client-individual"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChannelBinding {
    destination: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OperationBinding {
    ack: Option<String>,
    receipt: bool,
}

/// STOMP adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct StompAdapter;

impl ProtocolAdapter for StompAdapter {
    fn name(&self) -> &'static str {
        "stomp"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["stomp", "stomps"]
    }

    fn binding_key(&self) -> &'static str {
        KEY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            headers: true,
            correlation: CorrelationField::Header("correlation-id"),
            subscribe: true,
            wildcard: None,
        }
    }

    fn destination(&self, ctx: &OperationContext) -> Result<String, ClientError> {
        let channel: ChannelBinding = typed_binding(ctx.channel_bindings(), KEY)?;
        Ok(channel
            .destination
            .unwrap_or_else(|| ctx.address().to_string()))
    }

    fn publish_options(&self, ctx: &OperationContext, _outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError> {
        let operation: OperationBinding = typed_binding(ctx.operation_bindings(), KEY)?;
        Ok(ProtocolOptions::Stomp(StompOptions {
            ack: None,
            receipt: operation.receipt,
        }))
    }

    fn subscribe_options(&self, ctx: &OperationContext) -> Result<ProtocolOptions, ClientError> {
        let operation: OperationBinding = typed_binding(ctx.operation_bindings(), KEY)?;
        if let Some(ack) = &operation.ack {
            if !ACK_MODES.contains(&ack.as_str()) {
                return Err(ClientError::invalid_binding(
                    KEY,
                    format!("ack must be one of {}, got `{ack}`", ACK_MODES.join(", ")),
                ));
            }
        }
        Ok(ProtocolOptions::Stomp(StompOptions {
            ack: operation.ack,
            receipt: false,
        }))
    }
}
