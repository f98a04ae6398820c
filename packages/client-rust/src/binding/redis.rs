//! Redis pub/sub binding.
//!
//! Redis channels carry a bare payload: no headers, no correlation field,
//! no per-message options. Outbound headers are dropped with a warning, and
//! inbound matching ignores header-sourced declarations.

use super::{Capabilities, CorrelationField, Outbound, ProtocolAdapter};
use crate::context::OperationContext;
use crate::error::ClientError;
use crate::native::ProtocolOptions;

/// Redis pub/sub adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisAdapter;

impl ProtocolAdapter for RedisAdapter {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["redis"]
    }

    fn binding_key(&self) -> &'static str {
        "redis"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            headers: false,
            correlation: CorrelationField::Unsupported,
            subscribe: true,
            wildcard: Some("*"),
        }
    }

    fn publish_options(&self, _ctx: &OperationContext, _outbound: &Outbound<'_>) -> Result<ProtocolOptions, ClientError> {
        Ok(ProtocolOptions::None)
    }

    fn subscribe_options(&self, _ctx: &OperationContext) -> Result<ProtocolOptions, ClientError> {
        Ok(ProtocolOptions::None)
    }
}
