//! Inbound decode, match, and emit.
//!
//! [`InboundPipeline`] is the [`NativeCallback`] every subscription hands to
//! its native consumer. It runs the three steps sequentially for each
//! delivery, touches no shared state besides the stream, and never lets a
//! bad message escape: failures are logged, counted, and dropped.

use std::sync::Arc;

use bindwire_core::{MessageDefinition, SerializationError, SerializerProvider};
use tracing::{trace, warn};

use crate::binding::common::decode_headers;
use crate::binding::HandlerServices;
use crate::context::ContextTemplate;
use crate::error::MatchError;
use crate::matcher::{MatchOptions, MessageMatcher};
use crate::message::DecodedMessage;
use crate::native::{NativeCallback, NativeInbound};
use crate::stream::MessageStream;
use crate::telemetry;

/// Why an inbound message was dropped.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error(transparent)]
    Decode(#[from] SerializationError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

impl InboundError {
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Match(err) => err.reason(),
        }
    }
}

/// Per-subscription decode-match-emit function.
pub struct InboundPipeline {
    operation_id: String,
    protocol: String,
    candidates: Vec<Arc<MessageDefinition>>,
    content_type: String,
    headers_available: bool,
    matcher: MessageMatcher,
    serializers: Arc<SerializerProvider>,
    stream: Arc<MessageStream>,
}

impl InboundPipeline {
    #[must_use]
    pub fn new(
        template: &ContextTemplate,
        headers_available: bool,
        services: &HandlerServices,
        stream: Arc<MessageStream>,
    ) -> Self {
        Self {
            operation_id: template.operation_id.clone(),
            protocol: template.server.protocol.to_ascii_lowercase(),
            candidates: template.messages.clone(),
            content_type: template.content_type.clone(),
            headers_available,
            matcher: MessageMatcher::from_services(services),
            serializers: Arc::clone(&services.serializers),
            stream,
        }
    }

    /// Decodes and matches one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`InboundError`] when the payload cannot be decoded or does
    /// not match exactly one candidate.
    pub fn decode(&self, inbound: NativeInbound) -> Result<DecodedMessage, InboundError> {
        let content_type = inbound
            .content_type
            .filter(|ct| self.serializers.supports(ct))
            .unwrap_or_else(|| self.content_type.clone());
        let payload = self
            .serializers
            .deserialize_for(&content_type, &inbound.payload)?;
        let headers = if self.headers_available {
            decode_headers(&inbound.headers)
        } else {
            bindwire_core::Headers::new()
        };

        let options = MatchOptions {
            check_correlation: true,
            headers_available: self.headers_available,
        };
        let outcome = self
            .matcher
            .match_message(&payload, &headers, &self.candidates, options)?;

        Ok(DecodedMessage {
            operation_id: self.operation_id.clone(),
            message_name: outcome.message.name.clone(),
            destination: inbound.destination,
            content_type,
            payload,
            headers,
            correlation_id: outcome.correlation_id.or(inbound.correlation_id),
        })
    }
}

impl NativeCallback for InboundPipeline {
    fn on_message(&self, message: NativeInbound) {
        let destination = message.destination.clone();
        match self.decode(message) {
            Ok(decoded) => {
                let delivered = self.stream.emit(&Arc::new(decoded));
                trace!(
                    operation = %self.operation_id,
                    destination = %destination,
                    observers = delivered,
                    "delivered inbound message"
                );
                telemetry::record_delivered(&self.protocol);
            }
            Err(err) => {
                warn!(
                    operation = %self.operation_id,
                    protocol = %self.protocol,
                    destination = %destination,
                    reason = err.reason(),
                    error = %err,
                    "dropping inbound message"
                );
                telemetry::record_dropped(&self.protocol, err.reason());
            }
        }
    }
}
