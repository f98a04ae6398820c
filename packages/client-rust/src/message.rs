//! Values handed back to callers: inbound decoded messages and publish receipts.

use bindwire_core::{Headers, Value};

/// An inbound message after decoding and matching.
///
/// Built once per native delivery and shared by `Arc` across observers.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub operation_id: String,
    /// Name of the declared message the payload matched.
    pub message_name: String,
    /// Destination the native transport delivered on.
    pub destination: String,
    pub content_type: String,
    pub payload: Value,
    pub headers: Headers,
    pub correlation_id: Option<String>,
}

/// Protocol-specific facts reported by a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMetadata {
    Kafka {
        partition: i32,
        offset: i64,
    },
    /// Number of subscribers that received the message.
    Redis {
        receivers: u64,
    },
    Http {
        status: u16,
    },
    Amqp {
        delivery_tag: u64,
    },
    #[default]
    None,
}

/// Successful publish outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub operation_id: String,
    pub protocol: String,
    pub destination: String,
    /// Declared message the payload was published as.
    pub message_name: String,
    /// Correlation id written to the transport, if any.
    pub correlation_id: Option<String>,
    pub metadata: PublishMetadata,
}
