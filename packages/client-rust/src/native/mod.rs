//! Narrow interface to native protocol clients.
//!
//! A binding handler never talks to a broker library directly. It asks a
//! [`NativeConnector`] for a [`NativeConnection`], publishes
//! [`NativeEnvelope`]s on it, and opens [`NativeConsumer`]s that push
//! [`NativeInbound`] messages into a [`NativeCallback`]. Native collaborators
//! report failures as `anyhow::Error`; handlers wrap them at their boundary.

pub mod memory;
pub mod options;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "websocket")]
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use bindwire_core::BindingSet;
use bytes::Bytes;

pub use memory::InMemoryBroker;
pub use options::{
    AmqpOptions, HttpOptions, KafkaOptions, MqttOptions, NatsOptions, ProtocolOptions,
    StompOptions, WebSocketOptions,
};

use crate::message::PublishMetadata;

/// Where to connect: the selected server of an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub protocol: String,
    pub protocol_version: Option<String>,
    pub host: String,
    pub pathname: Option<String>,
    pub bindings: BindingSet,
}

impl Endpoint {
    /// Connection identity: connections are shared per endpoint key.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}://{}{}",
            self.protocol.to_ascii_lowercase(),
            self.host,
            self.pathname.as_deref().unwrap_or_default()
        )
    }

    /// URL for `path` on this endpoint, e.g. `wss://host/base/path`.
    ///
    /// A host that already carries a scheme is used as is.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        let base = self.pathname.as_deref().unwrap_or_default().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let host = if self.host.contains("://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            format!("{}://{}", self.protocol.to_ascii_lowercase(), self.host)
        };
        if path.is_empty() {
            format!("{host}{base}")
        } else {
            format!("{host}{base}/{path}")
        }
    }
}

/// A fully-built outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeEnvelope {
    pub destination: String,
    pub payload: Bytes,
    /// Header name to serialized value, in insertion order.
    pub headers: Vec<(String, Bytes)>,
    pub content_type: String,
    /// Value for the protocol's native correlation field, when it has one.
    pub correlation_id: Option<String>,
    pub options: ProtocolOptions,
}

/// A raw message delivered by a native consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeInbound {
    pub destination: String,
    pub payload: Bytes,
    pub headers: Vec<(String, Bytes)>,
    /// Content type carried by the transport itself, if any.
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
}

/// Parameters for opening a native consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeSubscribeRequest {
    pub destination: String,
    pub options: ProtocolOptions,
}

/// Establishes native connections.
#[async_trait]
pub trait NativeConnector: Send + Sync {
    /// Opens a connection to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn NativeConnection>>;
}

/// An open native connection or session.
#[async_trait]
pub trait NativeConnection: Send + Sync {
    /// Sends one message.
    async fn publish(&self, envelope: NativeEnvelope) -> anyhow::Result<PublishMetadata>;

    /// Opens a consumer that invokes `callback` once per inbound message.
    async fn subscribe(
        &self,
        request: NativeSubscribeRequest,
        callback: Arc<dyn NativeCallback>,
    ) -> anyhow::Result<Box<dyn NativeConsumer>>;

    /// Closes the connection.
    async fn disconnect(&self) -> anyhow::Result<()>;
}

/// An open native consumer.
#[async_trait]
pub trait NativeConsumer: Send + Sync {
    /// Stops delivery and releases the consumer.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Receives inbound messages on the native client's delivery task.
///
/// May be invoked concurrently for back-to-back messages.
pub trait NativeCallback: Send + Sync {
    fn on_message(&self, message: NativeInbound);
}
