//! NATS core connector.
//!
//! One `async-nats` client per endpoint, shared by publishes and consumers.
//! Envelope headers become NATS headers; a queue group turns a consumer into
//! a queue subscription.

use std::sync::Arc;

use anyhow::Context;
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    Endpoint, NativeCallback, NativeConnection, NativeConnector, NativeConsumer, NativeEnvelope,
    NativeInbound, NativeSubscribeRequest, ProtocolOptions,
};
use crate::message::PublishMetadata;

/// Connects to NATS servers declared with the `nats` protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

#[async_trait]
impl NativeConnector for NatsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn NativeConnection>> {
        let url = endpoint.url("");
        let client = async_nats::connect(url.as_str())
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        debug!(endpoint = %endpoint.key(), "nats connection opened");
        Ok(Arc::new(NatsConnection { client }))
    }
}

struct NatsConnection {
    client: async_nats::Client,
}

#[async_trait]
impl NativeConnection for NatsConnection {
    async fn publish(&self, envelope: NativeEnvelope) -> anyhow::Result<PublishMetadata> {
        let reply_to = match &envelope.options {
            ProtocolOptions::Nats(options) => options.reply_to.clone(),
            _ => None,
        };
        let headers = header_map(&envelope.headers);
        let subject = envelope.destination.clone();
        let sent = match reply_to {
            Some(reply) => {
                self.client
                    .publish_with_reply_and_headers(subject, reply, headers, envelope.payload)
                    .await
            }
            None => {
                self.client
                    .publish_with_headers(subject, headers, envelope.payload)
                    .await
            }
        };
        sent.with_context(|| format!("failed to publish to {}", envelope.destination))?;
        self.client.flush().await.context("nats flush failed")?;
        Ok(PublishMetadata::None)
    }

    async fn subscribe(
        &self,
        request: NativeSubscribeRequest,
        callback: Arc<dyn NativeCallback>,
    ) -> anyhow::Result<Box<dyn NativeConsumer>> {
        let queue_group = match &request.options {
            ProtocolOptions::Nats(options) => options.queue_group.clone(),
            _ => None,
        };
        let subject = request.destination.clone();
        let subscribed = match &queue_group {
            Some(group) => self.client.queue_subscribe(subject, group.clone()).await,
            None => self.client.subscribe(subject).await,
        };
        let mut subscriber =
            subscribed.with_context(|| format!("failed to subscribe to {}", request.destination))?;

        let destination = request.destination.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                callback.on_message(NativeInbound {
                    destination: message.subject.to_string(),
                    headers: message.headers.as_ref().map(header_pairs).unwrap_or_default(),
                    payload: message.payload,
                    content_type: None,
                    correlation_id: None,
                });
            }
            warn!(destination = %destination, "nats subscription ended");
        });

        debug!(destination = %request.destination, queue_group = ?queue_group, "nats consumer opened");
        Ok(Box::new(NatsConsumer {
            task: Mutex::new(Some(task)),
        }))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        // The connection closes when the last client clone drops.
        self.client.flush().await.context("nats flush failed")?;
        Ok(())
    }
}

struct NatsConsumer {
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl NativeConsumer for NatsConsumer {
    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the subscriber unsubscribes.
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

fn header_map(headers: &[(String, Bytes)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), &*String::from_utf8_lossy(value));
    }
    map
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, Bytes)> {
    headers
        .iter()
        .flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.to_string(), Bytes::from(value.to_string())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip_through_header_map() {
        let headers = vec![
            ("correlationId".to_string(), Bytes::from_static(b"c-7")),
            ("version".to_string(), Bytes::from_static(b"\"1\"")),
        ];
        let map = header_map(&headers);
        assert_eq!(map.get("correlationId").map(ToString::to_string).as_deref(), Some("c-7"));

        let mut pairs = header_pairs(&map);
        pairs.sort();
        assert_eq!(pairs, headers);
    }
}
