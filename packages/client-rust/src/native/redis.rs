//! Redis pub/sub connector.
//!
//! Publishes go through one multiplexed connection per endpoint. Every
//! consumer opens its own pub/sub connection; destinations containing `*`
//! are pattern subscriptions.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    Endpoint, NativeCallback, NativeConnection, NativeConnector, NativeConsumer, NativeEnvelope,
    NativeInbound, NativeSubscribeRequest,
};
use crate::message::PublishMetadata;

/// Connects to Redis servers declared with the `redis` protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

#[async_trait]
impl NativeConnector for RedisConnector {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn NativeConnection>> {
        let url = endpoint.url("");
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("invalid redis url {url}"))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        debug!(endpoint = %endpoint.key(), "redis connection opened");
        Ok(Arc::new(RedisConnection { client, publisher }))
    }
}

struct RedisConnection {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
}

#[async_trait]
impl NativeConnection for RedisConnection {
    async fn publish(&self, envelope: NativeEnvelope) -> anyhow::Result<PublishMetadata> {
        let mut conn = self.publisher.clone();
        let receivers: u64 = conn
            .publish(&envelope.destination, envelope.payload.to_vec())
            .await
            .with_context(|| format!("failed to publish to {}", envelope.destination))?;
        Ok(PublishMetadata::Redis { receivers })
    }

    async fn subscribe(
        &self,
        request: NativeSubscribeRequest,
        callback: Arc<dyn NativeCallback>,
    ) -> anyhow::Result<Box<dyn NativeConsumer>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open pub/sub connection")?;
        let pattern = request.destination.contains('*');
        if pattern {
            pubsub.psubscribe(&request.destination).await?;
        } else {
            pubsub.subscribe(&request.destination).await?;
        }

        let destination = request.destination.clone();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                callback.on_message(NativeInbound {
                    destination: message.get_channel_name().to_string(),
                    payload: Bytes::copy_from_slice(message.get_payload_bytes()),
                    headers: Vec::new(),
                    content_type: None,
                    correlation_id: None,
                });
            }
            warn!(destination = %destination, "redis pub/sub stream ended");
        });

        debug!(destination = %request.destination, pattern, "redis consumer opened");
        Ok(Box::new(RedisConsumer {
            task: Mutex::new(Some(task)),
        }))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        // Multiplexed connections close when the last clone drops.
        Ok(())
    }
}

struct RedisConsumer {
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl NativeConsumer for RedisConsumer {
    async fn close(&self) -> anyhow::Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}
