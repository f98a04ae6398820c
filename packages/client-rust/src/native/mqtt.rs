//! MQTT 5 connector.
//!
//! One `rumqttc` client per endpoint. Its event loop runs on a pump task
//! that fans incoming publishes out to every consumer whose topic filter
//! matches. Envelope headers travel as user properties and the correlation
//! id as correlation data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    Endpoint, MqttOptions, NativeCallback, NativeConnection, NativeConnector, NativeConsumer,
    NativeEnvelope, NativeInbound, NativeSubscribeRequest, ProtocolOptions,
};
use crate::message::PublishMetadata;

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Connects to MQTT brokers.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    keep_alive: Duration,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
        }
    }
}

impl MqttConnector {
    #[must_use]
    pub fn with_keep_alive(keep_alive: Duration) -> Self {
        Self { keep_alive }
    }
}

#[async_trait]
impl NativeConnector for MqttConnector {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn NativeConnection>> {
        if endpoint.protocol_version.as_deref() == Some("3.1.1") {
            debug!(endpoint = %endpoint.key(), "connecting with MQTT 5 to a 3.1.1 server entry");
        }
        let (host, port) = broker_address(&endpoint.host)?;
        let client_id = format!("bindwire-{}", uuid::Uuid::new_v4().simple());
        let mut options = rumqttc::v5::MqttOptions::new(client_id, host, port);
        options.set_keep_alive(self.keep_alive);
        let (client, mut events) = AsyncClient::new(options, REQUEST_CAPACITY);

        loop {
            let event = events
                .poll()
                .await
                .with_context(|| format!("failed to connect to {}", endpoint.key()))?;
            if let Event::Incoming(Packet::ConnAck(_)) = event {
                break;
            }
        }
        debug!(endpoint = %endpoint.key(), "mqtt connection opened");

        let routes = Arc::new(Routes::default());
        let closing = CancellationToken::new();
        let pump = tokio::spawn(pump(events, Arc::clone(&routes), closing.clone()));
        Ok(Arc::new(MqttConnection {
            client,
            routes,
            closing,
            pump: Mutex::new(Some(pump)),
        }))
    }
}

async fn pump(mut events: EventLoop, routes: Arc<Routes>, closing: CancellationToken) {
    loop {
        match events.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let properties = publish.properties;
                routes.dispatch(&inbound(&publish.topic, publish.payload, properties));
            }
            Ok(_) => {}
            Err(_) if closing.is_cancelled() => break,
            Err(err) => {
                warn!(error = %err, "mqtt event loop failed, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    trace!("mqtt event loop finished");
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

struct Route {
    id: u64,
    filter: String,
    callback: Arc<dyn NativeCallback>,
}

#[derive(Default)]
struct Routes {
    next: AtomicU64,
    entries: RwLock<Vec<Route>>,
}

impl Routes {
    fn add(&self, filter: &str, callback: Arc<dyn NativeCallback>) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push(Route {
            id,
            filter: filter.to_string(),
            callback,
        });
        id
    }

    /// Removes a route; `true` when no other route uses its filter.
    fn remove(&self, id: u64, filter: &str) -> bool {
        let mut entries = self.entries.write();
        entries.retain(|route| route.id != id);
        !entries.iter().any(|route| route.filter == filter)
    }

    fn dispatch(&self, message: &NativeInbound) {
        let callbacks: Vec<Arc<dyn NativeCallback>> = self
            .entries
            .read()
            .iter()
            .filter(|route| filter_matches(&route.filter, &message.destination))
            .map(|route| Arc::clone(&route.callback))
            .collect();
        for callback in callbacks {
            callback.on_message(message.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct MqttConnection {
    client: AsyncClient,
    routes: Arc<Routes>,
    closing: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl NativeConnection for MqttConnection {
    async fn publish(&self, envelope: NativeEnvelope) -> anyhow::Result<PublishMetadata> {
        let options = match &envelope.options {
            ProtocolOptions::Mqtt(options) => options.clone(),
            _ => MqttOptions::default(),
        };
        let properties = publish_properties(&envelope, &options);
        self.client
            .publish_with_properties(
                envelope.destination.clone(),
                qos(options.qos),
                options.retain,
                envelope.payload,
                properties,
            )
            .await
            .with_context(|| format!("failed to publish to {}", envelope.destination))?;
        Ok(PublishMetadata::None)
    }

    async fn subscribe(
        &self,
        request: NativeSubscribeRequest,
        callback: Arc<dyn NativeCallback>,
    ) -> anyhow::Result<Box<dyn NativeConsumer>> {
        let level = match &request.options {
            ProtocolOptions::Mqtt(options) => options.qos,
            _ => 0,
        };
        let filter = request.destination;
        let id = self.routes.add(&filter, callback);
        if let Err(err) = self.client.subscribe(filter.clone(), qos(level)).await {
            self.routes.remove(id, &filter);
            return Err(err).with_context(|| format!("failed to subscribe to {filter}"));
        }

        debug!(filter = %filter, qos = level, "mqtt consumer opened");
        Ok(Box::new(MqttConsumer {
            client: self.client.clone(),
            routes: Arc::clone(&self.routes),
            id,
            filter,
            closed: AtomicBool::new(false),
        }))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.closing.cancel();
        if let Err(err) = self.client.disconnect().await {
            debug!(error = %err, "mqtt disconnect request not sent");
        }
        let pump = self.pump.lock().take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        Ok(())
    }
}

struct MqttConsumer {
    client: AsyncClient,
    routes: Arc<Routes>,
    id: u64,
    filter: String,
    closed: AtomicBool,
}

#[async_trait]
impl NativeConsumer for MqttConsumer {
    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.routes.remove(self.id, &self.filter) {
            self.client
                .unsubscribe(self.filter.clone())
                .await
                .with_context(|| format!("failed to unsubscribe from {}", self.filter))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// `host[:port]`, with or without a scheme.
fn broker_address(host: &str) -> anyhow::Result<(String, u16)> {
    let host = host
        .split_once("://")
        .map_or(host, |(_, rest)| rest)
        .trim_end_matches('/');
    match host.rsplit_once(':') {
        Some((name, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in mqtt host {host}"))?;
            Ok((name.to_string(), port))
        }
        None => Ok((host.to_string(), DEFAULT_PORT)),
    }
}

fn publish_properties(envelope: &NativeEnvelope, options: &MqttOptions) -> PublishProperties {
    PublishProperties {
        payload_format_indicator: options.payload_format_indicator,
        message_expiry_interval: options.message_expiry,
        response_topic: options.response_topic.clone(),
        correlation_data: envelope.correlation_id.clone().map(Bytes::from),
        user_properties: envelope
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), String::from_utf8_lossy(value).into_owned()))
            .collect(),
        content_type: Some(envelope.content_type.clone()),
        ..PublishProperties::default()
    }
}

fn inbound(topic: &[u8], payload: Bytes, properties: Option<PublishProperties>) -> NativeInbound {
    let destination = String::from_utf8_lossy(topic).into_owned();
    let Some(properties) = properties else {
        return NativeInbound {
            destination,
            payload,
            headers: Vec::new(),
            content_type: None,
            correlation_id: None,
        };
    };
    NativeInbound {
        destination,
        payload,
        headers: properties
            .user_properties
            .into_iter()
            .map(|(name, value)| (name, Bytes::from(value)))
            .collect(),
        content_type: properties.content_type,
        correlation_id: properties
            .correlation_data
            .map(|data| String::from_utf8_lossy(&data).into_owned()),
    }
}

/// MQTT topic filter matching: `+` is one level, a trailing `#` any number.
fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for expected in filter.split('/') {
        match expected {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}
