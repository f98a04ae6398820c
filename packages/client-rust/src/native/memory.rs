//! Loopback broker implementing the native interface in-process.
//!
//! Every endpoint key is its own namespace, so two servers never see each
//! other's traffic. Each consumer gets a dedicated delivery task fed by an
//! unbounded mpsc channel, mirroring how native clients call back from
//! their own tasks. Failure injection and counters make connection and
//! consumer lifecycles observable in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    Endpoint, NativeCallback, NativeConnection, NativeConnector, NativeConsumer, NativeEnvelope,
    NativeInbound, NativeSubscribeRequest, ProtocolOptions,
};
use crate::message::PublishMetadata;

/// Published envelopes kept for inspection; older ones are dropped.
pub const ENVELOPE_HISTORY: usize = 1024;

/// Snapshot of broker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStats {
    pub connects: u64,
    pub disconnects: u64,
    pub consumers_opened: u64,
    pub consumers_closed: u64,
    pub published: u64,
}

impl BrokerStats {
    #[must_use]
    pub fn open_connections(&self) -> u64 {
        self.connects - self.disconnects
    }

    #[must_use]
    pub fn active_consumers(&self) -> u64 {
        self.consumers_opened - self.consumers_closed
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_connects: u32,
    failing_subscribes: u32,
    connect_delay: Option<Duration>,
    fail_publishes: bool,
}

struct ConsumerEntry {
    id: u64,
    namespace: String,
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<NativeInbound>,
}

#[derive(Default)]
struct BrokerInner {
    consumers: RwLock<Vec<ConsumerEntry>>,
    next_consumer: AtomicU64,
    sequence: AtomicU64,
    round_robin: AtomicU64,
    offsets: Mutex<HashMap<String, i64>>,
    envelopes: Mutex<VecDeque<NativeEnvelope>>,
    faults: Mutex<Faults>,
    connects: AtomicU64,
    disconnects: AtomicU64,
    consumers_opened: AtomicU64,
    consumers_closed: AtomicU64,
    published: AtomicU64,
}

/// In-process broker usable as a [`NativeConnector`] for every protocol.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.faults.lock().failing_connects = count;
    }

    /// The next `count` subscribe attempts fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.inner.faults.lock().failing_subscribes = count;
    }

    /// Delays every connect attempt.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.inner.faults.lock().connect_delay = delay;
    }

    /// Makes every publish fail until reset.
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.faults.lock().fail_publishes = fail;
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let inner = &self.inner;
        BrokerStats {
            connects: inner.connects.load(Ordering::SeqCst),
            disconnects: inner.disconnects.load(Ordering::SeqCst),
            consumers_opened: inner.consumers_opened.load(Ordering::SeqCst),
            consumers_closed: inner.consumers_closed.load(Ordering::SeqCst),
            published: inner.published.load(Ordering::SeqCst),
        }
    }

    /// The last [`ENVELOPE_HISTORY`] envelopes published, oldest first.
    #[must_use]
    pub fn published_envelopes(&self) -> Vec<NativeEnvelope> {
        self.inner.envelopes.lock().iter().cloned().collect()
    }

    /// Delivers a raw message to matching consumers in every namespace.
    ///
    /// Returns the number of consumers it was queued for.
    pub fn inject(&self, message: NativeInbound) -> usize {
        self.inner.deliver(None, &message)
    }
}

impl BrokerInner {
    fn deliver(&self, namespace: Option<&str>, message: &NativeInbound) -> usize {
        let consumers = self.consumers.read();
        let matching: Vec<&ConsumerEntry> = consumers
            .iter()
            .filter(|c| namespace.map_or(true, |ns| c.namespace == ns))
            .filter(|c| topic_matches(&c.pattern, &message.destination))
            .collect();

        // Queue group members share the load: one member per group.
        let mut groups: HashMap<&str, Vec<&ConsumerEntry>> = HashMap::new();
        let mut targets: Vec<&ConsumerEntry> = Vec::new();
        for consumer in matching {
            match consumer.queue_group.as_deref() {
                Some(group) => groups.entry(group).or_default().push(consumer),
                None => targets.push(consumer),
            }
        }
        for members in groups.into_values() {
            #[allow(clippy::cast_possible_truncation)]
            let pick = self.round_robin.fetch_add(1, Ordering::Relaxed) as usize % members.len();
            targets.push(members[pick]);
        }

        targets
            .into_iter()
            .filter(|consumer| consumer.tx.send(message.clone()).is_ok())
            .count()
    }

    fn remove_consumer(&self, id: u64) {
        self.consumers.write().retain(|c| c.id != id);
    }

    fn next_offset(&self, topic: &str) -> i64 {
        let mut offsets = self.offsets.lock();
        let offset = offsets.entry(topic.to_string()).or_insert(-1);
        *offset += 1;
        *offset
    }
}

#[async_trait]
impl NativeConnector for InMemoryBroker {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn NativeConnection>> {
        let delay = {
            let mut faults = self.inner.faults.lock();
            if faults.failing_connects > 0 {
                faults.failing_connects -= 1;
                bail!("connection refused by {}", endpoint.host);
            }
            faults.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        debug!(endpoint = %endpoint.key(), "in-memory connection opened");
        Ok(Arc::new(MemoryConnection {
            broker: Arc::clone(&self.inner),
            namespace: endpoint.key(),
            protocol: endpoint.protocol.to_ascii_lowercase(),
            open: AtomicBool::new(true),
        }))
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    namespace: String,
    protocol: String,
    open: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> anyhow::Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            bail!("connection to {} is closed", self.namespace);
        }
        Ok(())
    }

    /// Whether the transport carries a content type of its own.
    fn carries_content_type(&self) -> bool {
        !matches!(family(&self.protocol), "kafka" | "redis" | "nats" | "ws")
    }

    fn metadata(&self, envelope: &NativeEnvelope, receivers: usize) -> PublishMetadata {
        match family(&self.protocol) {
            "kafka" => {
                let partition = match &envelope.options {
                    ProtocolOptions::Kafka(options) => options.partition.unwrap_or(0),
                    _ => 0,
                };
                PublishMetadata::Kafka {
                    partition,
                    offset: self.broker.next_offset(&envelope.destination),
                }
            }
            "redis" => PublishMetadata::Redis {
                receivers: receivers as u64,
            },
            "http" => PublishMetadata::Http { status: 200 },
            "amqp" => PublishMetadata::Amqp {
                delivery_tag: self.broker.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            },
            _ => PublishMetadata::None,
        }
    }
}

#[async_trait]
impl NativeConnection for MemoryConnection {
    async fn publish(&self, envelope: NativeEnvelope) -> anyhow::Result<PublishMetadata> {
        self.ensure_open()?;
        if self.broker.faults.lock().fail_publishes {
            bail!("broker rejected publish to {}", envelope.destination);
        }

        let inbound = NativeInbound {
            destination: envelope.destination.clone(),
            payload: envelope.payload.clone(),
            headers: envelope.headers.clone(),
            content_type: self
                .carries_content_type()
                .then(|| envelope.content_type.clone()),
            correlation_id: envelope.correlation_id.clone(),
        };
        let receivers = self.broker.deliver(Some(&self.namespace), &inbound);
        trace!(destination = %envelope.destination, receivers, "in-memory publish");

        let metadata = self.metadata(&envelope, receivers);
        self.broker.published.fetch_add(1, Ordering::SeqCst);
        let mut history = self.broker.envelopes.lock();
        if history.len() == ENVELOPE_HISTORY {
            history.pop_front();
        }
        history.push_back(envelope);
        drop(history);
        Ok(metadata)
    }

    async fn subscribe(
        &self,
        request: NativeSubscribeRequest,
        callback: Arc<dyn NativeCallback>,
    ) -> anyhow::Result<Box<dyn NativeConsumer>> {
        self.ensure_open()?;
        {
            let mut faults = self.broker.faults.lock();
            if faults.failing_subscribes > 0 {
                faults.failing_subscribes -= 1;
                bail!("broker rejected subscription to {}", request.destination);
            }
        }

        let queue_group = match &request.options {
            ProtocolOptions::Nats(options) => options.queue_group.clone(),
            ProtocolOptions::Kafka(options) => options.group_id.clone(),
            _ => None,
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<NativeInbound>();
        let id = self.broker.next_consumer.fetch_add(1, Ordering::Relaxed);
        self.broker.consumers.write().push(ConsumerEntry {
            id,
            namespace: self.namespace.clone(),
            pattern: request.destination.clone(),
            queue_group,
            tx,
        });
        self.broker.consumers_opened.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                callback.on_message(message);
            }
        });

        debug!(destination = %request.destination, consumer = id, "in-memory consumer opened");
        Ok(Box::new(MemoryConsumer {
            broker: Arc::clone(&self.broker),
            id,
            closed: AtomicBool::new(false),
        }))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.disconnects.fetch_add(1, Ordering::SeqCst);
            debug!(endpoint = %self.namespace, "in-memory connection closed");
        }
        Ok(())
    }
}

struct MemoryConsumer {
    broker: Arc<BrokerInner>,
    id: u64,
    closed: AtomicBool,
}

#[async_trait]
impl NativeConsumer for MemoryConsumer {
    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            bail!("consumer {} already closed", self.id);
        }
        // Dropping the sender ends the delivery task.
        self.broker.remove_consumer(self.id);
        self.broker.consumers_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn family(protocol: &str) -> &'static str {
    match protocol {
        p if p.starts_with("kafka") => "kafka",
        p if p.contains("mqtt") => "mqtt",
        p if p.starts_with("amqp") => "amqp",
        p if p.starts_with("stomp") => "stomp",
        "nats" => "nats",
        "redis" => "redis",
        "ws" | "wss" => "ws",
        "http" | "https" => "http",
        _ => "other",
    }
}

/// Topic matching with single-level (`+`, `*`) and multi-level (`#`, `>`)
/// wildcards. Both `/` and `.` separate levels.
pub(crate) fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    let is_separator = |c: char| c == '/' || c == '.';
    let mut levels = topic.split(is_separator);
    for expected in pattern.split(is_separator) {
        match expected {
            "#" | ">" => return true,
            "+" | "*" => {
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

/// Convenience for tests and tools: an inbound message with a JSON body.
#[must_use]
pub fn json_inbound(destination: &str, payload: &serde_json::Value) -> NativeInbound {
    NativeInbound {
        destination: destination.to_string(),
        payload: Bytes::from(payload.to_string()),
        headers: Vec::new(),
        content_type: None,
        correlation_id: None,
    }
}
