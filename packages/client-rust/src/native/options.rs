//! Native send and subscribe options, one variant per protocol family.
//!
//! Protocol adapters translate declarative binding metadata into these
//! values; native clients read them when building their wire frames.

/// Options attached to a native publish or subscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProtocolOptions {
    #[default]
    None,
    Kafka(KafkaOptions),
    Mqtt(MqttOptions),
    Amqp(AmqpOptions),
    Nats(NatsOptions),
    Stomp(StompOptions),
    WebSocket(WebSocketOptions),
    Http(HttpOptions),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KafkaOptions {
    /// Record key, already evaluated when declared as a runtime expression.
    pub key: Option<String>,
    pub partition: Option<i32>,
    pub client_id: Option<String>,
    /// Consumer group, subscribe only.
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MqttOptions {
    /// 0, 1, or 2.
    pub qos: u8,
    pub retain: bool,
    /// Message expiry interval in seconds.
    pub message_expiry: Option<u32>,
    pub response_topic: Option<String>,
    pub payload_format_indicator: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpOptions {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub queue: Option<String>,
    /// 1 = transient, 2 = persistent.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<u64>,
    pub mandatory: bool,
    pub user_id: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub timestamp: bool,
    pub content_encoding: Option<String>,
    pub message_type: Option<String>,
    /// Manual acknowledgement, subscribe only.
    pub ack: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatsOptions {
    /// Queue group, subscribe only.
    pub queue_group: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StompOptions {
    /// `auto`, `client`, or `client-individual`; subscribe only.
    pub ack: Option<String>,
    /// Request a RECEIPT frame for SEND.
    pub receipt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSocketOptions {
    /// Handshake method.
    pub method: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Send binary frames instead of text frames.
    pub binary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOptions {
    pub method: String,
    pub query: Vec<(String, String)>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            method: "POST".to_string(),
            query: Vec::new(),
        }
    }
}
