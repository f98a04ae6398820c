//! End-to-end behavior of the client facade over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use bindwire_client::native::memory::json_inbound;
use bindwire_client::{
    AsyncApiClient, ChannelObserver, ClientConfig, ClientError, DecodedMessage, InMemoryBroker,
    PublishRequest, ServerSelector, SubscribeRequest,
};
use bindwire_core::AsyncApiDocument;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

fn make_client(spec: Value, broker: &InMemoryBroker) -> AsyncApiClient {
    AsyncApiClient::builder(AsyncApiDocument::from_value(spec).unwrap())
        .with_standard_adapters(Arc::new(broker.clone()))
        .build()
        .unwrap()
}

async fn next(rx: &mut UnboundedReceiver<Arc<DecodedMessage>>) -> Arc<DecodedMessage> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("stream completed")
}

async fn assert_quiet(rx: &mut UnboundedReceiver<Arc<DecodedMessage>>) {
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "unexpected message"
    );
}

fn orders_spec(protocol: &str) -> Value {
    json!({
        "servers": {"main": {"host": "broker.local", "protocol": protocol}},
        "channels": {"orders": {
            "address": "orders",
            "messages": {
                "Created": {
                    "payload": {
                        "type": "object",
                        "properties": {"kind": {"const": "created"}, "id": {"type": "string"}},
                        "required": ["kind"]
                    },
                    "correlationId": {"location": "$message.payload#/id"}
                },
                "Deleted": {
                    "payload": {
                        "type": "object",
                        "properties": {"kind": {"const": "deleted"}},
                        "required": ["kind"]
                    }
                }
            }
        }},
        "operations": {
            "sendOrder": {"action": "send", "channel": "orders"},
            "onOrder": {"action": "receive", "channel": "orders"}
        }
    })
}

#[tokio::test]
async fn publish_with_undeclared_header_succeeds() {
    let broker = InMemoryBroker::new();
    let client = make_client(
        json!({
            "servers": {"main": {"host": "kafka.local:9092", "protocol": "kafka"}},
            "channels": {"points": {
                "address": "points",
                "messages": {"Point": {
                    "contentType": "application/json",
                    "payload": {"type": "object", "properties": {"x": {"type": "number"}}}
                }}
            }},
            "operations": {"sendPoint": {"action": "send", "channel": "points"}}
        }),
        &broker,
    );

    let receipt = client
        .publish(PublishRequest::new("sendPoint", json!({"x": 1})).header("type", "A"))
        .await
        .unwrap();

    assert_eq!(receipt.message_name, "Point");
    assert_eq!(receipt.destination, "points");
    let envelopes = broker.published_envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].content_type, "application/json");
    assert!(envelopes[0]
        .headers
        .iter()
        .any(|(name, value)| name == "type" && value.as_ref() == b"A"));
}

#[tokio::test]
async fn observer_receives_the_matching_message_once() {
    let broker = InMemoryBroker::new();
    let client = make_client(orders_spec("kafka"), &broker);
    let (observer, mut rx) = ChannelObserver::channel();
    let _handle = client
        .subscribe(SubscribeRequest::new("onOrder"), observer)
        .await
        .unwrap();

    client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "created", "id": "o-1"})))
        .await
        .unwrap();

    let message = next(&mut rx).await;
    assert_eq!(message.message_name, "Created");
    assert_eq!(message.operation_id, "onOrder");
    assert_eq!(message.correlation_id.as_deref(), Some("o-1"));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn unmatched_payload_is_dropped_and_subscription_stays_active() {
    let broker = InMemoryBroker::new();
    let client = make_client(orders_spec("kafka"), &broker);
    let (observer, mut rx) = ChannelObserver::channel();
    let handle = client
        .subscribe(SubscribeRequest::new("onOrder"), observer)
        .await
        .unwrap();

    assert_eq!(broker.inject(json_inbound("orders", &json!({"kind": "shipped"}))), 1);
    assert_quiet(&mut rx).await;
    assert!(!handle.is_disposed());

    client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.message_name, "Deleted");
}

#[tokio::test]
async fn concurrent_subscribers_share_one_native_consumer() {
    let broker = InMemoryBroker::new();
    let client = Arc::new(make_client(orders_spec("nats"), &broker));
    let (first, mut first_rx) = ChannelObserver::channel();
    let (second, mut second_rx) = ChannelObserver::channel();

    let (a, b) = tokio::join!(
        client.subscribe(SubscribeRequest::new("onOrder"), first),
        client.subscribe(SubscribeRequest::new("onOrder"), second),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(a.subscription(), b.subscription()));
    assert_eq!(broker.stats().consumers_opened, 1);

    client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .unwrap();
    assert_eq!(next(&mut first_rx).await.message_name, "Deleted");
    assert_eq!(next(&mut second_rx).await.message_name, "Deleted");

    // One handle gone: the other keeps receiving.
    a.dispose().await;
    a.dispose().await;
    assert_eq!(broker.stats().active_consumers(), 1);
    client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .unwrap();
    assert_eq!(next(&mut second_rx).await.message_name, "Deleted");

    // Last handle closes the native consumer.
    b.dispose().await;
    assert_eq!(broker.stats().active_consumers(), 0);
    assert!(b.subscription().is_disposed());
}

#[tokio::test]
async fn subscribing_again_after_last_handle_opens_a_new_consumer() {
    let broker = InMemoryBroker::new();
    let client = make_client(orders_spec("mqtt"), &broker);
    let (observer, _rx) = ChannelObserver::channel();
    let handle = client
        .subscribe(SubscribeRequest::new("onOrder"), observer)
        .await
        .unwrap();
    handle.dispose().await;

    let (observer, mut rx) = ChannelObserver::channel();
    let _handle = client
        .subscribe(SubscribeRequest::new("onOrder"), observer)
        .await
        .unwrap();
    let stats = broker.stats();
    assert_eq!(stats.consumers_opened, 2);
    assert_eq!(stats.active_consumers(), 1);

    client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "created", "id": "o-9"})))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.correlation_id.as_deref(), Some("o-9"));
}

#[tokio::test]
async fn dispose_is_idempotent_and_completes_observers() {
    let broker = InMemoryBroker::new();
    let client = make_client(orders_spec("amqp"), &broker);
    let (observer, mut rx) = ChannelObserver::channel();
    let handle = client
        .subscribe(SubscribeRequest::new("onOrder"), observer)
        .await
        .unwrap();
    client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.message_name, "Deleted");

    client.dispose().await;
    client.dispose().await;
    handle.dispose().await;

    assert!(rx.recv().await.is_none());
    let stats = broker.stats();
    assert_eq!(stats.active_consumers(), 0);
    assert_eq!(stats.open_connections(), 0);
    assert!(matches!(
        client.subscribe(SubscribeRequest::new("onOrder"), ChannelObserver::channel().0).await,
        Err(ClientError::Disposed)
    ));
}

#[tokio::test]
async fn cancelled_connect_leaves_no_open_connection() {
    let broker = InMemoryBroker::new();
    broker.set_connect_delay(Some(Duration::from_millis(200)));
    let client = make_client(orders_spec("kafka"), &broker);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });
    let err = client
        .subscribe(
            SubscribeRequest::new("onOrder").cancellation(token),
            ChannelObserver::channel().0,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled));

    // The abandoned connect finishes in the background and is torn down.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let stats = broker.stats();
    assert_eq!(stats.open_connections(), 0);
    assert_eq!(stats.active_consumers(), 0);

    broker.set_connect_delay(None);
    let _handle = client
        .subscribe(SubscribeRequest::new("onOrder"), ChannelObserver::channel().0)
        .await
        .unwrap();
    assert_eq!(broker.stats().active_consumers(), 1);
}

#[tokio::test]
async fn connect_timeout_is_reported() {
    let broker = InMemoryBroker::new();
    broker.set_connect_delay(Some(Duration::from_millis(300)));
    let client = AsyncApiClient::builder(AsyncApiDocument::from_value(orders_spec("kafka")).unwrap())
        .config(ClientConfig {
            connect_timeout: Duration::from_millis(30),
            ..ClientConfig::default()
        })
        .with_standard_adapters(Arc::new(broker.clone()))
        .build()
        .unwrap();

    let err = client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
}

#[tokio::test]
async fn redis_correlation_comes_from_payload_only() {
    let broker = InMemoryBroker::new();
    let client = make_client(
        json!({
            "servers": {"cache": {"host": "localhost:6379", "protocol": "redis"}},
            "channels": {"events": {
                "address": "events",
                "messages": {
                    "ByHeader": {
                        "payload": {"type": "object", "required": ["a"]},
                        "headers": {"type": "object", "required": ["traceId"]},
                        "correlationId": {"location": "$message.header#/traceId"}
                    },
                    "ByPayload": {
                        "payload": {"type": "object", "required": ["b"]},
                        "correlationId": {"location": "$message.payload#/b"}
                    }
                }
            }},
            "operations": {
                "sendEvent": {"action": "send", "channel": "events"},
                "onEvent": {"action": "receive", "channel": "events"}
            }
        }),
        &broker,
    );
    let (observer, mut rx) = ChannelObserver::channel();
    let _handle = client
        .subscribe(SubscribeRequest::new("onEvent"), observer)
        .await
        .unwrap();

    // Headers are dropped on the wire, so no correlation id is generated.
    let receipt = client
        .publish(
            PublishRequest::new("sendEvent", json!({"a": 1}))
                .message("ByHeader")
                .header("traceId", "t-1"),
        )
        .await
        .unwrap();
    assert_eq!(receipt.correlation_id, None);
    assert!(broker.published_envelopes()[0].headers.is_empty());
    let by_header = next(&mut rx).await;
    assert_eq!(by_header.message_name, "ByHeader");
    assert_eq!(by_header.correlation_id, None);

    client
        .publish(PublishRequest::new("sendEvent", json!({"b": "p-7"})))
        .await
        .unwrap();
    let by_payload = next(&mut rx).await;
    assert_eq!(by_payload.message_name, "ByPayload");
    assert_eq!(by_payload.correlation_id.as_deref(), Some("p-7"));
}

#[tokio::test]
async fn channel_parameters_fill_the_address() {
    let broker = InMemoryBroker::new();
    let client = make_client(
        json!({
            "servers": {"edge": {"host": "mqtt.local", "protocol": "mqtt"}},
            "channels": {"userEvents": {
                "address": "users/{userId}/events",
                "parameters": {"userId": {}},
                "messages": {"UserEvent": {"payload": {"type": "object"}}}
            }},
            "operations": {
                "sendUserEvent": {"action": "send", "channel": "userEvents"},
                "onUserEvent": {"action": "receive", "channel": "userEvents"}
            }
        }),
        &broker,
    );

    // Unset parameter subscribes to every user through the MQTT wildcard.
    let (all, mut all_rx) = ChannelObserver::channel();
    let _all = client
        .subscribe(SubscribeRequest::new("onUserEvent"), all)
        .await
        .unwrap();
    let (one, mut one_rx) = ChannelObserver::channel();
    let _one = client
        .subscribe(SubscribeRequest::new("onUserEvent").parameter("userId", "u-2"), one)
        .await
        .unwrap();
    assert_eq!(broker.stats().consumers_opened, 2);

    let receipt = client
        .publish(PublishRequest::new("sendUserEvent", json!({})).parameter("userId", "u-1"))
        .await
        .unwrap();
    assert_eq!(receipt.destination, "users/u-1/events");
    assert_eq!(next(&mut all_rx).await.destination, "users/u-1/events");
    assert_quiet(&mut one_rx).await;

    let err = client
        .publish(PublishRequest::new("sendUserEvent", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::MissingParameter { .. }));
}

#[tokio::test]
async fn server_can_be_chosen_by_name() {
    let broker = InMemoryBroker::new();
    let mut spec = orders_spec("kafka");
    spec["servers"]["backup"] = json!({"host": "backup.local", "protocol": "nats"});
    let client = make_client(spec, &broker);

    let default = client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .unwrap();
    assert_eq!(default.protocol, "kafka");

    let chosen = client
        .publish(
            PublishRequest::new("sendOrder", json!({"kind": "deleted"}))
                .server(ServerSelector::Name("backup".into())),
        )
        .await
        .unwrap();
    assert_eq!(chosen.protocol, "nats");
    assert_eq!(broker.stats().connects, 2);
}

#[tokio::test]
async fn invalid_payload_is_rejected_before_sending() {
    let broker = InMemoryBroker::new();
    let client = make_client(orders_spec("stomp"), &broker);
    let err = client
        .publish(PublishRequest::new("sendOrder", json!({"kind": 5})))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Match(_) | ClientError::Validation { .. }));
    assert_eq!(broker.stats().published, 0);
}

#[tokio::test]
async fn string_headers_that_look_like_json_survive_the_round_trip() {
    let broker = InMemoryBroker::new();
    let client = make_client(
        json!({
            "servers": {"main": {"host": "kafka.local:9092", "protocol": "kafka"}},
            "channels": {"releases": {
                "address": "releases",
                "messages": {"Release": {
                    "headers": {
                        "type": "object",
                        "properties": {"version": {"type": "string"}},
                        "required": ["version"]
                    },
                    "payload": {"type": "object"}
                }}
            }},
            "operations": {
                "sendRelease": {"action": "send", "channel": "releases"},
                "onRelease": {"action": "receive", "channel": "releases"}
            }
        }),
        &broker,
    );
    let (observer, mut rx) = ChannelObserver::channel();
    let _handle = client
        .subscribe(SubscribeRequest::new("onRelease"), observer)
        .await
        .unwrap();

    for version in ["1", "true", "null", "v2"] {
        client
            .publish(PublishRequest::new("sendRelease", json!({})).header("version", version))
            .await
            .unwrap();
        let message = next(&mut rx).await;
        assert_eq!(message.message_name, "Release");
        assert_eq!(message.headers.get("version"), Some(&json!(version)));
    }
}

#[tokio::test]
async fn message_in_unsupported_schema_format_is_still_delivered() {
    let broker = InMemoryBroker::new();
    let client = make_client(
        json!({
            "servers": {"main": {"host": "kafka.local:9092", "protocol": "kafka"}},
            "channels": {"ticks": {
                "address": "ticks",
                "messages": {"Tick": {
                    "schemaFormat": "application/vnd.apache.avro;version=1.9.0",
                    "payload": {"type": "record", "name": "Tick", "fields": [{"name": "price", "type": "double"}]}
                }}
            }},
            "operations": {
                "sendTick": {"action": "send", "channel": "ticks"},
                "onTick": {"action": "receive", "channel": "ticks"}
            }
        }),
        &broker,
    );
    let (observer, mut rx) = ChannelObserver::channel();
    let _handle = client
        .subscribe(SubscribeRequest::new("onTick"), observer)
        .await
        .unwrap();

    client
        .publish(PublishRequest::new("sendTick", json!({"price": 1.5})))
        .await
        .unwrap();
    let message = next(&mut rx).await;
    assert_eq!(message.message_name, "Tick");
    assert_eq!(message.payload, json!({"price": 1.5}));
}

#[tokio::test]
async fn broker_rejected_publish_returns_no_receipt() {
    let broker = InMemoryBroker::new();
    let client = make_client(orders_spec("kafka"), &broker);
    broker.fail_publishes(true);

    let err = client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ClientError::Connection { .. }));
    assert_eq!(broker.stats().published, 0);

    broker.fail_publishes(false);
    let receipt = client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .unwrap();
    assert_eq!(receipt.message_name, "Deleted");
    assert_eq!(broker.stats().published, 1);
}

#[tokio::test]
async fn failed_subscribe_can_be_retried() {
    let broker = InMemoryBroker::new();
    let client = make_client(orders_spec("nats"), &broker);
    broker.fail_next_subscribes(1);

    let err = client
        .subscribe(SubscribeRequest::new("onOrder"), ChannelObserver::channel().0)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ClientError::Connection { .. }));
    assert_eq!(broker.stats().active_consumers(), 0);

    let (observer, mut rx) = ChannelObserver::channel();
    let _handle = client
        .subscribe(SubscribeRequest::new("onOrder"), observer)
        .await
        .unwrap();
    let stats = broker.stats();
    assert_eq!(stats.consumers_opened, 1);
    assert_eq!(stats.active_consumers(), 1);

    client
        .publish(PublishRequest::new("sendOrder", json!({"kind": "deleted"})))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.message_name, "Deleted");
}
