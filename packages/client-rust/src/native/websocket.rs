//! WebSocket connector.
//!
//! A WebSocket URL is the destination, so sockets are opened per
//! destination: one shared writer socket for publishing, and one socket per
//! consumer whose frames become inbound messages.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{
    Endpoint, NativeCallback, NativeConnection, NativeConnector, NativeConsumer, NativeEnvelope,
    NativeInbound, NativeSubscribeRequest, ProtocolOptions, WebSocketOptions,
};
use crate::message::PublishMetadata;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = Arc<tokio::sync::Mutex<SplitSink<Socket, Message>>>;
/// Filled by the first publish to a destination; later publishes wait on it.
type WriterCell = Arc<OnceCell<Writer>>;

/// Opens WebSocket connections for `ws` and `wss` servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl NativeConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn NativeConnection>> {
        Ok(Arc::new(WebSocketConnection {
            endpoint: endpoint.clone(),
            writers: Mutex::new(HashMap::new()),
        }))
    }
}

/// Handshake URL with the binding's query appended.
fn handshake_url(endpoint: &Endpoint, destination: &str, options: &WebSocketOptions) -> String {
    let mut url = endpoint.url(destination);
    if !options.query.is_empty() {
        let query: Vec<String> = options
            .query
            .iter()
            .map(|(name, value)| {
                format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
            })
            .collect();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&query.join("&"));
    }
    url
}

async fn open(endpoint: &Endpoint, destination: &str, options: &ProtocolOptions) -> anyhow::Result<Socket> {
    let options = match options {
        ProtocolOptions::WebSocket(options) => options.clone(),
        _ => WebSocketOptions::default(),
    };
    let url = handshake_url(endpoint, destination, &options);
    let mut request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid websocket url {url}"))?;
    for (name, value) in &options.headers {
        request.headers_mut().insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }
    if !options.method.is_empty() && options.method != "GET" {
        debug!(method = %options.method, url = %url, "websocket handshake always uses GET");
    }

    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("websocket handshake with {url} failed"))?;
    debug!(url = %url, status = response.status().as_u16(), "websocket opened");
    Ok(socket)
}

struct WebSocketConnection {
    endpoint: Endpoint,
    writers: Mutex<HashMap<String, WriterCell>>,
}

impl WebSocketConnection {
    async fn writer(&self, envelope: &NativeEnvelope) -> anyhow::Result<Writer> {
        let cell = Arc::clone(
            self.writers
                .lock()
                .entry(envelope.destination.clone())
                .or_default(),
        );
        let writer = cell
            .get_or_try_init(|| async {
                let socket = open(&self.endpoint, &envelope.destination, &envelope.options).await?;
                let (sink, mut stream) = socket.split();
                // Frames pushed to the writer socket are not subscriptions; drain them.
                tokio::spawn(async move { while stream.next().await.is_some() {} });
                anyhow::Ok(Arc::new(tokio::sync::Mutex::new(sink)))
            })
            .await?;
        Ok(Arc::clone(writer))
    }
}

#[async_trait]
impl NativeConnection for WebSocketConnection {
    async fn publish(&self, envelope: NativeEnvelope) -> anyhow::Result<PublishMetadata> {
        let writer = self.writer(&envelope).await?;
        let binary = matches!(&envelope.options, ProtocolOptions::WebSocket(o) if o.binary);
        let frame = if binary {
            Message::binary(envelope.payload)
        } else {
            Message::text(String::from_utf8(envelope.payload.to_vec()).context("text frame is not UTF-8")?)
        };
        let sent = writer.lock().await.send(frame).await;
        if sent.is_err() {
            self.writers.lock().remove(&envelope.destination);
        }
        sent.with_context(|| format!("failed to send to {}", envelope.destination))?;
        Ok(PublishMetadata::None)
    }

    async fn subscribe(
        &self,
        request: NativeSubscribeRequest,
        callback: Arc<dyn NativeCallback>,
    ) -> anyhow::Result<Box<dyn NativeConsumer>> {
        let socket = open(&self.endpoint, &request.destination, &request.options).await?;
        let destination = request.destination.clone();
        let task = tokio::spawn(async move {
            let (_, mut stream) = socket.split();
            while let Some(frame) = stream.next().await {
                let payload = match frame {
                    Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                callback.on_message(NativeInbound {
                    destination: destination.clone(),
                    payload,
                    headers: Vec::new(),
                    content_type: None,
                    correlation_id: None,
                });
            }
            trace!(destination = %destination, "websocket reader finished");
        });
        Ok(Box::new(WebSocketConsumer {
            task: Mutex::new(Some(task)),
        }))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        let cells: Vec<WriterCell> = self.writers.lock().drain().map(|(_, cell)| cell).collect();
        for writer in cells.iter().filter_map(|cell| cell.get()) {
            let _ = writer.lock().await.close().await;
        }
        Ok(())
    }
}

struct WebSocketConsumer {
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl NativeConsumer for WebSocketConsumer {
    async fn close(&self) -> anyhow::Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}
