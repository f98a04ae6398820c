//! HTTP connector: each publish is one request. Nothing to subscribe to.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use tracing::debug;

use super::{
    Endpoint, NativeCallback, NativeConnection, NativeConnector, NativeConsumer, NativeEnvelope,
    NativeSubscribeRequest, ProtocolOptions,
};
use crate::message::PublishMetadata;

/// Sends HTTP requests with a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NativeConnector for HttpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn NativeConnection>> {
        Ok(Arc::new(HttpConnection {
            client: self.client.clone(),
            endpoint: endpoint.clone(),
        }))
    }
}

struct HttpConnection {
    client: reqwest::Client,
    endpoint: Endpoint,
}

#[async_trait]
impl NativeConnection for HttpConnection {
    async fn publish(&self, envelope: NativeEnvelope) -> anyhow::Result<PublishMetadata> {
        let (method, query) = match envelope.options {
            ProtocolOptions::Http(options) => (options.method, options.query),
            _ => ("POST".to_string(), Vec::new()),
        };
        let method = Method::from_bytes(method.as_bytes())
            .with_context(|| format!("invalid HTTP method {method}"))?;
        let url = self.endpoint.url(&envelope.destination);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .query(&query)
            .header(CONTENT_TYPE, envelope.content_type.as_str());
        for (name, value) in &envelope.headers {
            request = request.header(
                HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("invalid header name {name}"))?,
                HeaderValue::from_bytes(value)
                    .with_context(|| format!("invalid value for header {name}"))?,
            );
        }

        let response = request
            .body(envelope.payload)
            .send()
            .await
            .with_context(|| format!("{method} {url} failed"))?
            .error_for_status()?;
        let status = response.status().as_u16();
        debug!(%method, url = %url, status, "http publish");
        Ok(PublishMetadata::Http { status })
    }

    async fn subscribe(
        &self,
        request: NativeSubscribeRequest,
        _callback: Arc<dyn NativeCallback>,
    ) -> anyhow::Result<Box<dyn NativeConsumer>> {
        bail!("HTTP cannot subscribe to {}", request.destination)
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
