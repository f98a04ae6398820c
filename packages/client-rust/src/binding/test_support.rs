//! Fixtures shared by the protocol adapter tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use bindwire_core::{AsyncApiDocument, DocumentModel, ExpressionCache, Headers, Value};
use tokio_util::sync::CancellationToken;

use super::{HandlerServices, ProtocolAdapter, ProtocolBindingHandler};
use crate::config::ClientConfig;
use crate::context::{ContextTemplate, OperationContext};
use crate::native::{InMemoryBroker, NativeEnvelope};

pub(crate) fn make_template(document: Value, operation: &str) -> Arc<ContextTemplate> {
    let resolved = AsyncApiDocument::from_value(document)
        .unwrap()
        .resolve_operation(operation)
        .unwrap();
    let server = Arc::clone(&resolved.servers[0]);
    Arc::new(
        ContextTemplate::build(resolved, server, &ClientConfig::default(), &ExpressionCache::new())
            .unwrap(),
    )
}

pub(crate) fn make_publish_ctx(
    document: Value,
    operation: &str,
    payload: Value,
    headers: Headers,
    parameters: &[(&str, &str)],
) -> OperationContext {
    let parameters: BTreeMap<String, String> = parameters
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    OperationContext::for_publish(
        make_template(document, operation),
        payload,
        headers,
        parameters,
        None,
        CancellationToken::new(),
    )
    .unwrap()
}

pub(crate) fn make_subscribe_ctx(document: Value, operation: &str) -> OperationContext {
    OperationContext::for_subscribe(
        make_template(document, operation),
        BTreeMap::new(),
        CancellationToken::new(),
    )
    .unwrap()
}

pub(crate) fn make_handler<A: ProtocolAdapter>(
    adapter: A,
    broker: &InMemoryBroker,
) -> ProtocolBindingHandler<A> {
    ProtocolBindingHandler::new(adapter, Arc::new(broker.clone()), HandlerServices::default())
}

/// The single envelope the broker has seen.
pub(crate) fn only_envelope(broker: &InMemoryBroker) -> NativeEnvelope {
    let mut envelopes = broker.published_envelopes();
    assert_eq!(envelopes.len(), 1, "expected exactly one published envelope");
    envelopes.remove(0)
}

pub(crate) fn header<'a>(envelope: &'a NativeEnvelope, name: &str) -> Option<&'a str> {
    envelope
        .headers
        .iter()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| std::str::from_utf8(v).ok())
}
