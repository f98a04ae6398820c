use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::binding::BindingHandler;
use crate::error::ClientError;

// ---------------------------------------------------------------------------
// BindingHandlerRegistry
// ---------------------------------------------------------------------------

/// Registry mapping protocol names to binding handlers.
///
/// Each protocol name is claimed by at most one handler. Lookup is a linear
/// scan in registration order; handlers are disposed in reverse order.
pub struct BindingHandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn BindingHandler>>>,
}

impl BindingHandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DuplicateProtocol`] when another handler already
    /// claims one of its protocols.
    pub fn register(&self, handler: Arc<dyn BindingHandler>) -> Result<(), ClientError> {
        let mut handlers = self.handlers.write();
        for existing in handlers.iter() {
            if let Some(protocol) = handler
                .protocols()
                .iter()
                .find(|p| existing.protocols().iter().any(|q| q.eq_ignore_ascii_case(p)))
            {
                return Err(ClientError::DuplicateProtocol {
                    protocol: (*protocol).to_string(),
                    existing: existing.name().to_string(),
                });
            }
        }
        debug!(handler = handler.name(), protocols = ?handler.protocols(), "registered binding handler");
        handlers.push(handler);
        Ok(())
    }

    /// The handler supporting `protocol` (case-insensitive) at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnsupportedProtocol`] when no handler matches.
    pub fn select(
        &self,
        protocol: &str,
        version: Option<&str>,
    ) -> Result<Arc<dyn BindingHandler>, ClientError> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.supports(protocol, version))
            .cloned()
            .ok_or_else(|| ClientError::UnsupportedProtocol {
                protocol: protocol.to_string(),
                version: version.map(str::to_string),
            })
    }

    /// `true` when some handler supports `protocol` at `version`.
    #[must_use]
    pub fn supports(&self, protocol: &str, version: Option<&str>) -> bool {
        self.handlers
            .read()
            .iter()
            .any(|h| h.supports(protocol, version))
    }

    /// Retrieve a handler by its name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn BindingHandler>> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.name() == name)
            .cloned()
    }

    /// Registered handlers in registration order.
    #[must_use]
    pub fn handlers(&self) -> Vec<Arc<dyn BindingHandler>> {
        self.handlers.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Dispose every handler in reverse registration order.
    pub async fn dispose_all(&self) {
        let handlers = self.handlers();
        for handler in handlers.iter().rev() {
            handler.dispose().await;
        }
    }
}

impl Default for BindingHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::context::OperationContext;
    use crate::message::PublishReceipt;
    use crate::subscription::SharedSubscription;

    /// Test handler that records dispose calls.
    struct TestHandler {
        handler_name: &'static str,
        protocols: &'static [&'static str],
        dispose_counter: AtomicU32,
        order_log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl TestHandler {
        fn new(
            name: &'static str,
            protocols: &'static [&'static str],
            order_log: Arc<parking_lot::Mutex<Vec<String>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler_name: name,
                protocols,
                dispose_counter: AtomicU32::new(0),
                order_log,
            })
        }
    }

    #[async_trait]
    impl BindingHandler for TestHandler {
        fn name(&self) -> &'static str {
            self.handler_name
        }

        fn protocols(&self) -> &'static [&'static str] {
            self.protocols
        }

        fn supports(&self, protocol: &str, version: Option<&str>) -> bool {
            version != Some("0.1") && self.protocols.iter().any(|p| p.eq_ignore_ascii_case(protocol))
        }

        async fn publish(&self, _ctx: &OperationContext) -> Result<PublishReceipt, ClientError> {
            Err(ClientError::Disposed)
        }

        async fn subscribe(&self, _ctx: &OperationContext) -> Result<Arc<SharedSubscription>, ClientError> {
            Err(ClientError::Disposed)
        }

        async fn dispose(&self) {
            self.dispose_counter.fetch_add(1, Ordering::SeqCst);
            self.order_log.lock().push(format!("dispose:{}", self.handler_name));
        }
    }

    fn log() -> Arc<parking_lot::Mutex<Vec<String>>> {
        Arc::new(parking_lot::Mutex::new(Vec::new()))
    }

    #[test]
    fn select_is_case_insensitive() {
        let registry = BindingHandlerRegistry::new();
        registry
            .register(TestHandler::new("mqtt", &["mqtt", "mqtts"], log()))
            .unwrap();
        assert_eq!(registry.select("MQTTS", None).unwrap().name(), "mqtt");
        assert!(registry.supports("Mqtt", Some("5")));
    }

    #[test]
    fn unknown_protocol_or_version_is_unsupported() {
        let registry = BindingHandlerRegistry::new();
        registry.register(TestHandler::new("kafka", &["kafka"], log())).unwrap();

        let err = registry.select("sqs", None).err().unwrap();
        assert!(matches!(err, ClientError::UnsupportedProtocol { ref protocol, .. } if protocol == "sqs"));

        let err = registry.select("kafka", Some("0.1")).err().unwrap();
        assert!(matches!(err, ClientError::UnsupportedProtocol { version: Some(ref v), .. } if v == "0.1"));
    }

    #[test]
    fn overlapping_protocols_are_rejected() {
        let registry = BindingHandlerRegistry::new();
        registry.register(TestHandler::new("amqp", &["amqp", "amqps"], log())).unwrap();
        let err = registry
            .register(TestHandler::new("rabbit", &["AMQPS"], log()))
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::DuplicateProtocol { ref protocol, ref existing } if protocol == "AMQPS" && existing == "amqp"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_by_name_and_handlers_keep_order() {
        let registry = BindingHandlerRegistry::new();
        assert!(registry.is_empty());
        registry.register(TestHandler::new("a", &["a"], log())).unwrap();
        registry.register(TestHandler::new("b", &["b"], log())).unwrap();
        assert!(registry.get_by_name("b").is_some());
        assert!(registry.get_by_name("c").is_none());
        let names: Vec<_> = registry.handlers().iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn dispose_all_runs_in_reverse_order() {
        let order = log();
        let registry = BindingHandlerRegistry::new();
        let first = TestHandler::new("first", &["p1"], Arc::clone(&order));
        let second = TestHandler::new("second", &["p2"], Arc::clone(&order));
        registry.register(first.clone()).unwrap();
        registry.register(second.clone()).unwrap();

        registry.dispose_all().await;

        assert_eq!(*order.lock(), vec!["dispose:second", "dispose:first"]);
        assert_eq!(first.dispose_counter.load(Ordering::SeqCst), 1);
        assert_eq!(second.dispose_counter.load(Ordering::SeqCst), 1);
    }
}
