//! Shared subscriptions and per-observer handles.
//!
//! A [`SharedSubscription`] owns one native consumer and the
//! [`MessageStream`] its pipeline emits into. Every observer gets its own
//! [`SubscriptionHandle`]; disposing a handle detaches that observer, and
//! the last handle disposed closes the shared subscription. Disposal is
//! idempotent at both levels and closes the native consumer exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::native::NativeConsumer;
use crate::observer::MessageObserver;
use crate::stream::{MessageStream, ObserverId};
use crate::telemetry;

// ---------------------------------------------------------------------------
// SharedSubscription
// ---------------------------------------------------------------------------

/// One native consumer shared by every observer of an operation.
pub struct SharedSubscription {
    operation_id: String,
    protocol: String,
    destination: String,
    stream: Arc<MessageStream>,
    consumer: tokio::sync::Mutex<Option<Box<dyn NativeConsumer>>>,
    /// Live handle count; guards the closing transition.
    handles: Mutex<usize>,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl SharedSubscription {
    #[must_use]
    pub fn new(
        operation_id: impl Into<String>,
        protocol: impl Into<String>,
        destination: impl Into<String>,
        consumer: Box<dyn NativeConsumer>,
        stream: Arc<MessageStream>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            protocol: protocol.into(),
            destination: destination.into(),
            stream,
            consumer: tokio::sync::Mutex::new(Some(consumer)),
            handles: Mutex::new(0),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Adds an observer and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Disposed`] once the subscription is closing.
    pub fn attach(
        self: &Arc<Self>,
        observer: Arc<dyn MessageObserver>,
    ) -> Result<SubscriptionHandle, ClientError> {
        {
            let mut handles = self.handles.lock();
            if self.closing.load(Ordering::Acquire) {
                return Err(ClientError::Disposed);
            }
            *handles += 1;
        }

        match self.stream.attach(observer) {
            Some(observer_id) => Ok(SubscriptionHandle {
                subscription: Arc::clone(self),
                observer_id,
                disposed: AtomicBool::new(false),
            }),
            None => {
                *self.handles.lock() -= 1;
                Err(ClientError::Disposed)
            }
        }
    }

    /// Completes every observer and closes the native consumer. Idempotent.
    pub async fn dispose(&self) {
        {
            let _handles = self.handles.lock();
            self.closing.store(true, Ordering::Release);
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.stream.complete();
        let consumer = self.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            if let Err(err) = consumer.close().await {
                warn!(
                    operation = %self.operation_id,
                    destination = %self.destination,
                    error = %err,
                    "native consumer failed to close cleanly"
                );
            }
        }
        telemetry::record_subscription_closed(&self.protocol);
        debug!(operation = %self.operation_id, destination = %self.destination, "subscription closed");
    }

    /// Drops one handle; the last one closes the subscription.
    async fn release(&self) {
        let last = {
            let mut handles = self.handles.lock();
            *handles = handles.saturating_sub(1);
            *handles == 0 && !self.closing.swap(true, Ordering::AcqRel)
        };
        if last {
            self.dispose().await;
        }
    }

    /// `true` once closing has started; no new observers are accepted.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.stream.observer_count()
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        *self.handles.lock()
    }
}

impl std::fmt::Debug for SharedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSubscription")
            .field("operation_id", &self.operation_id)
            .field("destination", &self.destination)
            .field("handles", &self.handle_count())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SubscriptionHandle
// ---------------------------------------------------------------------------

/// One observer's view of a shared subscription.
///
/// Handles are not disposed on drop; call [`SubscriptionHandle::dispose`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    subscription: Arc<SharedSubscription>,
    observer_id: ObserverId,
    disposed: AtomicBool,
}

impl SubscriptionHandle {
    /// Detaches this observer. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscription.stream.detach(self.observer_id);
        self.subscription.release().await;
    }

    /// `true` after this handle or the whole subscription was disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire) || self.subscription.is_disposed()
    }

    #[must_use]
    pub fn subscription(&self) -> &Arc<SharedSubscription> {
        &self.subscription
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        self.subscription.operation_id()
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        self.subscription.destination()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::observer::ChannelObserver;

    /// Consumer that counts close calls.
    pub(crate) struct CountingConsumer {
        pub(crate) closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl NativeConsumer for CountingConsumer {
        async fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counted() -> (Arc<SharedSubscription>, Arc<AtomicU32>) {
        let closes = Arc::new(AtomicU32::new(0));
        let subscription = Arc::new(SharedSubscription::new(
            "onOrder",
            "kafka",
            "orders",
            Box::new(CountingConsumer {
                closes: Arc::clone(&closes),
            }),
            Arc::new(MessageStream::new()),
        ));
        (subscription, closes)
    }

    pub(crate) fn idle_subscription() -> Arc<SharedSubscription> {
        counted().0
    }

    #[tokio::test]
    async fn dispose_twice_closes_consumer_once() {
        let (subscription, closes) = counted();
        let (observer, mut rx) = ChannelObserver::channel();
        let _handle = subscription.attach(observer).unwrap();

        subscription.dispose().await;
        subscription.dispose().await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(subscription.is_disposed());
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            subscription.attach(ChannelObserver::channel().0),
            Err(ClientError::Disposed)
        ));
    }

    #[tokio::test]
    async fn last_handle_closes_the_subscription() {
        let (subscription, closes) = counted();
        let first = subscription.attach(ChannelObserver::channel().0).unwrap();
        let second = subscription.attach(ChannelObserver::channel().0).unwrap();
        assert_eq!(subscription.handle_count(), 2);

        first.dispose().await;
        first.dispose().await;
        assert!(first.is_disposed());
        assert!(!subscription.is_disposed());
        assert_eq!(subscription.observer_count(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        second.dispose().await;
        assert!(subscription.is_disposed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_dispose_after_subscription_dispose_is_harmless() {
        let (subscription, closes) = counted();
        let handle = subscription.attach(ChannelObserver::channel().0).unwrap();
        subscription.dispose().await;
        handle.dispose().await;
        assert!(handle.is_disposed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
