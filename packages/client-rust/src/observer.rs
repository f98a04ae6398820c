//! Observers receive decoded messages from a subscription.
//!
//! [`MessageObserver`] is the push-side contract. [`ChannelObserver`]
//! bridges into a tokio mpsc channel for callers that prefer to `recv()`,
//! and [`FnObserver`] wraps a closure.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::message::DecodedMessage;

/// Receiver of decoded messages.
///
/// Called from the native transport's delivery task; implementations must
/// not block.
pub trait MessageObserver: Send + Sync {
    /// A message was decoded and matched.
    fn on_next(&self, message: Arc<DecodedMessage>);

    /// No further messages will be delivered to this observer.
    fn on_completed(&self) {}
}

// ---------------------------------------------------------------------------
// ChannelObserver
// ---------------------------------------------------------------------------

/// Forwards messages into an unbounded mpsc channel.
///
/// Completion drops the sender, so the receiver yields `None` once drained.
pub struct ChannelObserver {
    tx: Mutex<Option<mpsc::UnboundedSender<Arc<DecodedMessage>>>>,
}

impl ChannelObserver {
    /// Creates an observer together with the receiving end of its channel.
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<DecodedMessage>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl MessageObserver for ChannelObserver {
    fn on_next(&self, message: Arc<DecodedMessage>) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // Receiver dropped: the caller stopped listening.
            let _ = tx.send(message);
        }
    }

    fn on_completed(&self) {
        self.tx.lock().take();
    }
}

impl fmt::Debug for ChannelObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelObserver")
            .field("open", &self.tx.lock().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FnObserver
// ---------------------------------------------------------------------------

/// Observer backed by a closure. Completion is ignored.
pub struct FnObserver<F>(F);

impl<F> FnObserver<F>
where
    F: Fn(Arc<DecodedMessage>) + Send + Sync,
{
    #[must_use]
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F> MessageObserver for FnObserver<F>
where
    F: Fn(Arc<DecodedMessage>) + Send + Sync,
{
    fn on_next(&self, message: Arc<DecodedMessage>) {
        (self.0)(message);
    }
}
