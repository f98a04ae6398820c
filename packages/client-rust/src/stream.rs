//! Broadcast primitive fanning decoded messages out to observers.
//!
//! One native source, any number of observers. Observers can be attached and
//! detached while messages are being emitted: each emission delivers to the
//! snapshot of observers present when it started, and a newly attached
//! observer only sees later emissions (no replay).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::message::DecodedMessage;
use crate::observer::MessageObserver;

/// Identifier of an attached observer, unique within one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Observer list with lock-guarded mutation and snapshot emission.
#[derive(Default)]
pub struct MessageStream {
    observers: RwLock<Vec<(ObserverId, Arc<dyn MessageObserver>)>>,
    next_id: AtomicU64,
    completed: AtomicBool,
}

impl MessageStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an observer. Returns `None` once the stream has completed.
    pub fn attach(&self, observer: Arc<dyn MessageObserver>) -> Option<ObserverId> {
        let mut observers = self.observers.write();
        // Checked under the write lock so `complete` cannot miss this observer.
        if self.completed.load(Ordering::Acquire) {
            return None;
        }
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        observers.push((id, observer));
        Some(id)
    }

    /// Detaches an observer and completes it. Returns `false` if it was not attached.
    pub fn detach(&self, id: ObserverId) -> bool {
        let removed = {
            let mut observers = self.observers.write();
            observers
                .iter()
                .position(|(existing, _)| *existing == id)
                .map(|index| observers.remove(index).1)
        };
        match removed {
            Some(observer) => {
                observer.on_completed();
                true
            }
            None => false,
        }
    }

    /// Delivers `message` to every observer attached right now.
    ///
    /// Returns the number of observers it was delivered to.
    pub fn emit(&self, message: &Arc<DecodedMessage>) -> usize {
        let snapshot: Vec<Arc<dyn MessageObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in &snapshot {
            observer.on_next(Arc::clone(message));
        }
        snapshot.len()
    }

    /// Completes every observer and refuses new ones. Idempotent.
    pub fn complete(&self) {
        let drained = {
            let mut observers = self.observers.write();
            if self.completed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *observers)
        };
        for (_, observer) in drained {
            observer.on_completed();
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("observers", &self.observer_count())
            .field("completed", &self.is_completed())
            .finish()
    }
}
