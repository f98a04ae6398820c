//! Subscription slot state machine.
//!
//! One slot exists per (operation, server, destination) within a handler.
//! Transitions run under the slot's async mutex, so concurrent subscribers
//! never open two native consumers. The current phase is mirrored into an
//! `ArcSwap` for lock-free inspection.
//!
//! State machine: Idle -> Connecting -> Subscribing -> Active, with any
//! failure or cancellation returning to Idle. Subscribing on Active is a
//! no-op that hands back the existing subscription.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, MutexGuard};

use crate::subscription::SharedSubscription;

/// Observable phase of a subscription slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// No native consumer.
    Idle,
    /// Waiting for the native connection.
    Connecting,
    /// Waiting for the native consumer.
    Subscribing,
    /// Consumer open; observers share the subscription.
    Active,
}

/// Guarded slot contents.
#[derive(Default)]
pub struct SlotState {
    active: Option<Arc<SharedSubscription>>,
}

/// A subscription slot.
pub struct SubscriptionSlot {
    state: Mutex<SlotState>,
    phase: ArcSwap<SlotPhase>,
}

impl SubscriptionSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            phase: ArcSwap::from_pointee(SlotPhase::Idle),
        }
    }

    /// Current phase without taking the lock.
    #[must_use]
    pub fn phase(&self) -> SlotPhase {
        **self.phase.load()
    }

    /// Waits for exclusive access to the slot.
    pub async fn lock(&self) -> SlotGuard<'_> {
        SlotGuard {
            slot: self,
            state: self.state.lock().await,
        }
    }
}

impl Default for SubscriptionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a slot; all transitions go through it.
pub struct SlotGuard<'a> {
    slot: &'a SubscriptionSlot,
    state: MutexGuard<'a, SlotState>,
}

impl SlotGuard<'_> {
    /// The live subscription, if the slot is active and it is not disposed.
    ///
    /// A subscription that was disposed by its last handle moves the slot
    /// back to Idle.
    pub fn active(&mut self) -> Option<Arc<SharedSubscription>> {
        let disposed = self.state.active.as_ref()?.is_disposed();
        if disposed {
            self.reset();
            return None;
        }
        self.state.active.clone()
    }

    pub fn begin_connecting(&mut self) {
        self.set_phase(SlotPhase::Connecting);
    }

    pub fn begin_subscribing(&mut self) {
        self.set_phase(SlotPhase::Subscribing);
    }

    pub fn activate(&mut self, subscription: Arc<SharedSubscription>) {
        self.state.active = Some(subscription);
        self.set_phase(SlotPhase::Active);
    }

    /// Back to Idle, returning whatever subscription was held.
    pub fn reset(&mut self) -> Option<Arc<SharedSubscription>> {
        self.set_phase(SlotPhase::Idle);
        self.state.active.take()
    }

    fn set_phase(&self, phase: SlotPhase) {
        self.slot.phase.store(Arc::new(phase));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::subscription::tests::idle_subscription;

    #[tokio::test]
    async fn transitions_idle_connecting_subscribing_active() {
        let slot = SubscriptionSlot::new();
        assert_eq!(slot.phase(), SlotPhase::Idle);

        let mut guard = slot.lock().await;
        assert!(guard.active().is_none());
        guard.begin_connecting();
        assert_eq!(slot.phase(), SlotPhase::Connecting);
        guard.begin_subscribing();
        assert_eq!(slot.phase(), SlotPhase::Subscribing);
        guard.activate(idle_subscription());
        assert_eq!(slot.phase(), SlotPhase::Active);
        assert!(guard.active().is_some());
    }

    #[tokio::test]
    async fn disposed_subscription_returns_slot_to_idle() {
        let slot = SubscriptionSlot::new();
        let subscription = idle_subscription();
        slot.lock().await.activate(Arc::clone(&subscription));

        subscription.dispose().await;
        let mut guard = slot.lock().await;
        assert!(guard.active().is_none());
        assert_eq!(slot.phase(), SlotPhase::Idle);
    }

    #[tokio::test]
    async fn lock_serializes_access() {
        let slot = Arc::new(SubscriptionSlot::new());
        let guard = slot.lock().await;

        let contender = Arc::clone(&slot);
        let waiter = tokio::spawn(async move {
            let mut guard = contender.lock().await;
            guard.begin_connecting();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(slot.phase(), SlotPhase::Idle);

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(slot.phase(), SlotPhase::Connecting);
    }
}
