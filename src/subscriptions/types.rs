//! Subscription types for change notifications.

use crate::types::SubscriptionId;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Callback invoked with the new value, the host's context and the
/// subscription itself (so a callback can destroy its own subscription).
pub type Callback<V, C> = dyn Fn(&V, &C, &Subscription) + Send + Sync;

/// Decides whether a change is delivered. Receives the new value and the value
/// from immediately before the change; an immediate delivery at registration
/// passes the current value as both.
pub type Predicate<V> = dyn Fn(&V, &V) -> bool + Send + Sync;

/// Predicate over a single field of a snapshot (new field, previous field).
pub type FieldPredicate = dyn Fn(Option<&Value>, Option<&Value>) -> bool + Send + Sync;

/// Options for `watch` and `watch_next`.
pub struct WatchOptions<V> {
    /// Deliver only when this returns true (default: always).
    pub predicate: Option<Box<Predicate<V>>>,
    /// Deliver once at registration if the host already has a value.
    pub call_immediate: bool,
}

impl<V> Default for WatchOptions<V> {
    fn default() -> Self {
        Self {
            predicate: None,
            call_immediate: false,
        }
    }
}

impl<V> WatchOptions<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn call_immediate(mut self) -> Self {
        self.call_immediate = true;
        self
    }
}

/// Options for `watch_property` and `watch_property_next`.
#[derive(Default)]
pub struct PropertyOptions {
    /// Consulted only after the field itself changed.
    pub predicate: Option<Box<FieldPredicate>>,
    pub call_immediate: bool,
}

impl PropertyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&Value>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn call_immediate(mut self) -> Self {
        self.call_immediate = true;
        self
    }
}

/// Removes subscriptions by id; implemented by the watcher list so handles
/// can reach it without knowing its value and context types.
pub(crate) trait Detach: Send + Sync {
    fn detach(&self, id: SubscriptionId);
}

/// Handle to a registered watcher.
///
/// Cloning yields another handle to the same subscription. Dropping a handle
/// does not unsubscribe; call [`Subscription::destroy`].
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    owner: Weak<dyn Detach>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, owner: Weak<dyn Detach>) -> Self {
        Self {
            id,
            active: Arc::new(AtomicBool::new(true)),
            owner,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the subscription. Repeated calls are no-ops.
    pub fn destroy(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(owner) = self.owner.upgrade() {
                owner.detach(self.id);
            }
        }
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
