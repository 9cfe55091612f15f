//! Watcher registry and synchronous change dispatch.

use crate::types::{Snapshot, SubscriptionId};
use parking_lot::Mutex;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

use super::types::{
    Callback, Detach, Predicate, PropertyOptions, Subscription, WatchOptions,
};

/// Internal watcher state.
struct Watcher<V, C> {
    subscription: Subscription,
    callback: Box<Callback<V, C>>,
    predicate: Option<Box<Predicate<V>>>,
    /// Deliveries left before self-destruction (`None` = unlimited).
    remaining: Option<AtomicUsize>,
}

struct WatcherList<V, C> {
    watchers: Mutex<Vec<Arc<Watcher<V, C>>>>,
}

impl<V, C> Detach for WatcherList<V, C> {
    fn detach(&self, id: SubscriptionId) {
        self.watchers.lock().retain(|w| {
            if w.subscription.id() == id {
                w.subscription.deactivate();
                false
            } else {
                true
            }
        });
    }
}

/// Holds the subscriptions of one host and delivers its change events.
///
/// Delivery is synchronous on the thread that publishes. Watchers run in
/// registration order; a panicking callback or predicate is logged and does
/// not stop delivery to the others.
pub struct WatchHub<V, C> {
    list: Arc<WatcherList<V, C>>,
}

impl<V: 'static, C: 'static> WatchHub<V, C> {
    pub fn new() -> Self {
        Self {
            list: Arc::new(WatcherList {
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a watcher. `limit` caps the number of accepted deliveries;
    /// `immediate` carries the current value and context when the watcher
    /// asked to be called at registration.
    pub fn register(
        &self,
        callback: Box<Callback<V, C>>,
        predicate: Option<Box<Predicate<V>>>,
        limit: Option<usize>,
        immediate: Option<(&V, &C)>,
    ) -> Subscription {
        let owner: Weak<dyn Detach> = Arc::downgrade(&self.list) as Weak<dyn Detach>;
        let subscription = Subscription::new(SubscriptionId::new(), owner);

        let watcher = Arc::new(Watcher {
            subscription: subscription.clone(),
            callback,
            predicate,
            remaining: limit.map(AtomicUsize::new),
        });

        if limit == Some(0) {
            subscription.deactivate();
            return subscription;
        }

        self.list.watchers.lock().push(Arc::clone(&watcher));

        if let Some((value, context)) = immediate {
            self.deliver(&watcher, value, value, context);
        }

        subscription
    }

    /// Notify every watcher that the value changed from `previous` to `value`.
    pub fn publish(&self, value: &V, previous: &V, context: &C) {
        let watchers: Vec<_> = self.list.watchers.lock().clone();
        for watcher in &watchers {
            self.deliver(watcher, value, previous, context);
        }
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.list.watchers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every subscription.
    pub fn clear(&self) {
        let drained: Vec<_> = self.list.watchers.lock().drain(..).collect();
        for watcher in drained {
            watcher.subscription.deactivate();
        }
    }

    fn deliver(&self, watcher: &Watcher<V, C>, value: &V, previous: &V, context: &C) {
        let subscription = &watcher.subscription;
        if !subscription.is_active() {
            return;
        }

        if let Some(predicate) = &watcher.predicate {
            let accepted = panic::catch_unwind(AssertUnwindSafe(|| predicate(value, previous)));
            match accepted {
                Ok(true) => {}
                Ok(false) => return,
                Err(_) => {
                    error!(subscription = %subscription.id(), "Watch predicate panicked");
                    return;
                }
            }
        }

        // Claim a delivery slot; the one that takes the last slot still runs.
        let last = match &watcher.remaining {
            None => false,
            Some(remaining) => {
                match remaining.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    n.checked_sub(1)
                }) {
                    Ok(n) => n == 1,
                    Err(_) => return,
                }
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            (watcher.callback)(value, context, subscription)
        }));
        if outcome.is_err() {
            error!(subscription = %subscription.id(), "Watch callback panicked");
        }

        if last {
            subscription.destroy();
        }
    }
}

impl<V: 'static, C: 'static> Default for WatchHub<V, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// A host whose value can be watched.
///
/// Implementors supply the hub, the current value and the context handed to
/// callbacks; `watch` and `watch_next` come for free.
pub trait Watchable {
    type Value: 'static;
    type Context: 'static;

    fn watch_hub(&self) -> &WatchHub<Self::Value, Self::Context>;

    /// Last known value, or `None` if there is nothing to deliver yet.
    fn current_value(&self) -> Option<Arc<Self::Value>>;

    fn callback_context(&self) -> Self::Context;

    /// Call `callback` on every change accepted by the options' predicate.
    fn watch<F>(&self, callback: F, options: WatchOptions<Self::Value>) -> Subscription
    where
        F: Fn(&Self::Value, &Self::Context, &Subscription) + Send + Sync + 'static,
    {
        register_with(self, Box::new(callback), options.predicate, None, options.call_immediate)
    }

    /// Like `watch`, but the subscription destroys itself after `times`
    /// accepted deliveries.
    fn watch_next<F>(
        &self,
        callback: F,
        times: usize,
        options: WatchOptions<Self::Value>,
    ) -> Subscription
    where
        F: Fn(&Self::Value, &Self::Context, &Subscription) + Send + Sync + 'static,
    {
        register_with(
            self,
            Box::new(callback),
            options.predicate,
            Some(times),
            options.call_immediate,
        )
    }
}

fn register_with<H: Watchable + ?Sized>(
    host: &H,
    callback: Box<Callback<H::Value, H::Context>>,
    predicate: Option<Box<Predicate<H::Value>>>,
    limit: Option<usize>,
    call_immediate: bool,
) -> Subscription {
    let current = if call_immediate {
        host.current_value()
    } else {
        None
    };

    match current {
        Some(value) => {
            let context = host.callback_context();
            host.watch_hub()
                .register(callback, predicate, limit, Some((&*value, &context)))
        }
        None => host.watch_hub().register(callback, predicate, limit, None),
    }
}

/// Property-scoped watching for hosts whose value is a snapshot.
pub trait PropertyWatchable: Watchable<Value = Snapshot> {
    /// Call `callback` with the field's new value whenever `property` changes.
    fn watch_property<F>(
        &self,
        property: impl Into<String>,
        callback: F,
        options: PropertyOptions,
    ) -> Subscription
    where
        F: Fn(Option<&Value>, &Self::Context, &Subscription) + Send + Sync + 'static,
    {
        watch_property_with(self, property.into(), callback, None, options)
    }

    /// Like `watch_property`, limited to `times` accepted deliveries.
    fn watch_property_next<F>(
        &self,
        property: impl Into<String>,
        callback: F,
        times: usize,
        options: PropertyOptions,
    ) -> Subscription
    where
        F: Fn(Option<&Value>, &Self::Context, &Subscription) + Send + Sync + 'static,
    {
        watch_property_with(self, property.into(), callback, Some(times), options)
    }
}

impl<T: Watchable<Value = Snapshot> + ?Sized> PropertyWatchable for T {}

fn watch_property_with<H, F>(
    host: &H,
    property: String,
    callback: F,
    limit: Option<usize>,
    options: PropertyOptions,
) -> Subscription
where
    H: Watchable<Value = Snapshot> + ?Sized,
    F: Fn(Option<&Value>, &H::Context, &Subscription) + Send + Sync + 'static,
{
    let field = property.clone();
    let field_predicate = options.predicate;
    let predicate = move |value: &Snapshot, previous: &Snapshot| {
        let new_field = value.get(&field);
        let old_field = previous.get(&field);
        let changed = new_field != old_field;

        changed
            && field_predicate
                .as_ref()
                .map_or(true, |p| p(new_field, old_field))
    };

    let callback = move |value: &Snapshot, context: &H::Context, subscription: &Subscription| {
        callback(value.get(&property), context, subscription)
    };

    register_with(
        host,
        Box::new(callback),
        Some(Box::new(predicate)),
        limit,
        options.call_immediate,
    )
}
