//! Subscription system for change notifications.
//!
//! Any host (a [`Store`](crate::Store), a [`Compactor`](crate::Compactor))
//! embeds a [`WatchHub`] and implements [`Watchable`]. Subscribers register
//! callbacks that run synchronously whenever the host publishes a change:
//! - `watch`: every accepted change
//! - `watch_next`: the next `n` accepted changes, then self-destroy
//! - `watch_property` / `watch_property_next`: only when one key of a
//!   snapshot changed
//!
//! # Example
//!
//! ```ignore
//! let sub = store.watch(
//!     |snapshot, ctx, _sub| println!("{} now has {} keys", ctx.store.path().display(), snapshot.len()),
//!     WatchOptions::new(),
//! );
//!
//! store.write("id", Some(json!({"x": 1})))?;
//! sub.destroy();
//! ```

mod manager;
mod types;

pub use manager::{PropertyWatchable, WatchHub, Watchable};
pub use types::{
    Callback, FieldPredicate, Predicate, PropertyOptions, Subscription, WatchOptions,
};
