//! # jotdb
//!
//! An embedded, file-backed, log-structured record store.
//!
//! ## Core Concepts
//!
//! - **Tables**: one append-only file per table, one `<key>:<json>` line per write
//! - **Snapshots**: the in-memory fold of the log, serving every read
//! - **Compaction**: scheduled or on-demand rewrite to one line per live key
//! - **Subscriptions**: synchronous change callbacks, including per-key watches
//!
//! ## Example
//!
//! ```ignore
//! use jotdb::{Compactor, Store, StoreConfig, Watchable, WatchOptions};
//! use serde_json::json;
//!
//! let store = Store::open(StoreConfig::new("db/users.db"))?;
//!
//! let sub = store.watch(|snapshot, _ctx, _sub| {
//!     println!("{} users", snapshot.len());
//! }, WatchOptions::new());
//!
//! store.set("ada", json!({"age": 36}))?;
//! store.set("ada", json!({"age": 37}))?;
//! store.remove("ada")?;
//!
//! // Rewrite the file to its minimal form
//! Compactor::clean_up(&store)?;
//! sub.destroy();
//! ```

pub mod compactor;
pub mod error;
mod log;
pub mod registry;
pub mod serializer;
pub mod store;
pub mod subscriptions;
pub mod table;
pub mod types;

// Re-exports
pub use compactor::{Compactor, CompactorContext};
pub use error::{Result, StoreError};
pub use registry::{RegistryConfig, TableRegistry};
pub use serializer::{JsonLineSerializer, LogEntry, Serializer};
pub use store::{Store, StoreConfig, StoreContext};
pub use subscriptions::{
    PropertyOptions, PropertyWatchable, Subscription, WatchHub, WatchOptions, Watchable,
};
pub use table::{Table, TableEntry};
pub use types::*;
