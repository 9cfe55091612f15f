//! Scheduled and on-demand log compaction.
//!
//! A [`Compactor`] owns a cron schedule and a set of registered stores. On
//! every tick it publishes a [`CompactionRun`] to its watchers and then
//! rewrites each store's file to one line per live key. The schedule runs on
//! a dedicated background thread.

use crate::error::{Result, StoreError};
use crate::store::{Store, WeakStore};
use crate::subscriptions::{WatchHub, Watchable};
use crate::types::{CleanupReport, CompactionRun, DEFAULT_COMPACTION_SCHEDULE};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use cron::Schedule;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Context handed to compactor subscribers.
#[derive(Clone, Debug)]
pub struct CompactorContext {
    pub compactor: Compactor,
}

/// An installed schedule: dropping `cancel` stops the worker after its
/// current run.
struct Job {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

struct CompactorInner {
    expression: String,
    schedule: Schedule,
    /// Registered stores; registration does not keep a store alive.
    stores: Mutex<Vec<WeakStore>>,
    job: Mutex<Option<Job>>,
    last_run: Mutex<Option<Arc<CompactionRun>>>,
    hub: WatchHub<CompactionRun, CompactorContext>,
}

/// Rewrites registered stores on a cron schedule.
///
/// Cloning yields another handle to the same compactor.
#[derive(Clone)]
pub struct Compactor {
    inner: Arc<CompactorInner>,
}

impl Compactor {
    /// Create a compactor and start its schedule.
    ///
    /// `expression` uses the seconds-first cron form, e.g. `"0 0 0 * * *"`.
    pub fn new(expression: &str) -> Result<Self> {
        Self::with_stores(expression, &[])
    }

    /// Compact daily at midnight (UTC).
    pub fn with_default_schedule() -> Result<Self> {
        Self::new(DEFAULT_COMPACTION_SCHEDULE)
    }

    /// Create a compactor with an initial set of stores.
    pub fn with_stores(expression: &str, stores: &[Store]) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| StoreError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        let compactor = Self {
            inner: Arc::new(CompactorInner {
                expression: expression.to_string(),
                schedule,
                stores: Mutex::new(stores.iter().map(Store::downgrade).collect()),
                job: Mutex::new(None),
                last_run: Mutex::new(None),
                hub: WatchHub::new(),
            }),
        };

        compactor.restart()?;
        Ok(compactor)
    }

    /// Rewrite `store`'s file to its minimal form.
    ///
    /// Works on any store, registered or not. Appends to the store wait
    /// until the rewrite has completed.
    pub fn clean_up(store: &Store) -> Result<CleanupReport> {
        store.compact()
    }

    pub fn expression(&self) -> &str {
        &self.inner.expression
    }

    /// Registered stores that are still alive.
    pub fn databases(&self) -> Vec<Store> {
        let mut stores = self.inner.stores.lock();
        stores.retain(|s| s.upgrade().is_some());
        stores.iter().filter_map(WeakStore::upgrade).collect()
    }

    /// Add `store` to future runs. A store already registered under the
    /// same path is replaced.
    pub fn register_database(&self, store: &Store) {
        let mut stores = self.inner.stores.lock();
        stores.retain(|s| s.path() != store.path());
        stores.push(store.downgrade());
    }

    /// Remove `store` (matched by path) from future runs.
    pub fn delete_database(&self, store: &Store) {
        self.inner
            .stores
            .lock()
            .retain(|s| s.path() != store.path());
    }

    /// Run a compaction pass now: publish the run, then compact every
    /// registered store. Every store is attempted; the first failure is
    /// returned.
    pub fn clean_all(&self) -> Result<()> {
        run_once(&self.inner)
    }

    /// Cancel future runs. Blocks until an in-flight scheduled run finishes.
    pub fn kill(&self) {
        let job = self.inner.job.lock().take();
        let Some(Job { cancel, handle }) = job else {
            return;
        };
        drop(cancel);

        // Killed from a watcher on the worker itself: it exits after this run.
        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            warn!(schedule = %self.inner.expression, "Compactor worker panicked");
        }
        info!(schedule = %self.inner.expression, "Compactor stopped");
    }

    /// Reinstall the schedule after `kill`. No-op while scheduled.
    pub fn restart(&self) -> Result<()> {
        let mut job = self.inner.job.lock();
        if job.is_none() {
            *job = Some(spawn_job(&self.inner)?);
            info!(schedule = %self.inner.expression, "Compactor scheduled");
        }
        Ok(())
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.job.lock().is_some()
    }

    #[cfg(test)]
    fn worker_id(&self) -> Option<thread::ThreadId> {
        self.inner
            .job
            .lock()
            .as_ref()
            .map(|job| job.handle.thread().id())
    }

    /// Next scheduled run, if scheduled.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        if !self.is_scheduled() {
            return None;
        }
        self.inner.schedule.upcoming(Utc).next()
    }
}

impl Watchable for Compactor {
    type Value = CompactionRun;
    type Context = CompactorContext;

    fn watch_hub(&self) -> &WatchHub<CompactionRun, CompactorContext> {
        &self.inner.hub
    }

    fn current_value(&self) -> Option<Arc<CompactionRun>> {
        self.inner.last_run.lock().clone()
    }

    fn callback_context(&self) -> CompactorContext {
        CompactorContext {
            compactor: self.clone(),
        }
    }
}

impl fmt::Debug for Compactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compactor")
            .field("expression", &self.inner.expression)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

fn spawn_job(inner: &Arc<CompactorInner>) -> Result<Job> {
    let (cancel, cancelled) = bounded::<()>(1);
    let weak = Arc::downgrade(inner);
    let schedule = inner.schedule.clone();

    let handle = thread::Builder::new()
        .name("jotdb-compactor".to_string())
        .spawn(move || worker_loop(weak, schedule, cancelled))?;

    Ok(Job { cancel, handle })
}

fn worker_loop(inner: Weak<CompactorInner>, schedule: Schedule, cancelled: Receiver<()>) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            debug!("Schedule has no further runs");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        match cancelled.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            // Cancelled, or every handle to the compactor was dropped.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(e) = run_once(&inner) {
            warn!(schedule = %inner.expression, error = %e, "Scheduled compaction failed");
        }
    }
}

fn run_once(inner: &Arc<CompactorInner>) -> Result<()> {
    let stores: Vec<Store> = {
        let mut registered = inner.stores.lock();
        registered.retain(|s| s.upgrade().is_some());
        registered.iter().filter_map(WeakStore::upgrade).collect()
    };

    let run = Arc::new(CompactionRun {
        started_at: Utc::now(),
        databases: stores.len(),
    });
    let previous = inner.last_run.lock().replace(Arc::clone(&run));

    let context = CompactorContext {
        compactor: Compactor {
            inner: Arc::clone(inner),
        },
    };
    inner
        .hub
        .publish(&run, previous.as_deref().unwrap_or(&*run), &context);

    let mut first_error = None;
    for store in &stores {
        if let Err(e) = store.compact() {
            warn!(path = %store.path().display(), error = %e, "Compaction failed");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
