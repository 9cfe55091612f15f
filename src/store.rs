//! The table store: one append-only log file plus its in-memory snapshot.

use crate::compactor::Compactor;
use crate::error::{Result, StoreError};
use crate::log::LogFile;
use crate::serializer::{apply_entry, JsonLineSerializer, Serializer};
use crate::subscriptions::{WatchHub, Watchable};
use crate::types::{CleanupReport, Snapshot, WriteBatch};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Path of the table file.
    pub path: PathBuf,

    /// Written as the first batch when the file is freshly created.
    pub default_data: Option<Snapshot>,

    /// Line codec.
    pub serializer: Arc<dyn Serializer>,

    /// Cron expression for a compactor owned by this store.
    pub compaction_schedule: Option<String>,

    /// Defer initialization until the first read or write.
    pub lazy: bool,

    /// `fsync` after every append.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("micro.db"),
            default_data: None,
            serializer: Arc::new(JsonLineSerializer),
            compaction_schedule: None,
            lazy: false,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_default_data(mut self, data: Snapshot) -> Self {
        self.default_data = Some(data);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_compaction_schedule(mut self, expression: impl Into<String>) -> Self {
        self.compaction_schedule = Some(expression.into());
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

/// Context handed to store subscribers.
#[derive(Clone, Debug)]
pub struct StoreContext {
    pub store: Store,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Never initialized (lazy store).
    Uninitialized,
    Open,
    /// Memory released; the next access re-initializes.
    Deallocated,
    /// Closed explicitly; only `initialize` reopens.
    Closed,
    /// A file operation failed midway; the next access replays the file.
    Stale,
}

struct StoreState {
    phase: Phase,
    snapshot: Arc<Snapshot>,
    log: LogFile,
    compactor: Option<Compactor>,
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    state: Mutex<StoreState>,
    hub: WatchHub<Snapshot, StoreContext>,
}

/// A change to publish once the state lock is released.
struct Change {
    current: Arc<Snapshot>,
    previous: Arc<Snapshot>,
}

/// A file-backed, log-structured key/value table.
///
/// Every write appends one or more `<key>:<json>` lines to the table file and
/// updates the in-memory snapshot, which serves all reads. Cloning a `Store`
/// yields another handle to the same table.
///
/// Change events are published on the writing thread after the store's lock
/// is released, so subscribers may re-enter the store. With writers on
/// several threads, events can therefore arrive out of commit order; each
/// event still pairs the snapshot produced by its write with the snapshot
/// immediately before it.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create a store. Unless `config.lazy` is set, the file is opened and
    /// replayed immediately.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let lazy = config.lazy;
        let log = LogFile::new(&config.path, config.sync_writes);

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                state: Mutex::new(StoreState {
                    phase: Phase::Uninitialized,
                    snapshot: Arc::new(Snapshot::new()),
                    log,
                    compactor: None,
                }),
                hub: WatchHub::new(),
            }),
        };

        if !lazy {
            store.initialize()?;
        }
        Ok(store)
    }

    /// Path of the table file.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().phase == Phase::Open
    }

    /// The store's own compactor, if a schedule was configured.
    pub fn compactor(&self) -> Option<Compactor> {
        self.inner.state.lock().compactor.clone()
    }

    /// Open the file and rebuild the snapshot. Calling this on an open store
    /// is a no-op; calling it after `close` reopens the store.
    pub fn initialize(&self) -> Result<()> {
        let seeded = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Open {
                return Ok(());
            }
            self.initialize_locked(&mut state)?
        };

        if let Some(change) = seeded {
            self.publish(change);
        }
        Ok(())
    }

    /// Current snapshot.
    pub fn read(&self) -> Result<Arc<Snapshot>> {
        let (snapshot, seeded) = {
            let mut state = self.inner.state.lock();
            let seeded = self.ensure_open(&mut state)?;
            (Arc::clone(&state.snapshot), seeded)
        };

        if let Some(change) = seeded {
            self.publish(change);
        }
        Ok(snapshot)
    }

    /// Current value of one key.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read()?.get(key).cloned())
    }

    /// Set `key` to `value`, or delete it when `value` is `None`.
    pub fn write(&self, key: &str, value: Option<Value>) -> Result<()> {
        check_key(key)?;

        let (seeded, change) = {
            let mut state = self.inner.state.lock();
            let seeded = self.ensure_open(&mut state)?;

            let line = self.inner.config.serializer.encode_entry(key, value.as_ref())?;
            self.append_locked(&mut state, &line)?;

            let change = self.apply(&mut state, std::iter::once((key.to_string(), value)));
            (seeded, change)
        };

        if let Some(change) = seeded {
            self.publish(change);
        }
        if let Some(change) = change {
            self.publish(change);
        }
        Ok(())
    }

    /// Set `key` to `value`.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Delete `key`.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.write(key, None)
    }

    /// Apply every entry of `batch` with a single append and a single change
    /// event.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        for (key, _) in batch.iter() {
            check_key(key)?;
        }

        let (seeded, change) = {
            let mut state = self.inner.state.lock();
            let seeded = self.ensure_open(&mut state)?;
            let change = self.write_batch_locked(&mut state, batch)?;
            (seeded, change)
        };

        if let Some(change) = seeded {
            self.publish(change);
        }
        if let Some(change) = change {
            self.publish(change);
        }
        Ok(())
    }

    /// Release the snapshot and the file handle. The next access
    /// re-initializes from the file; an owned compactor keeps running.
    pub fn deallocate(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Open {
            return Ok(());
        }

        state.log.close()?;
        state.snapshot = Arc::new(Snapshot::new());
        state.phase = Phase::Deallocated;
        debug!(path = %self.path().display(), "Store deallocated");
        Ok(())
    }

    /// Flush and close the file and stop an owned compactor. Further reads
    /// and writes fail until `initialize` is called again.
    pub fn close(&self) -> Result<()> {
        let (closed, compactor) = {
            let mut state = self.inner.state.lock();
            let closed = state.log.close();
            state.snapshot = Arc::new(Snapshot::new());
            state.phase = Phase::Closed;
            (closed, state.compactor.clone())
        };

        // Outside the state lock: a running compaction may be waiting on it.
        if let Some(compactor) = compactor {
            compactor.kill();
        }

        info!(path = %self.path().display(), "Store closed");
        closed
    }

    /// Rewrite the file to one line per live key.
    ///
    /// Holds the state lock for the whole read-decode-rewrite cycle, so no
    /// append can land between reading the log and replacing it.
    pub(crate) fn compact(&self) -> Result<CleanupReport> {
        let mut state = self.inner.state.lock();
        let serializer = &self.inner.config.serializer;

        let raw = state.log.read_all()?;
        let data = serializer.decode(&raw);
        let content = serializer.encode_all(&data)?;
        let bytes_before = match state.log.rewrite(&content) {
            Ok(bytes) => bytes,
            Err(e) => {
                if state.phase == Phase::Open && !state.log.is_open() {
                    self.mark_stale(&mut state, &e);
                }
                return Err(e);
            }
        };

        let report = CleanupReport {
            bytes_before,
            bytes_after: content.len() as u64,
            live_keys: data.len(),
        };
        info!(
            path = %self.path().display(),
            before = report.bytes_before,
            after = report.bytes_after,
            live_keys = report.live_keys,
            "Compacted table"
        );
        Ok(report)
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore {
            path: self.path().to_path_buf(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn ensure_open(&self, state: &mut StoreState) -> Result<Option<Change>> {
        match state.phase {
            Phase::Open => Ok(None),
            Phase::Closed => Err(StoreError::Closed(self.path().to_path_buf())),
            Phase::Uninitialized | Phase::Deallocated | Phase::Stale => {
                self.initialize_locked(state)
            }
        }
    }

    fn initialize_locked(&self, state: &mut StoreState) -> Result<Option<Change>> {
        let config = &self.inner.config;

        let created = state.log.ensure_exists()?;
        let raw = if created {
            String::new()
        } else {
            state.log.read_all()?
        };
        state.snapshot = Arc::new(config.serializer.decode(&raw));
        state.log.open()?;

        // A torn final line must not swallow the next append.
        if !raw.is_empty() && !raw.ends_with('\n') {
            warn!(path = %self.path().display(), "Log ends with a partial line");
            state.log.append("\n")?;
        }
        state.phase = Phase::Open;

        info!(
            path = %self.path().display(),
            created,
            keys = state.snapshot.len(),
            "Store initialized"
        );

        let seeded = match (&config.default_data, created) {
            (Some(data), true) => {
                debug!(path = %self.path().display(), keys = data.len(), "Seeding default data");
                self.write_batch_locked(state, WriteBatch::from(data.clone()))?
            }
            _ => None,
        };

        if let Some(expression) = &config.compaction_schedule {
            match &state.compactor {
                Some(compactor) => compactor.restart()?,
                None => {
                    let compactor = Compactor::with_stores(expression, &[self.clone()])?;
                    state.compactor = Some(compactor);
                }
            }
        }

        Ok(seeded)
    }

    fn write_batch_locked(
        &self,
        state: &mut StoreState,
        batch: WriteBatch,
    ) -> Result<Option<Change>> {
        let serializer = &self.inner.config.serializer;

        let mut payload = String::new();
        for (key, value) in batch.iter() {
            payload.push_str(&serializer.encode_entry(key, value)?);
        }
        if !payload.is_empty() {
            self.append_locked(state, &payload)?;
        }

        Ok(self.apply(
            state,
            batch
                .iter()
                .map(|(k, v)| (k.to_string(), v.cloned()))
                .collect::<Vec<_>>(),
        ))
    }

    /// Append `payload`. A failed append leaves the store stale so that the
    /// next access replays whatever actually reached the file.
    fn append_locked(&self, state: &mut StoreState, payload: &str) -> Result<()> {
        let appended = state.log.append(payload);
        if let Err(e) = &appended {
            self.mark_stale(state, e);
        }
        appended
    }

    fn mark_stale(&self, state: &mut StoreState, error: &StoreError) {
        warn!(
            path = %self.path().display(),
            error = %error,
            "Table file operation failed, replaying on next access"
        );
        state.snapshot = Arc::new(Snapshot::new());
        state.phase = Phase::Stale;
    }

    /// Fold entries into the snapshot. Returns the change to publish, or
    /// `None` when nobody is watching.
    fn apply<I>(&self, state: &mut StoreState, entries: I) -> Option<Change>
    where
        I: IntoIterator<Item = (String, Option<Value>)>,
    {
        let previous = if self.inner.hub.is_empty() {
            None
        } else {
            Some(Arc::clone(&state.snapshot))
        };

        let snapshot = Arc::make_mut(&mut state.snapshot);
        for entry in entries {
            apply_entry(snapshot, entry);
        }

        previous.map(|previous| Change {
            current: Arc::clone(&state.snapshot),
            previous,
        })
    }

    fn publish(&self, change: Change) {
        let context = StoreContext {
            store: self.clone(),
        };
        self.inner
            .hub
            .publish(&change.current, &change.previous, &context);
    }
}

impl Watchable for Store {
    type Value = Snapshot;
    type Context = StoreContext;

    fn watch_hub(&self) -> &WatchHub<Snapshot, StoreContext> {
        &self.inner.hub
    }

    fn current_value(&self) -> Option<Arc<Snapshot>> {
        let state = self.inner.state.lock();
        (state.phase == Phase::Open).then(|| Arc::clone(&state.snapshot))
    }

    fn callback_context(&self) -> StoreContext {
        StoreContext {
            store: self.clone(),
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.config.path)
            .finish()
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Best-effort sync on drop
        if let Err(e) = self.state.get_mut().log.close() {
            warn!(path = %self.config.path.display(), error = %e, "Failed to flush table on drop");
        }
    }
}

/// Non-owning store reference held by compactors.
#[derive(Clone)]
pub(crate) struct WeakStore {
    path: PathBuf,
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

/// Keys are written verbatim before the first `:` of a line.
fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(':') || key.contains('\n') {
        return Err(StoreError::InvalidOperation(format!(
            "invalid key {:?}: keys must be non-empty and contain no ':' or newline",
            key
        )));
    }
    Ok(())
}
