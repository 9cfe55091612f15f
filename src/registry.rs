//! Named tables in one folder, with an optional shared compactor.

use crate::compactor::Compactor;
use crate::error::{Result, StoreError};
use crate::store::{Store, StoreConfig};
use crate::table::Table;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Extension of table files.
const TABLE_EXTENSION: &str = "db";

/// Registry configuration.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Folder holding `<name>.db` files.
    pub folder: PathBuf,

    /// Schedule of the global compactor shared by all tables.
    pub compaction_schedule: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("db"),
            compaction_schedule: None,
        }
    }
}

/// Tracks open tables by name.
///
/// Every table opened through the registry is registered with the global
/// compactor, if one is configured.
pub struct TableRegistry {
    folder: Mutex<PathBuf>,
    tables: Mutex<BTreeMap<String, Store>>,
    global: Mutex<Option<Compactor>>,
}

impl TableRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let registry = Self {
            folder: Mutex::new(config.folder),
            tables: Mutex::new(BTreeMap::new()),
            global: Mutex::new(None),
        };
        registry.set_compaction_schedule(config.compaction_schedule.as_deref())?;
        Ok(registry)
    }

    pub fn folder(&self) -> PathBuf {
        self.folder.lock().clone()
    }

    /// Folder for tables opened from now on.
    pub fn set_folder(&self, folder: impl AsRef<Path>) {
        *self.folder.lock() = folder.as_ref().to_path_buf();
    }

    /// Open table `name` with default settings.
    pub fn table<T>(&self, name: &str) -> Result<Table<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.table_with(name, StoreConfig::default())
    }

    /// Open table `name`. The path of `config` is replaced by
    /// `<folder>/<name>.db`.
    pub fn table_with<T>(&self, name: &str, config: StoreConfig) -> Result<Table<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut tables = self.tables.lock();
        if tables.contains_key(name) {
            return Err(StoreError::TableExists(name.to_string()));
        }

        let path = self
            .folder
            .lock()
            .join(format!("{}.{}", name, TABLE_EXTENSION));
        let store = Store::open(StoreConfig { path, ..config })?;

        if let Some(global) = self.global.lock().as_ref() {
            global.register_database(&store);
        }
        tables.insert(name.to_string(), store.clone());

        info!(table = name, path = %store.path().display(), "Table opened");
        Ok(Table::from_store(store))
    }

    /// Store behind table `name`.
    pub fn store(&self, name: &str) -> Result<Store> {
        self.tables
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.lock().keys().cloned().collect()
    }

    /// Close and forget table `name`. Unknown names are ignored.
    pub fn delete_table(&self, name: &str) -> Result<()> {
        let Some(store) = self.tables.lock().remove(name) else {
            return Ok(());
        };

        if let Some(global) = self.global.lock().as_ref() {
            global.delete_database(&store);
        }
        info!(table = name, "Table removed");
        store.close()
    }

    /// Replace the global compactor's schedule, carrying its stores over.
    /// `None` stops global compaction.
    pub fn set_compaction_schedule(&self, expression: Option<&str>) -> Result<()> {
        let replacement = expression.map(Compactor::new).transpose()?;
        let open: Vec<Store> = self.tables.lock().values().cloned().collect();

        let mut global = self.global.lock();
        let stores = match global.take() {
            Some(old) => {
                old.kill();
                old.databases()
            }
            None => open,
        };

        if let Some(compactor) = &replacement {
            for store in &stores {
                compactor.register_database(store);
            }
        }
        *global = replacement;
        Ok(())
    }

    pub fn global_compactor(&self) -> Option<Compactor> {
        self.global.lock().clone()
    }

    /// Close every table and stop the global compactor.
    pub fn close_all(&self) -> Result<()> {
        if let Some(global) = self.global.lock().take() {
            global.kill();
        }

        let stores: Vec<_> = std::mem::take(&mut *self.tables.lock()).into_values().collect();
        let mut first_error = None;
        for store in stores {
            if let Err(e) = store.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
