//! Typed CRUD access to one store.
//!
//! A [`Table`] assigns random ids to new records and implements
//! predicate-based select, update, mutate and delete by scanning the store's
//! snapshot. Records are (de)serialized with serde on every access.

use crate::compactor::Compactor;
use crate::error::{Result, StoreError};
use crate::store::{Store, StoreConfig};
use crate::types::WriteBatch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::marker::PhantomData;
use tracing::debug;

/// A record together with its id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableEntry<T> {
    pub id: String,
    pub value: T,
}

/// Typed view over a [`Store`].
pub struct Table<T> {
    store: Store,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("store", &self.store).finish()
    }
}

impl<T: Serialize + DeserializeOwned> Table<T> {
    /// Open the store described by `config` and wrap it.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Ok(Self::from_store(Store::open(config)?))
    }

    pub fn from_store(store: Store) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    /// The underlying store (for watching or raw access).
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Close the underlying store.
    pub fn shutdown(&self) -> Result<()> {
        self.store.close()
    }

    /// Compact the table file now.
    pub fn clean_up(&self) -> Result<()> {
        Compactor::clean_up(&self.store).map(|_| ())
    }

    /// Insert a record under a fresh id and return the id.
    pub fn create(&self, value: &T) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.store.write(&id, Some(serde_json::to_value(value)?))?;
        Ok(id)
    }

    pub fn select(&self, id: &str) -> Result<Option<T>> {
        self.store.get(id)?.map(decode).transpose()
    }

    /// First record matching `pred`.
    pub fn select_where<P>(&self, pred: P) -> Result<Option<TableEntry<T>>>
    where
        P: Fn(&T) -> bool,
    {
        for (id, raw) in self.store.read()?.iter() {
            let value = decode(raw.clone())?;
            if pred(&value) {
                return Ok(Some(TableEntry {
                    id: id.clone(),
                    value,
                }));
            }
        }
        Ok(None)
    }

    /// Every record matching `pred`.
    pub fn select_all_where<P>(&self, pred: P) -> Result<Vec<TableEntry<T>>>
    where
        P: Fn(&T) -> bool,
    {
        let mut entries = Vec::new();
        for (id, raw) in self.store.read()?.iter() {
            let value = decode(raw.clone())?;
            if pred(&value) {
                entries.push(TableEntry {
                    id: id.clone(),
                    value,
                });
            }
        }
        Ok(entries)
    }

    pub fn select_all(&self) -> Result<Vec<TableEntry<T>>> {
        self.select_all_where(|_| true)
    }

    /// Merge the fields of `patch` into record `id`. Returns false if the
    /// record does not exist.
    pub fn update<P: Serialize>(&self, id: &str, patch: &P) -> Result<bool> {
        let patch = patch_fields(patch)?;
        match self.store.get(id)? {
            Some(current) => {
                let merged = merge(current, &patch)?;
                self.store.write(id, Some(merged))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Merge `patch` into the first record matching `pred`.
    pub fn update_where<F, P>(&self, pred: F, patch: &P) -> Result<bool>
    where
        F: Fn(&T) -> bool,
        P: Serialize,
    {
        match self.select_where(pred)? {
            Some(entry) => self.update(&entry.id, patch),
            None => Ok(false),
        }
    }

    /// Merge `patch` into every record matching `pred`, as one batch.
    pub fn update_all_where<F, P>(&self, pred: F, patch: &P) -> Result<usize>
    where
        F: Fn(&T) -> bool,
        P: Serialize,
    {
        let patch = patch_fields(patch)?;
        let mut batch = WriteBatch::new();
        for (id, raw) in self.store.read()?.iter() {
            if pred(&decode(raw.clone())?) {
                batch.push(id.clone(), Some(merge(raw.clone(), &patch)?));
            }
        }
        self.commit(batch)
    }

    /// Replace record `id` with `mutation(record)`. Returns false if the
    /// record does not exist.
    pub fn mutate<M>(&self, id: &str, mutation: M) -> Result<bool>
    where
        M: FnOnce(T) -> T,
    {
        match self.select(id)? {
            Some(value) => {
                self.store
                    .write(id, Some(serde_json::to_value(mutation(value))?))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the first record matching `pred` with `mutation(record)`.
    pub fn mutate_where<F, M>(&self, pred: F, mutation: M) -> Result<bool>
    where
        F: Fn(&T) -> bool,
        M: FnOnce(T) -> T,
    {
        match self.select_where(pred)? {
            Some(entry) => {
                let value = serde_json::to_value(mutation(entry.value))?;
                self.store.write(&entry.id, Some(value))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace every record matching `pred`, as one batch.
    pub fn mutate_all_where<F, M>(&self, pred: F, mut mutation: M) -> Result<usize>
    where
        F: Fn(&T) -> bool,
        M: FnMut(T) -> T,
    {
        let mut batch = WriteBatch::new();
        for entry in self.select_all_where(pred)? {
            batch.push(entry.id, Some(serde_json::to_value(mutation(entry.value))?));
        }
        self.commit(batch)
    }

    /// Replace every record, then compact the file (a whole-table rewrite
    /// otherwise doubles it).
    pub fn mutate_all<M>(&self, mutation: M) -> Result<usize>
    where
        M: FnMut(T) -> T,
    {
        let changed = self.mutate_all_where(|_| true, mutation)?;
        self.clean_up()?;
        Ok(changed)
    }

    /// Convert every record to a new type and return the retyped table.
    /// The file is compacted afterwards.
    pub fn migrate<B, M>(self, mut migration: M) -> Result<Table<B>>
    where
        B: Serialize + DeserializeOwned,
        M: FnMut(T) -> B,
    {
        let mut batch = WriteBatch::new();
        for entry in self.select_all()? {
            batch.push(entry.id, Some(serde_json::to_value(migration(entry.value))?));
        }
        let migrated = batch.len();
        self.commit(batch)?;
        self.clean_up()?;

        debug!(path = %self.store.path().display(), migrated, "Table migrated");
        Ok(Table::from_store(self.store))
    }

    /// Delete record `id`.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.write(id, None)
    }

    /// Delete the first record matching `pred`.
    pub fn delete_where<F>(&self, pred: F) -> Result<bool>
    where
        F: Fn(&T) -> bool,
    {
        match self.select_where(pred)? {
            Some(entry) => {
                self.delete(&entry.id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete every record matching `pred`, as one batch.
    pub fn delete_all_where<F>(&self, pred: F) -> Result<usize>
    where
        F: Fn(&T) -> bool,
    {
        let batch = self
            .select_all_where(pred)?
            .into_iter()
            .map(|entry| (entry.id, None))
            .collect::<WriteBatch>();
        self.commit(batch)
    }

    /// Delete every record.
    pub fn flush(&self) -> Result<usize> {
        let batch = self
            .store
            .read()?
            .keys()
            .map(|id| (id.clone(), None))
            .collect::<WriteBatch>();
        self.commit(batch)
    }

    fn commit(&self, batch: WriteBatch) -> Result<usize> {
        let count = batch.len();
        if count > 0 {
            self.store.write_batch(batch)?;
        }
        Ok(count)
    }
}

fn decode<T: DeserializeOwned>(raw: Value) -> Result<T> {
    serde_json::from_value(raw).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn patch_fields<P: Serialize>(patch: &P) -> Result<Map<String, Value>> {
    match serde_json::to_value(patch)? {
        Value::Object(fields) => Ok(fields),
        other => Err(StoreError::InvalidOperation(format!(
            "update patch must serialize to an object, got {}",
            other
        ))),
    }
}

/// Shallow merge: top-level fields of `patch` overwrite those of `current`.
fn merge(current: Value, patch: &Map<String, Value>) -> Result<Value> {
    match current {
        Value::Object(mut fields) => {
            for (k, v) in patch {
                fields.insert(k.clone(), v.clone());
            }
            Ok(Value::Object(fields))
        }
        other => Err(StoreError::InvalidOperation(format!(
            "cannot merge fields into non-object record {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        age: u32,
    }

    fn user(name: &str, age: u32) -> User {
        User {
            name: name.to_string(),
            age,
        }
    }

    fn test_table(dir: &TempDir) -> Table<User> {
        Table::open(StoreConfig::new(dir.path().join("users.db")).sync_writes(false)).unwrap()
    }

    #[test]
    fn test_create_and_select() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);

        let id = table.create(&user("ada", 36)).unwrap();
        assert_eq!(table.select(&id).unwrap(), Some(user("ada", 36)));
        assert_eq!(table.select("missing").unwrap(), None);

        let other = table.create(&user("bob", 20)).unwrap();
        assert_ne!(id, other);
        assert_eq!(table.select_all().unwrap().len(), 2);
    }

    #[test]
    fn test_select_where() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        table.create(&user("ada", 36)).unwrap();
        table.create(&user("bob", 20)).unwrap();
        table.create(&user("cy", 40)).unwrap();

        let found = table.select_where(|u| u.name == "bob").unwrap().unwrap();
        assert_eq!(found.value.age, 20);

        let older = table.select_all_where(|u| u.age > 30).unwrap();
        assert_eq!(older.len(), 2);
        assert!(table.select_where(|u| u.age > 100).unwrap().is_none());
    }

    #[test]
    fn test_update_merges_fields() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = table.create(&user("ada", 36)).unwrap();

        assert!(table.update(&id, &json!({"age": 37})).unwrap());
        assert_eq!(table.select(&id).unwrap(), Some(user("ada", 37)));
        assert!(!table.update("missing", &json!({"age": 1})).unwrap());
        assert!(matches!(
            table.update(&id, &json!(5)),
            Err(StoreError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_update_where_and_all_where() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        table.create(&user("ada", 36)).unwrap();
        table.create(&user("bob", 20)).unwrap();
        table.create(&user("cy", 40)).unwrap();

        assert!(table.update_where(|u| u.name == "bob", &json!({"age": 21})).unwrap());
        assert_eq!(
            table.select_where(|u| u.name == "bob").unwrap().unwrap().value.age,
            21
        );

        let changed = table
            .update_all_where(|u| u.age > 30, &json!({"name": "senior"}))
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(table.select_all_where(|u| u.name == "senior").unwrap().len(), 2);
    }

    #[test]
    fn test_mutate() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = table.create(&user("ada", 36)).unwrap();
        table.create(&user("bob", 20)).unwrap();

        assert!(table
            .mutate(&id, |mut u| {
                u.age += 1;
                u
            })
            .unwrap());
        assert_eq!(table.select(&id).unwrap().unwrap().age, 37);

        assert!(table
            .mutate_where(|u| u.name == "bob", |u| User { age: 0, ..u })
            .unwrap());
        assert!(!table.mutate("missing", |u| u).unwrap());

        let changed = table
            .mutate_all_where(|u| u.age < 10, |u| User { age: 10, ..u })
            .unwrap();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_mutate_all_compacts() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        table.create(&user("ada", 36)).unwrap();
        table.create(&user("bob", 20)).unwrap();

        table
            .mutate_all(|u| User {
                age: u.age * 2,
                ..u
            })
            .unwrap();

        let raw = std::fs::read_to_string(table.store().path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let mut ages: Vec<_> = table
            .select_all()
            .unwrap()
            .into_iter()
            .map(|e| e.value.age)
            .collect();
        ages.sort();
        assert_eq!(ages, vec![40, 72]);
    }

    #[test]
    fn test_migrate_changes_type() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Named {
            name: String,
        }

        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = table.create(&user("ada", 36)).unwrap();

        let named: Table<Named> = table
            .migrate(|u| Named { name: u.name })
            .unwrap();
        assert_eq!(
            named.select(&id).unwrap(),
            Some(Named {
                name: "ada".to_string()
            })
        );
    }

    #[test]
    fn test_delete_variants() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = table.create(&user("ada", 36)).unwrap();
        table.create(&user("bob", 20)).unwrap();
        table.create(&user("cy", 40)).unwrap();
        table.create(&user("dee", 50)).unwrap();

        table.delete(&id).unwrap();
        assert!(table.select(&id).unwrap().is_none());

        assert!(table.delete_where(|u| u.name == "bob").unwrap());
        assert!(!table.delete_where(|u| u.name == "bob").unwrap());

        assert_eq!(table.delete_all_where(|u| u.age >= 40).unwrap(), 2);
        assert!(table.select_all().unwrap().is_empty());

        table.create(&user("eve", 1)).unwrap();
        assert_eq!(table.flush().unwrap(), 1);
        assert!(table.select_all().unwrap().is_empty());
    }

    #[test]
    fn test_undecodable_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        table.store().set("raw", json!("not a user")).unwrap();

        assert!(matches!(
            table.select("raw"),
            Err(StoreError::Deserialization(_))
        ));
    }
}
