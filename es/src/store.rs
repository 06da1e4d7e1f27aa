//! SQLite-backed record store

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::{Filter, FilterOp, IndexValue, Record, Result, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    body        TEXT NOT NULL,
    unique_key  TEXT,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE UNIQUE INDEX IF NOT EXISTS records_unique_key
    ON records (collection, unique_key) WHERE unique_key IS NOT NULL;
CREATE TABLE IF NOT EXISTS record_index (
    collection  TEXT NOT NULL,
    field       TEXT NOT NULL,
    id          TEXT NOT NULL,
    value       TEXT NOT NULL,
    PRIMARY KEY (collection, field, id)
);
CREATE INDEX IF NOT EXISTS record_index_lookup
    ON record_index (collection, field, value);
";

/// Outcome of an idempotent upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record was inserted for the first time
    Inserted,
    /// A record with the same unique key already existed; nothing was written
    Kept,
}

/// SQLite-backed store for [`Record`] types
///
/// A `Store` owns a single connection. Concurrent access is the caller's
/// concern (Edison serializes access through its state manager).
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Integrity(format!("cannot create store directory: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Opened record store");
        Ok(Self { conn })
    }

    /// Open an in-memory store (tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened in-memory record store");
        Ok(Self { conn })
    }

    /// Run `f` inside a single transaction
    ///
    /// Any error from `f` rolls the whole transaction back.
    pub fn in_txn<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Insert a new record
    ///
    /// Fails with [`StoreError::Conflict`] if the ID or unique key already
    /// exists in the collection.
    pub fn create<R: Record>(&mut self, record: &R) -> Result<()> {
        let collection = R::collection_name();
        let body = serde_json::to_string(record)?;
        debug!(collection, id = record.id(), "Store::create");

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO records (collection, id, body, unique_key, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, record.id(), body, record.unique_key(), record.updated_at()],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "{}/{} already exists",
                collection,
                record.id()
            )));
        }
        self.write_indexes(collection, record)?;
        Ok(())
    }

    /// Update an existing record in place
    pub fn update<R: Record>(&mut self, record: &R) -> Result<()> {
        let collection = R::collection_name();
        let body = serde_json::to_string(record)?;
        debug!(collection, id = record.id(), "Store::update");

        let changed = self.conn.execute(
            "UPDATE records SET body = ?3, unique_key = ?4, updated_at = ?5 WHERE collection = ?1 AND id = ?2",
            params![collection, record.id(), body, record.unique_key(), record.updated_at()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("{}/{}", collection, record.id())));
        }
        self.write_indexes(collection, record)?;
        Ok(())
    }

    /// Idempotent insert keyed by the record's unique key
    ///
    /// If a record with the same unique key already exists, nothing is
    /// written and [`UpsertOutcome::Kept`] is returned. Records without a
    /// unique key cannot be upserted.
    pub fn upsert<R: Record>(&mut self, record: &R) -> Result<UpsertOutcome> {
        let collection = R::collection_name();
        let key = record.unique_key().ok_or_else(|| {
            StoreError::Integrity(format!("{} records carry no unique key; use create", collection))
        })?;

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM records WHERE collection = ?1 AND unique_key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            debug!(collection, key, "Store::upsert: kept existing");
            return Ok(UpsertOutcome::Kept);
        }

        self.create(record)?;
        debug!(collection, key, "Store::upsert: inserted");
        Ok(UpsertOutcome::Inserted)
    }

    /// Fetch a record by ID
    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND id = ?2",
                params![R::collection_name(), id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Fetch a record by its unique key
    pub fn get_by_unique<R: Record>(&self, unique_key: &str) -> Result<Option<R>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND unique_key = ?2",
                params![R::collection_name(), unique_key],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// List records matching all the given filters, oldest first
    ///
    /// Filters apply to indexed fields only. An empty filter list returns the
    /// whole collection.
    pub fn list<R: Record>(&self, filters: &[Filter]) -> Result<Vec<R>> {
        let collection = R::collection_name();
        let mut records = Vec::new();

        let mut stmt = self.conn.prepare(
            "SELECT id, body FROM records WHERE collection = ?1 ORDER BY updated_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (id, body) = row?;
            if self.matches_filters(collection, &id, filters)? {
                records.push(serde_json::from_str(&body)?);
            }
        }
        Ok(records)
    }

    /// Count records matching all the given filters
    pub fn count<R: Record>(&self, filters: &[Filter]) -> Result<usize> {
        Ok(self.list::<R>(filters)?.len())
    }

    /// Delete a record by ID, returning whether it existed
    pub fn delete<R: Record>(&mut self, id: &str) -> Result<bool> {
        let collection = R::collection_name();
        let deleted = self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        self.conn.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(deleted > 0)
    }

    /// Delete all records whose indexed field holds the given value
    pub fn delete_by_index<R: Record>(&mut self, field: &str, value: IndexValue) -> Result<usize> {
        let collection = R::collection_name();
        let ids: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT id FROM record_index WHERE collection = ?1 AND field = ?2 AND value = ?3",
            )?;
            let rows = stmt.query_map(params![collection, field, value.as_text()], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for id in &ids {
            self.delete::<R>(id)?;
        }
        Ok(ids.len())
    }

    /// Rebuild secondary indexes for a collection, returning the record count
    pub fn rebuild_indexes<R: Record>(&mut self) -> Result<usize> {
        let collection = R::collection_name();
        let records: Vec<R> = self.list(&[])?;
        self.conn.execute(
            "DELETE FROM record_index WHERE collection = ?1",
            params![collection],
        )?;
        for record in &records {
            self.write_indexes(collection, record)?;
        }
        debug!(collection, count = records.len(), "Store::rebuild_indexes");
        Ok(records.len())
    }

    fn write_indexes<R: Record>(&mut self, collection: &str, record: &R) -> Result<()> {
        self.conn.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            params![collection, record.id()],
        )?;
        for (field, value) in record.indexed_fields() {
            self.conn.execute(
                "INSERT INTO record_index (collection, field, id, value) VALUES (?1, ?2, ?3, ?4)",
                params![collection, field, record.id(), value.as_text()],
            )?;
        }
        Ok(())
    }

    fn matches_filters(&self, collection: &str, id: &str, filters: &[Filter]) -> Result<bool> {
        for filter in filters {
            let value: Option<String> = self
                .conn
                .query_row(
                    "SELECT value FROM record_index WHERE collection = ?1 AND field = ?2 AND id = ?3",
                    params![collection, filter.field, id],
                    |row| row.get(0),
                )
                .optional()?;
            let matched = match (&filter.op, value) {
                (FilterOp::Eq, Some(v)) => v == filter.value.as_text(),
                (FilterOp::Eq, None) => false,
                (FilterOp::Ne, Some(v)) => v != filter.value.as_text(),
                (FilterOp::Ne, None) => true,
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_ms;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        color: String,
        size: i64,
        dedup: Option<String>,
        updated_at: i64,
    }

    impl Widget {
        fn new(id: &str, color: &str, size: i64) -> Self {
            Self {
                id: id.to_string(),
                color: color.to_string(),
                size,
                dedup: None,
                updated_at: now_ms(),
            }
        }

        fn with_dedup(mut self, key: &str) -> Self {
            self.dedup = Some(key.to_string());
            self
        }
    }

    impl Record for Widget {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "widgets"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("color".to_string(), IndexValue::String(self.color.clone()));
            fields.insert("size".to_string(), IndexValue::Integer(self.size));
            fields
        }

        fn unique_key(&self) -> Option<String> {
            self.dedup.clone()
        }
    }

    #[test]
    fn test_create_and_get() {
        let mut store = Store::open_in_memory().unwrap();
        let widget = Widget::new("w1", "red", 3);
        store.create(&widget).unwrap();

        let loaded: Widget = store.get("w1").unwrap().unwrap();
        assert_eq!(loaded, widget);
        assert!(store.get::<Widget>("missing").unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_id_conflicts() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(&Widget::new("w1", "red", 3)).unwrap();

        let result = store.create(&Widget::new("w1", "blue", 4));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_update() {
        let mut store = Store::open_in_memory().unwrap();
        let mut widget = Widget::new("w1", "red", 3);
        store.create(&widget).unwrap();

        widget.color = "green".to_string();
        store.update(&widget).unwrap();

        let loaded: Widget = store.get("w1").unwrap().unwrap();
        assert_eq!(loaded.color, "green");
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let mut store = Store::open_in_memory().unwrap();
        let result = store.update(&Widget::new("ghost", "red", 1));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        let first = Widget::new("w1", "red", 3).with_dedup("key-1");
        let replay = Widget::new("w2", "blue", 9).with_dedup("key-1");

        assert_eq!(store.upsert(&first).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&replay).unwrap(), UpsertOutcome::Kept);

        // The replay must not have overwritten the original
        let stored: Widget = store.get_by_unique("key-1").unwrap().unwrap();
        assert_eq!(stored.id, "w1");
        assert_eq!(stored.color, "red");
        assert!(store.get::<Widget>("w2").unwrap().is_none());
    }

    #[test]
    fn test_upsert_without_key_is_rejected() {
        let mut store = Store::open_in_memory().unwrap();
        let result = store.upsert(&Widget::new("w1", "red", 3));
        assert!(matches!(result, Err(StoreError::Integrity(_))));
    }

    #[test]
    fn test_list_with_filters() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(&Widget::new("w1", "red", 3)).unwrap();
        store.create(&Widget::new("w2", "red", 5)).unwrap();
        store.create(&Widget::new("w3", "blue", 3)).unwrap();

        let reds: Vec<Widget> = store
            .list(&[Filter::eq("color", IndexValue::String("red".into()))])
            .unwrap();
        assert_eq!(reds.len(), 2);

        let red_threes: Vec<Widget> = store
            .list(&[
                Filter::eq("color", IndexValue::String("red".into())),
                Filter::eq("size", IndexValue::Integer(3)),
            ])
            .unwrap();
        assert_eq!(red_threes.len(), 1);
        assert_eq!(red_threes[0].id, "w1");

        let not_blue: Vec<Widget> = store
            .list(&[Filter::ne("color", IndexValue::String("blue".into()))])
            .unwrap();
        assert_eq!(not_blue.len(), 2);
    }

    #[test]
    fn test_delete_by_index() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(&Widget::new("w1", "red", 3)).unwrap();
        store.create(&Widget::new("w2", "red", 5)).unwrap();
        store.create(&Widget::new("w3", "blue", 3)).unwrap();

        let removed = store
            .delete_by_index::<Widget>("color", IndexValue::String("red".into()))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count::<Widget>(&[]).unwrap(), 1);
    }

    #[test]
    fn test_txn_rolls_back_on_error() {
        let mut store = Store::open_in_memory().unwrap();
        let result: crate::Result<()> = store.in_txn(|s| {
            s.create(&Widget::new("w1", "red", 3))?;
            Err(StoreError::Integrity("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(store.get::<Widget>("w1").unwrap().is_none());
    }

    #[test]
    fn test_txn_commits() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .in_txn(|s| {
                s.create(&Widget::new("w1", "red", 3))?;
                s.create(&Widget::new("w2", "blue", 4))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.count::<Widget>(&[]).unwrap(), 2);
    }

    #[test]
    fn test_rebuild_indexes() {
        let mut store = Store::open_in_memory().unwrap();
        store.create(&Widget::new("w1", "red", 3)).unwrap();
        store.create(&Widget::new("w2", "blue", 4)).unwrap();

        let count = store.rebuild_indexes::<Widget>().unwrap();
        assert_eq!(count, 2);

        let reds: Vec<Widget> = store
            .list(&[Filter::eq("color", IndexValue::String("red".into()))])
            .unwrap();
        assert_eq!(reds.len(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("records.db");
        {
            let mut store = Store::open(&path).unwrap();
            store.create(&Widget::new("w1", "red", 3)).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let loaded: Widget = store.get("w1").unwrap().unwrap();
        assert_eq!(loaded.color, "red");
    }
}
