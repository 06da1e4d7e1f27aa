//! EdisonStore - generic persistent record storage over SQLite
//!
//! Records are serde-serializable documents grouped into collections. Each
//! collection gets secondary indexes (declared per record via
//! [`Record::indexed_fields`]) and an optional unique key used for idempotent
//! inserts: replaying a write with the same unique key returns the stored
//! record instead of creating a duplicate.
//!
//! The store surface is small: open, create, get, update, upsert, list,
//! delete, plus explicit transactions for multi-record invariants.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

mod store;

pub use store::{Store, UpsertOutcome};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value stored in a secondary index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl IndexValue {
    /// Canonical text representation used as the index column value
    pub fn as_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Boolean(b) => b.to_string(),
        }
    }
}

/// Comparison operator for list filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

/// A single filter applied against an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Equality filter on an indexed field
    pub fn eq(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value,
        }
    }

    /// Inequality filter on an indexed field
    pub fn ne(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value,
        }
    }
}

/// A persistable record
///
/// Implementors declare their collection name, indexed fields, and an
/// optional unique key. The unique key drives idempotent upserts: two records
/// with the same unique key in the same collection are the same logical
/// write.
pub trait Record: Serialize + DeserializeOwned {
    /// Unique record ID within the collection
    fn id(&self) -> &str;

    /// Last update timestamp (Unix milliseconds)
    fn updated_at(&self) -> i64;

    /// Collection this record type is stored in
    fn collection_name() -> &'static str;

    /// Fields to maintain secondary indexes for
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        HashMap::new()
    }

    /// Idempotency key, if this record type has one
    fn unique_key(&self) -> Option<String> {
        None
    }
}

/// Errors surfaced by the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Store operation result
pub type Result<T> = std::result::Result<T, StoreError>;
