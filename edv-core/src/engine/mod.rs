//! Document-engine contract.
//!
//! The vault store sits on top of a local document database reached through
//! the [`DocumentEngine`] trait: named collections keyed by `_id`, writes
//! guarded by optimistic `_rev` revisions, and selector-based queries served
//! from prebuilt indexes. The engine offers no atomic compare-and-set beyond
//! `put` with a matching `_rev`; everything stronger (uniqueness, sequence
//! gating) is layered above it.
//!
//! Deletion is two-phase: a record written with `_deleted: true` becomes a
//! tombstone that is invisible to [`DocumentEngine::find`] and no longer
//! pins a revision, but stays in physical storage until
//! [`DocumentEngine::purge_deleted`] removes it.

use std::fmt;

use serde_json::Value;

pub mod memory;
pub mod selector;

pub use memory::MemoryEngine;

/// A JSON record body as stored by an engine.
pub type JsonObject = serde_json::Map<String, Value>;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Reserved record field holding the primary key.
pub const ID_FIELD: &str = "_id";

/// Reserved record field holding the revision tag.
pub const REV_FIELD: &str = "_rev";

/// Reserved record field flagging a tombstone.
pub const DELETED_FIELD: &str = "_deleted";

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by a document engine.
#[derive(Debug)]
pub enum EngineError {
    /// A write lost the optimistic concurrency race: the supplied `_rev`
    /// is stale, absent for an existing record, or names a missing record.
    Conflict {
        /// Collection the write targeted.
        collection: String,
        /// Primary key of the contested record.
        id: String,
    },

    /// The named collection has not been created.
    UnknownCollection {
        /// Collection name.
        name: String,
    },

    /// A query hinted at an index that does not exist.
    UnknownIndex {
        /// Collection the query targeted.
        collection: String,
        /// Design-document name of the missing index.
        ddoc: String,
        /// Index name.
        name: String,
    },

    /// A record body was malformed (e.g. missing `_id` on `put`).
    InvalidRecord {
        /// Description of the malformation.
        reason: String,
    },

    /// The backing database failed.
    Backend {
        /// Description of the failure.
        message: String,
    },
}

impl EngineError {
    /// Creates an invalid-record error.
    pub fn invalid_record<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns `true` for a revision conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { collection, id } => {
                write!(f, "revision conflict in \"{collection}\" for \"{id}\"")
            }
            Self::UnknownCollection { name } => write!(f, "unknown collection \"{name}\""),
            Self::UnknownIndex {
                collection,
                ddoc,
                name,
            } => write!(f, "unknown index \"{ddoc}/{name}\" in \"{collection}\""),
            Self::InvalidRecord { reason } => write!(f, "invalid record: {reason}"),
            Self::Backend { message } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

// =============================================================================
// Queries and indexes
// =============================================================================

/// A secondary index over one or more record fields.
///
/// `require_field` is a partial-filter condition: only records where the
/// named field exists are indexed. Engines that do not maintain physical
/// indexes still register specs so hints can be validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Design-document name grouping related indexes.
    pub ddoc: String,
    /// Index name, unique within the design document.
    pub name: String,
    /// Indexed field paths, in order.
    pub fields: Vec<String>,
    /// Field that must exist for a record to enter the index.
    pub require_field: Option<String>,
}

/// A hint naming the index a query expects to be served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHint {
    /// Design-document name.
    pub ddoc: String,
    /// Index name.
    pub name: String,
}

impl IndexHint {
    /// Creates an index hint.
    pub fn new<D: Into<String>, N: Into<String>>(ddoc: D, name: N) -> Self {
        Self {
            ddoc: ddoc.into(),
            name: name.into(),
        }
    }
}

/// A selector query against one collection.
#[derive(Debug, Clone)]
pub struct FindQuery {
    /// Match condition (see [`selector`]).
    pub selector: Value,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Index the caller expects to serve this query.
    pub use_index: Option<IndexHint>,
}

impl FindQuery {
    /// Creates a query with no limit and no index hint.
    #[must_use]
    pub const fn new(selector: Value) -> Self {
        Self {
            selector,
            limit: None,
            use_index: None,
        }
    }

    /// Sets the result limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the index hint.
    #[must_use]
    pub fn with_index(mut self, hint: IndexHint) -> Self {
        self.use_index = Some(hint);
        self
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// Primary key of the written record.
    pub id: String,
    /// Revision tag assigned to the written record.
    pub rev: String,
}

// =============================================================================
// Engine contract
// =============================================================================

/// A local document database: named collections of JSON records keyed by
/// `_id` with optimistic `_rev` concurrency.
///
/// # Write semantics
///
/// `put` writes the record under its `_id` field:
///
/// - creating a record requires no `_rev`;
/// - replacing a live record requires `_rev` to equal the stored revision,
///   otherwise [`EngineError::Conflict`] is returned;
/// - a tombstoned record no longer pins a revision: a `put` without `_rev`
///   recreates it;
/// - a record carrying `_deleted: true` becomes a tombstone.
///
/// `post` is `put` with an engine-chosen `_id`.
///
/// # Read semantics
///
/// `find` returns non-tombstoned records matching the selector, in
/// unspecified order, up to `limit`. An index hint naming an index that was
/// never registered is an error; engines are free to ignore valid hints.
pub trait DocumentEngine: Send + Sync + 'static {
    /// Creates the named collection if it does not exist. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing database fails.
    fn ensure_collection(&self, name: &str) -> EngineResult<()>;

    /// Registers a secondary index on a collection. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or the backing
    /// database fails.
    fn ensure_index(&self, collection: &str, spec: IndexSpec) -> EngineResult<()>;

    /// Writes a record under its `_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Conflict`] when the optimistic revision
    /// check fails, [`EngineError::InvalidRecord`] when `_id` is missing
    /// or not a string.
    fn put(&self, collection: &str, record: JsonObject) -> EngineResult<PutResult>;

    /// Writes a record under a fresh engine-chosen `_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or the backing
    /// database fails.
    fn post(&self, collection: &str, record: JsonObject) -> EngineResult<PutResult>;

    /// Runs a selector query.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection or a hinted index is unknown.
    fn find(&self, collection: &str, query: &FindQuery) -> EngineResult<Vec<JsonObject>>;

    /// Physically removes tombstoned records; returns how many were
    /// removed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or the backing
    /// database fails.
    fn purge_deleted(&self, collection: &str) -> EngineResult<u64>;
}

/// Extracts the string `_id` from a record body.
///
/// # Errors
///
/// Returns [`EngineError::InvalidRecord`] when `_id` is absent or not a
/// string.
pub fn record_id(record: &JsonObject) -> EngineResult<&str> {
    record
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::invalid_record("record is missing a string \"_id\""))
}

/// Returns `true` when the record body flags a tombstone.
#[must_use]
pub fn is_tombstone(record: &JsonObject) -> bool {
    record
        .get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Computes the successor revision tag for a record.
///
/// Revisions are `<generation>-<random hex>`; the generation increments on
/// every write so stale writers always observe a mismatch.
#[must_use]
pub fn next_rev(previous: Option<&str>) -> String {
    let generation = previous
        .and_then(|rev| rev.split('-').next())
        .and_then(|gen| gen.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;

    let mut suffix = [0u8; 8];
    getrandom::getrandom(&mut suffix).expect("getrandom failed");
    format!("{generation}-{}", hex::encode(suffix))
}
