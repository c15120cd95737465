//! The engine implementation.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use edv_core::engine::{
    is_tombstone, next_rev, record_id, selector, DocumentEngine, EngineError, EngineResult,
    FindQuery, IndexSpec, JsonObject, PutResult, DELETED_FIELD, ID_FIELD, REV_FIELD,
};

use crate::schema::{ensure_schema, map_db_err};

/// A document engine persisted in one `SQLite` database.
///
/// The connection is serialized behind a mutex; writes run in a
/// transaction so the revision check and the row write are atomic per
/// record.
pub struct SqliteEngine {
    conn: Mutex<Connection>,
}

impl SqliteEngine {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or its schema
    /// cannot be created or validated.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path).map_err(map_db_err)?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_db_err)?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn assert_collection(conn: &Connection, name: &str) -> EngineResult<()> {
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM collections WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_db_err)?;
        if exists.is_none() {
            return Err(EngineError::UnknownCollection {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn fresh_post_id() -> String {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        hex::encode(bytes)
    }

    fn parse_body(body: &str) -> EngineResult<JsonObject> {
        let value: Value = serde_json::from_str(body)
            .map_err(|err| EngineError::backend(format!("corrupt record body: {err}")))?;
        value
            .as_object()
            .cloned()
            .ok_or_else(|| EngineError::backend("record body is not an object"))
    }
}

impl DocumentEngine for SqliteEngine {
    fn ensure_collection(&self, name: &str) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
            [name],
        )
        .map_err(map_db_err)?;
        Ok(())
    }

    fn ensure_index(&self, collection: &str, spec: IndexSpec) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::assert_collection(&conn, collection)?;

        let fields = serde_json::to_string(&spec.fields)
            .map_err(|err| EngineError::backend(err.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO indexes (collection, ddoc, name, spec)
             VALUES (?1, ?2, ?3, ?4)",
            params![collection, spec.ddoc, spec.name, fields],
        )
        .map_err(map_db_err)?;
        Ok(())
    }

    fn put(&self, collection: &str, mut record: JsonObject) -> EngineResult<PutResult> {
        let id = record_id(&record)?.to_string();
        let supplied_rev = record
            .get(REV_FIELD)
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let deleted = is_tombstone(&record);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        Self::assert_collection(&tx, collection)?;

        let previous: Option<(String, bool)> = tx
            .query_row(
                "SELECT rev, deleted FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()
            .map_err(map_db_err)?;

        let conflict = || EngineError::Conflict {
            collection: collection.to_string(),
            id: id.clone(),
        };

        // Same revision discipline as the in-memory reference engine: a
        // tombstone no longer pins a revision.
        let base_rev = match (&previous, &supplied_rev) {
            (None, None) => None,
            (None, Some(_)) => return Err(conflict()),
            (Some((stored, was_deleted)), None) => {
                if *was_deleted {
                    Some(stored.clone())
                } else {
                    return Err(conflict());
                }
            }
            (Some((stored, _)), Some(supplied)) => {
                if stored == supplied {
                    Some(stored.clone())
                } else {
                    return Err(conflict());
                }
            }
        };

        let rev = next_rev(base_rev.as_deref());
        record.insert(REV_FIELD.to_string(), Value::from(rev.clone()));
        record.remove(DELETED_FIELD);
        if deleted {
            record.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        }
        let body = serde_json::to_string(&Value::Object(record))
            .map_err(|err| EngineError::backend(err.to_string()))?;

        tx.execute(
            "INSERT OR REPLACE INTO records (collection, id, rev, deleted, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, id, rev, i64::from(deleted), body],
        )
        .map_err(map_db_err)?;
        tx.commit().map_err(map_db_err)?;

        Ok(PutResult { id, rev })
    }

    fn post(&self, collection: &str, mut record: JsonObject) -> EngineResult<PutResult> {
        record.insert(ID_FIELD.to_string(), Value::from(Self::fresh_post_id()));
        self.put(collection, record)
    }

    fn find(&self, collection: &str, query: &FindQuery) -> EngineResult<Vec<JsonObject>> {
        let conn = self.conn.lock().unwrap();
        Self::assert_collection(&conn, collection)?;

        if let Some(hint) = &query.use_index {
            let known: Option<String> = conn
                .query_row(
                    "SELECT name FROM indexes
                     WHERE collection = ?1 AND ddoc = ?2 AND name = ?3",
                    params![collection, hint.ddoc, hint.name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_db_err)?;
            if known.is_none() {
                return Err(EngineError::UnknownIndex {
                    collection: collection.to_string(),
                    ddoc: hint.ddoc.clone(),
                    name: hint.name.clone(),
                });
            }
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();

        // Primary-key fast path: a literal `_id` selector needs no scan.
        if let Some(id) = query.selector.get(ID_FIELD).and_then(Value::as_str) {
            let row: Option<String> = conn
                .query_row(
                    "SELECT body FROM records
                     WHERE collection = ?1 AND id = ?2 AND deleted = 0",
                    params![collection, id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_db_err)?;
            if let Some(body) = row {
                let record = Self::parse_body(&body)?;
                if selector::matches(&query.selector, &Value::Object(record.clone()))
                    && limit > 0
                {
                    results.push(record);
                }
            }
            return Ok(results);
        }

        let mut statement = conn
            .prepare(
                "SELECT body FROM records
                 WHERE collection = ?1 AND deleted = 0
                 ORDER BY id",
            )
            .map_err(map_db_err)?;
        let rows = statement
            .query_map([collection], |row| row.get::<_, String>(0))
            .map_err(map_db_err)?;

        for body in rows {
            let record = Self::parse_body(&body.map_err(map_db_err)?)?;
            if selector::matches(&query.selector, &Value::Object(record.clone())) {
                results.push(record);
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    fn purge_deleted(&self, collection: &str) -> EngineResult<u64> {
        let conn = self.conn.lock().unwrap();
        Self::assert_collection(&conn, collection)?;

        let removed = conn
            .execute(
                "DELETE FROM records WHERE collection = ?1 AND deleted = 1",
                [collection],
            )
            .map_err(map_db_err)?;
        Ok(removed as u64)
    }
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine").finish_non_exhaustive()
    }
}
