//! Database schema management.

use rusqlite::Connection;

use edv_core::engine::{EngineError, EngineResult};

const SCHEMA_VERSION: i64 = 1;

/// Creates the schema when missing and validates its version.
pub fn ensure_schema(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
             schema_version INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS collections (
             name TEXT PRIMARY KEY
         );
         CREATE TABLE IF NOT EXISTS records (
             collection TEXT NOT NULL,
             id TEXT NOT NULL,
             rev TEXT NOT NULL,
             deleted INTEGER NOT NULL DEFAULT 0,
             body TEXT NOT NULL,
             PRIMARY KEY (collection, id)
         );
         CREATE INDEX IF NOT EXISTS records_by_deleted
             ON records (collection, deleted);
         CREATE TABLE IF NOT EXISTS indexes (
             collection TEXT NOT NULL,
             ddoc TEXT NOT NULL,
             name TEXT NOT NULL,
             spec TEXT NOT NULL,
             PRIMARY KEY (collection, ddoc, name)
         );",
    )
    .map_err(map_db_err)?;

    let version: Option<i64> = conn
        .query_row("SELECT schema_version FROM meta LIMIT 1", [], |row| {
            row.get(0)
        })
        .map_or_else(
            |err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(map_db_err(other)),
            },
            |v| Ok(Some(v)),
        )?;

    match version {
        None => {
            conn.execute(
                "INSERT INTO meta (schema_version) VALUES (?1)",
                [SCHEMA_VERSION],
            )
            .map_err(map_db_err)?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(EngineError::backend(format!(
                "unsupported schema version {v}, expected {SCHEMA_VERSION}"
            )));
        }
    }
    Ok(())
}

/// Maps a database failure onto the engine error type.
pub fn map_db_err(err: rusqlite::Error) -> EngineError {
    EngineError::backend(err.to_string())
}
