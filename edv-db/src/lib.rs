//! SQLite-backed document engine.
//!
//! [`SqliteEngine`] implements the `edv-core` document-engine contract
//! over a single `SQLite` database: one `records` table keyed by
//! `(collection, id)` holding JSON bodies, a revision column for
//! optimistic concurrency, and a `deleted` flag for tombstones. Selector
//! matching runs in process over the stored JSON; registered indexes
//! validate query hints and keep the schema honest about what queries the
//! store expects to serve.

mod engine;
mod schema;

pub use engine::SqliteEngine;
