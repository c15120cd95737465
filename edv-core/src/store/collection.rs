//! Uniqueness-checked write primitives over one collection.
//!
//! The engine serializes writes per `_id` through optimistic revisions but
//! knows nothing about uniqueness across records. [`Collection::insert_one`]
//! and [`Collection::update_one`] add that as a check-then-write loop:
//! query every unique constraint, then attempt the write, restarting when a
//! concurrent writer wins the revision race.
//!
//! The check and the write are not atomic. Two writers can slip matching
//! records past each other's checks; the guarantee is eventual. A later
//! scan over the same constraints surfaces the violation, and the remedy is
//! application-level cleanup of all but one record.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::engine::{
    DocumentEngine, FindQuery, IndexHint, JsonObject, ID_FIELD, REV_FIELD,
};
use crate::error::{StoreError, StoreResult};

/// A record envelope returned from write and read operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Primary key (`_id`).
    pub id: String,
    /// Revision tag (`_rev`).
    pub rev: String,
    /// Full record body, including `_id` and `_rev`.
    pub body: JsonObject,
}

impl Record {
    fn from_body(body: JsonObject) -> StoreResult<Self> {
        let id = body
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::internal("stored record is missing \"_id\""))?
            .to_string();
        let rev = body
            .get(REV_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self { id, rev, body })
    }

    /// Returns the record body as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// A uniqueness constraint: no record other than the write target may match
/// the selector.
#[derive(Debug, Clone)]
pub struct UniqueConstraint {
    /// Selector identifying the constrained slot.
    pub selector: Value,
    /// Index expected to serve the constraint query.
    pub use_index: Option<IndexHint>,
}

impl UniqueConstraint {
    /// Creates a constraint from a selector.
    #[must_use]
    pub const fn new(selector: Value) -> Self {
        Self {
            selector,
            use_index: None,
        }
    }

    /// Sets the index hint.
    #[must_use]
    pub fn with_index(mut self, hint: IndexHint) -> Self {
        self.use_index = Some(hint);
        self
    }

    fn for_id(id: &str) -> Self {
        Self::new(serde_json::json!({ ID_FIELD: id }))
    }
}

/// A handle on one engine collection.
pub struct Collection<E> {
    engine: Arc<E>,
    name: String,
}

impl<E> Clone for Collection<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            name: self.name.clone(),
        }
    }
}

impl<E: DocumentEngine> Collection<E> {
    /// Creates a handle on `name` over `engine`.
    pub fn new(engine: Arc<E>, name: impl Into<String>) -> Self {
        Self {
            engine,
            name: name.into(),
        }
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the underlying engine handle.
    #[must_use]
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Runs a selector query, returning record envelopes.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the query.
    pub fn find(&self, query: &FindQuery) -> StoreResult<Vec<Record>> {
        let bodies = self.engine.find(&self.name, query)?;
        bodies.into_iter().map(Record::from_body).collect()
    }

    /// Returns the sole record matching `selector`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the query.
    pub fn find_one(&self, selector: Value) -> StoreResult<Option<Record>> {
        let query = FindQuery::new(selector).with_limit(1);
        Ok(self.find(&query)?.into_iter().next())
    }

    /// Inserts a record, enforcing uniqueness constraints.
    ///
    /// An implicit constraint on `_id` is added when the record carries one;
    /// a record without `_id` gets an engine-chosen key. The uniqueness
    /// check and the write race benignly with concurrent writers; revision
    /// conflicts restart the loop.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] carrying the existing record when
    /// any constraint matches, or an engine error on storage failure.
    pub fn insert_one(
        &self,
        record: JsonObject,
        unique_constraints: &[UniqueConstraint],
    ) -> StoreResult<Record> {
        let id = record
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let mut constraints = Vec::with_capacity(unique_constraints.len() + 1);
        if let Some(id) = &id {
            constraints.push(UniqueConstraint::for_id(id));
        }
        constraints.extend_from_slice(unique_constraints);

        loop {
            self.check_constraints(&constraints, None)?;

            let attempt = if id.is_some() {
                self.engine.put(&self.name, record.clone())
            } else {
                self.engine.post(&self.name, record.clone())
            };

            match attempt {
                Ok(result) => {
                    let mut body = record.clone();
                    body.insert(ID_FIELD.to_string(), Value::from(result.id));
                    body.insert(REV_FIELD.to_string(), Value::from(result.rev));
                    return Record::from_body(body);
                }
                Err(err) if err.is_conflict() => {
                    debug!(collection = %self.name, "insert lost revision race; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Updates the sole record matching `selector`, enforcing uniqueness
    /// constraints.
    ///
    /// Returns `Ok(None)` when nothing matches and `upsert` is off;
    /// delegates to [`Collection::insert_one`] when `upsert` is on. The
    /// write targets the matched record's `_id`/`_rev`; revision conflicts
    /// restart the loop.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] when a constraint matches a
    /// record other than the update target, or an engine error on storage
    /// failure.
    pub fn update_one(
        &self,
        record: JsonObject,
        selector: Value,
        upsert: bool,
        unique_constraints: &[UniqueConstraint],
    ) -> StoreResult<Option<Record>> {
        loop {
            let Some(existing) = self.find_one(selector.clone())? else {
                if upsert {
                    return self.insert_one(record, unique_constraints).map(Some);
                }
                return Ok(None);
            };

            let mut constraints = Vec::with_capacity(unique_constraints.len() + 1);
            if let Some(id) = record.get(ID_FIELD).and_then(Value::as_str) {
                constraints.push(UniqueConstraint::for_id(id));
            }
            constraints.extend_from_slice(unique_constraints);
            self.check_constraints(&constraints, Some(&existing.id))?;

            let mut body = record.clone();
            body.insert(ID_FIELD.to_string(), Value::from(existing.id.clone()));
            body.insert(REV_FIELD.to_string(), Value::from(existing.rev.clone()));

            match self.engine.put(&self.name, body.clone()) {
                Ok(result) => {
                    body.insert(REV_FIELD.to_string(), Value::from(result.rev));
                    return Record::from_body(body).map(Some);
                }
                Err(err) if err.is_conflict() => {
                    debug!(collection = %self.name, "update lost revision race; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Fails when any constraint matches a record other than `target_id`.
    fn check_constraints(
        &self,
        constraints: &[UniqueConstraint],
        target_id: Option<&str>,
    ) -> StoreResult<()> {
        for constraint in constraints {
            let query = FindQuery {
                selector: constraint.selector.clone(),
                limit: Some(1),
                use_index: constraint.use_index.clone(),
            };
            if let Some(hit) = self.find(&query)?.into_iter().next() {
                if target_id == Some(hit.id.as_str()) {
                    continue;
                }
                return Err(StoreError::constraint_with_existing(
                    "Uniqueness constraint violated.",
                    hit.to_value(),
                ));
            }
        }
        Ok(())
    }
}

impl<E> std::fmt::Debug for Collection<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use serde_json::json;

    fn collection() -> Collection<MemoryEngine> {
        let engine = Arc::new(MemoryEngine::new());
        engine.ensure_collection("c").unwrap();
        Collection::new(engine, "c")
    }

    fn obj(value: Value) -> JsonObject {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn insert_one_enforces_id_uniqueness() {
        let c = collection();
        c.insert_one(obj(json!({"_id": "a", "n": 1})), &[]).unwrap();

        let err = c
            .insert_one(obj(json!({"_id": "a", "n": 2})), &[])
            .unwrap_err();
        assert!(err.is_constraint());
        let existing = err.constraint_existing().unwrap();
        assert_eq!(existing["_id"], "a");
        assert_eq!(existing["n"], 1);
    }

    #[test]
    fn insert_one_enforces_custom_constraints() {
        let c = collection();
        c.insert_one(obj(json!({"_id": "a", "tags": ["t1"]})), &[])
            .unwrap();

        let constraint =
            UniqueConstraint::new(json!({"tags": {"$in": ["t1", "t9"]}}));
        let err = c
            .insert_one(obj(json!({"_id": "b", "tags": ["t1"]})), &[constraint])
            .unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn insert_one_without_id_posts() {
        let c = collection();
        let record = c.insert_one(obj(json!({"n": 1})), &[]).unwrap();
        assert!(!record.id.is_empty());
        assert!(record.rev.starts_with("1-"));
    }

    #[test]
    fn update_one_returns_none_without_match() {
        let c = collection();
        let result = c
            .update_one(obj(json!({"_id": "a", "n": 1})), json!({"_id": "a"}), false, &[])
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn update_one_upserts_when_requested() {
        let c = collection();
        let record = c
            .update_one(obj(json!({"_id": "a", "n": 1})), json!({"_id": "a"}), true, &[])
            .unwrap()
            .unwrap();
        assert_eq!(record.body["n"], 1);

        let record = c
            .update_one(obj(json!({"_id": "a", "n": 2})), json!({"_id": "a"}), true, &[])
            .unwrap()
            .unwrap();
        assert_eq!(record.body["n"], 2);
        assert!(record.rev.starts_with("2-"));
    }

    #[test]
    fn update_one_rejects_constraint_held_by_other_record() {
        let c = collection();
        c.insert_one(obj(json!({"_id": "a", "tag": "t"})), &[]).unwrap();
        c.insert_one(obj(json!({"_id": "b", "tag": "u"})), &[]).unwrap();

        let constraint = UniqueConstraint::new(json!({"tag": "t"}));
        let err = c
            .update_one(
                obj(json!({"_id": "b", "tag": "t"})),
                json!({"_id": "b"}),
                false,
                &[constraint],
            )
            .unwrap_err();
        assert!(err.is_constraint());
        assert_eq!(err.constraint_existing().unwrap()["_id"], "a");
    }

    #[test]
    fn update_one_allows_constraint_held_by_target() {
        let c = collection();
        c.insert_one(obj(json!({"_id": "a", "tag": "t", "n": 1})), &[])
            .unwrap();

        let constraint = UniqueConstraint::new(json!({"tag": "t"}));
        let record = c
            .update_one(
                obj(json!({"_id": "a", "tag": "t", "n": 2})),
                json!({"_id": "a"}),
                false,
                &[constraint],
            )
            .unwrap()
            .unwrap();
        assert_eq!(record.body["n"], 2);
    }

    #[test]
    fn update_one_uses_selector_beyond_id() {
        let c = collection();
        c.insert_one(obj(json!({"_id": "a", "config": {"sequence": 0}})), &[])
            .unwrap();

        // Stale gate: no match.
        let missed = c
            .update_one(
                obj(json!({"_id": "a", "config": {"sequence": 2}})),
                json!({"_id": "a", "config.sequence": 1}),
                false,
                &[],
            )
            .unwrap();
        assert!(missed.is_none());

        // Correct gate: matches.
        let updated = c
            .update_one(
                obj(json!({"_id": "a", "config": {"sequence": 1}})),
                json!({"_id": "a", "config.sequence": 0}),
                false,
                &[],
            )
            .unwrap();
        assert!(updated.is_some());
    }
}
