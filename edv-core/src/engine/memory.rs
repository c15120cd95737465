//! In-memory document engine.
//!
//! Reference implementation of the [`DocumentEngine`] contract backed by
//! `RwLock`-guarded maps. It is the engine used throughout this crate's
//! tests and doubles as the executable description of the contract's write
//! and tombstone semantics.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde_json::Value;

use super::{
    selector, DocumentEngine, EngineError, EngineResult, FindQuery, IndexSpec, JsonObject,
    PutResult, DELETED_FIELD, ID_FIELD, REV_FIELD,
};

#[derive(Default)]
struct StoredRecord {
    body: JsonObject,
    deleted: bool,
}

#[derive(Default)]
struct MemoryCollection {
    records: BTreeMap<String, StoredRecord>,
    indexes: HashMap<(String, String), IndexSpec>,
}

/// In-memory [`DocumentEngine`].
#[derive(Default)]
pub struct MemoryEngine {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl MemoryEngine {
    /// Creates a new empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live (non-tombstoned) records in a collection.
    #[must_use]
    pub fn live_len(&self, collection: &str) -> usize {
        let collections = self.collections.read().unwrap();
        collections.get(collection).map_or(0, |c| {
            c.records.values().filter(|r| !r.deleted).count()
        })
    }

    /// Returns the number of tombstoned records awaiting purge.
    #[must_use]
    pub fn tombstone_len(&self, collection: &str) -> usize {
        let collections = self.collections.read().unwrap();
        collections.get(collection).map_or(0, |c| {
            c.records.values().filter(|r| r.deleted).count()
        })
    }

    /// Drops all collections and records.
    pub fn clear(&self) {
        self.collections.write().unwrap().clear();
    }

    fn fresh_post_id() -> String {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        hex::encode(bytes)
    }
}

impl DocumentEngine for MemoryEngine {
    fn ensure_collection(&self, name: &str) -> EngineResult<()> {
        let mut collections = self.collections.write().unwrap();
        collections.entry(name.to_string()).or_default();
        Ok(())
    }

    fn ensure_index(&self, collection: &str, spec: IndexSpec) -> EngineResult<()> {
        let mut collections = self.collections.write().unwrap();
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| EngineError::UnknownCollection {
                name: collection.to_string(),
            })?;
        entry
            .indexes
            .insert((spec.ddoc.clone(), spec.name.clone()), spec);
        Ok(())
    }

    fn put(&self, collection: &str, mut record: JsonObject) -> EngineResult<PutResult> {
        let id = super::record_id(&record)?.to_string();
        let supplied_rev = record
            .get(REV_FIELD)
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let deleted = super::is_tombstone(&record);

        let mut collections = self.collections.write().unwrap();
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| EngineError::UnknownCollection {
                name: collection.to_string(),
            })?;

        let previous = entry.records.get(&id);
        let stored_rev = previous.map(|existing| {
            existing
                .body
                .get(REV_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });

        let conflict = || EngineError::Conflict {
            collection: collection.to_string(),
            id: id.clone(),
        };

        // Revision check. A tombstone no longer pins a revision, so a
        // rev-less put over it recreates the record.
        let base_rev = match (previous, &supplied_rev) {
            (None, None) => None,
            (None, Some(_)) => return Err(conflict()),
            (Some(existing), None) => {
                if existing.deleted {
                    stored_rev
                } else {
                    return Err(conflict());
                }
            }
            (Some(_), Some(supplied)) => {
                if stored_rev.as_deref() == Some(supplied.as_str()) {
                    stored_rev
                } else {
                    return Err(conflict());
                }
            }
        };

        let rev = super::next_rev(base_rev.as_deref());
        record.insert(REV_FIELD.to_string(), Value::from(rev.clone()));
        record.remove(DELETED_FIELD);
        if deleted {
            record.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        }

        entry.records.insert(
            id.clone(),
            StoredRecord {
                body: record,
                deleted,
            },
        );

        Ok(PutResult { id, rev })
    }

    fn post(&self, collection: &str, mut record: JsonObject) -> EngineResult<PutResult> {
        record.insert(ID_FIELD.to_string(), Value::from(Self::fresh_post_id()));
        self.put(collection, record)
    }

    fn find(&self, collection: &str, query: &FindQuery) -> EngineResult<Vec<JsonObject>> {
        let collections = self.collections.read().unwrap();
        let entry = collections
            .get(collection)
            .ok_or_else(|| EngineError::UnknownCollection {
                name: collection.to_string(),
            })?;

        if let Some(hint) = &query.use_index {
            let key = (hint.ddoc.clone(), hint.name.clone());
            if !entry.indexes.contains_key(&key) {
                return Err(EngineError::UnknownIndex {
                    collection: collection.to_string(),
                    ddoc: hint.ddoc.clone(),
                    name: hint.name.clone(),
                });
            }
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();
        for stored in entry.records.values() {
            if stored.deleted {
                continue;
            }
            if selector::matches(&query.selector, &Value::Object(stored.body.clone())) {
                results.push(stored.body.clone());
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    fn purge_deleted(&self, collection: &str) -> EngineResult<u64> {
        let mut collections = self.collections.write().unwrap();
        let entry = collections
            .get_mut(collection)
            .ok_or_else(|| EngineError::UnknownCollection {
                name: collection.to_string(),
            })?;

        let before = entry.records.len();
        entry.records.retain(|_, record| !record.deleted);
        Ok((before - entry.records.len()) as u64)
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> JsonObject {
        value.as_object().unwrap().clone()
    }

    fn engine_with(collection: &str) -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.ensure_collection(collection).unwrap();
        engine
    }

    #[test]
    fn put_creates_and_assigns_rev() {
        let engine = engine_with("c");
        let result = engine.put("c", obj(json!({"_id": "a", "n": 1}))).unwrap();
        assert_eq!(result.id, "a");
        assert!(result.rev.starts_with("1-"));
        assert_eq!(engine.live_len("c"), 1);
    }

    #[test]
    fn put_without_rev_conflicts_on_live_record() {
        let engine = engine_with("c");
        engine.put("c", obj(json!({"_id": "a"}))).unwrap();

        let err = engine.put("c", obj(json!({"_id": "a"}))).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn put_with_stale_rev_conflicts() {
        let engine = engine_with("c");
        let first = engine.put("c", obj(json!({"_id": "a", "n": 1}))).unwrap();
        engine
            .put("c", obj(json!({"_id": "a", "_rev": first.rev, "n": 2})))
            .unwrap();

        let err = engine
            .put("c", obj(json!({"_id": "a", "_rev": first.rev, "n": 3})))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn put_with_rev_on_missing_record_conflicts() {
        let engine = engine_with("c");
        let err = engine
            .put("c", obj(json!({"_id": "a", "_rev": "1-00"})))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn tombstone_is_hidden_but_counted() {
        let engine = engine_with("c");
        let first = engine.put("c", obj(json!({"_id": "a"}))).unwrap();
        engine
            .put("c", obj(json!({"_id": "a", "_rev": first.rev, "_deleted": true})))
            .unwrap();

        let found = engine
            .find("c", &FindQuery::new(json!({"_id": "a"})))
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(engine.tombstone_len("c"), 1);
    }

    #[test]
    fn tombstone_can_be_recreated_without_rev() {
        let engine = engine_with("c");
        let first = engine.put("c", obj(json!({"_id": "a"}))).unwrap();
        engine
            .put("c", obj(json!({"_id": "a", "_rev": first.rev, "_deleted": true})))
            .unwrap();

        let recreated = engine.put("c", obj(json!({"_id": "a", "n": 2}))).unwrap();
        assert!(recreated.rev.starts_with("3-"));
        assert_eq!(engine.live_len("c"), 1);
    }

    #[test]
    fn purge_removes_only_tombstones() {
        let engine = engine_with("c");
        let a = engine.put("c", obj(json!({"_id": "a"}))).unwrap();
        engine.put("c", obj(json!({"_id": "b"}))).unwrap();
        engine
            .put("c", obj(json!({"_id": "a", "_rev": a.rev, "_deleted": true})))
            .unwrap();

        assert_eq!(engine.purge_deleted("c").unwrap(), 1);
        assert_eq!(engine.purge_deleted("c").unwrap(), 0);
        assert_eq!(engine.live_len("c"), 1);
    }

    #[test]
    fn find_applies_limit() {
        let engine = engine_with("c");
        for i in 0..5 {
            engine
                .put("c", obj(json!({"_id": format!("id{i}"), "kind": "x"})))
                .unwrap();
        }

        let query = FindQuery::new(json!({"kind": "x"})).with_limit(3);
        assert_eq!(engine.find("c", &query).unwrap().len(), 3);
    }

    #[test]
    fn find_rejects_unknown_index_hint() {
        let engine = engine_with("c");
        let query =
            FindQuery::new(json!({})).with_index(super::super::IndexHint::new("ddoc", "nope"));
        let err = engine.find("c", &query).unwrap_err();
        assert!(matches!(err, EngineError::UnknownIndex { .. }));
    }

    #[test]
    fn ensure_index_registers_hintable_index() {
        let engine = engine_with("c");
        engine
            .ensure_index(
                "c",
                IndexSpec {
                    ddoc: "ddoc".into(),
                    name: "attrs".into(),
                    fields: vec!["localEdvId".into(), "attributes".into()],
                    require_field: Some("attributes".into()),
                },
            )
            .unwrap();

        let query = FindQuery::new(json!({})).with_index(super::super::IndexHint::new("ddoc", "attrs"));
        assert!(engine.find("c", &query).is_ok());
    }

    #[test]
    fn post_assigns_fresh_ids() {
        let engine = engine_with("c");
        let a = engine.post("c", obj(json!({"n": 1}))).unwrap();
        let b = engine.post("c", obj(json!({"n": 2}))).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(engine.live_len("c"), 2);
    }

    #[test]
    fn unknown_collection_is_an_error() {
        let engine = MemoryEngine::new();
        let err = engine.put("missing", obj(json!({"_id": "a"}))).unwrap_err();
        assert!(matches!(err, EngineError::UnknownCollection { .. }));
    }
}
