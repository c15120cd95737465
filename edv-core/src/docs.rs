//! Encrypted-document storage.
//!
//! Documents are opaque JWE blobs with blinded index attributes. Each
//! record is keyed `"<localEdvId>:<docId>"` and carries three derived
//! arrays rebuilt on every write from `doc.indexed`:
//!
//! * `attributes` — `hmacId:name:value` triples (percent-encoded) for
//!   equality queries;
//! * `attributeNames` — `hmacId:name` pairs for presence queries;
//! * `uniqueAttributes` — the subset of `attributes` under a uniqueness
//!   constraint.
//!
//! Sequence gating: an upsert only lands when it carries
//! `sequence == stored + 1`; a fresh upsert inserts directly.

use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::edvs::KeyReference;
use crate::engine::{DocumentEngine, IndexHint, IndexSpec, JsonObject, DELETED_FIELD, ID_FIELD};
use crate::error::{StoreError, StoreResult};
use crate::ids::LocalId;
use crate::purge::PurgeScheduler;
use crate::store::{validate_sequence, Collection, Record, UniqueConstraint};

/// Collection holding document records.
pub const COLLECTION_NAME: &str = "edv-storage-doc";

/// Design document grouping this collection's indexes.
pub const INDEX_DDOC: &str = "edv-doc";

/// Equality index over `[localEdvId, attributes]`.
pub const ATTRIBUTES_INDEX: &str = "attributes";

/// Presence index over `[localEdvId, attributeNames]`.
pub const ATTRIBUTE_NAMES_INDEX: &str = "attributes.name";

/// Uniqueness index over `[localEdvId, uniqueAttributes]`.
pub const UNIQUE_ATTRIBUTES_INDEX: &str = "attributes.unique";

/// Percent-encoding set matching JavaScript's `encodeURIComponent`:
/// everything but ALPHA / DIGIT / `-` `_` `.` `!` `~` `*` `'` `(` `)`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encodes one segment of a blinded attribute key.
#[must_use]
pub(crate) fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

// =============================================================================
// Document types
// =============================================================================

/// A blinded attribute: name and value are already MACed strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Blinded attribute name.
    pub name: String,
    /// Blinded attribute value.
    pub value: String,
    /// Marks the (name, value) pair as unique across the vault.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
}

/// One blinded-index entry: the HMAC key that produced it plus its
/// attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEntry {
    /// Reference to the HMAC key that blinded the attributes.
    pub hmac: KeyReference,
    /// Sequence of the document state the entry was computed from.
    pub sequence: u64,
    /// Blinded attributes.
    pub attributes: Vec<Attribute>,
}

/// An encrypted document: an opaque JWE plus its blinded index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedDocument {
    /// Document identifier.
    pub id: String,
    /// Optimistic concurrency counter, monotonic per document.
    pub sequence: u64,
    /// The encrypted payload; not interpreted here.
    pub jwe: Value,
    /// Blinded index entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed: Option<Vec<IndexedEntry>>,
    /// Opaque metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// A stored document together with its record envelope.
#[derive(Debug, Clone)]
pub struct DocRecord {
    /// Record primary key (`"<localEdvId>:<docId>"`).
    pub id: String,
    /// Revision tag.
    pub rev: String,
    /// The vault the document belongs to.
    pub local_edv_id: String,
    /// The document itself.
    pub doc: EncryptedDocument,
}

// =============================================================================
// Store
// =============================================================================

/// Storage over the document collection of all vaults.
pub struct DocStore<E> {
    collection: Collection<E>,
    purge: Arc<PurgeScheduler<E>>,
}

impl<E> Clone for DocStore<E> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            purge: Arc::clone(&self.purge),
        }
    }
}

impl<E: DocumentEngine> DocStore<E> {
    /// Creates the store.
    pub fn new(engine: Arc<E>, purge: Arc<PurgeScheduler<E>>) -> Self {
        Self {
            collection: Collection::new(engine, COLLECTION_NAME),
            purge,
        }
    }

    /// Indexes this collection requires.
    #[must_use]
    pub fn indexes() -> Vec<IndexSpec> {
        let partial = |name: &str, field: &str| IndexSpec {
            ddoc: INDEX_DDOC.to_string(),
            name: name.to_string(),
            fields: vec!["localEdvId".to_string(), field.to_string()],
            require_field: Some(field.to_string()),
        };
        vec![
            partial(ATTRIBUTES_INDEX, "attributes"),
            partial(ATTRIBUTE_NAMES_INDEX, "attributeNames"),
            partial(UNIQUE_ATTRIBUTES_INDEX, "uniqueAttributes"),
        ]
    }

    /// Inserts a new document into a vault.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] when the document id or one of
    /// its unique blinded attributes is already taken.
    pub fn insert(&self, edv_id: &str, doc: &EncryptedDocument) -> StoreResult<DocRecord> {
        validate_doc(edv_id, doc)?;
        if doc.sequence != 0 {
            return Err(StoreError::validation(
                "doc.sequence",
                "must be \"0\" for a new document",
            ));
        }

        let (record, constraints) = build_record(edv_id, doc, false)?;
        let stored = self.collection.insert_one(record, &constraints)?;
        into_doc_record(stored)
    }

    /// Writes a document through the sequence gate, inserting when absent.
    ///
    /// When `deleted` is set the record becomes a tombstone and a purge of
    /// the collection is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] when the stored document does
    /// not hold `doc.sequence - 1`; a unique-attribute collision against a
    /// different document propagates as [`StoreError::Constraint`].
    pub fn upsert(
        &self,
        edv_id: &str,
        doc: &EncryptedDocument,
        deleted: bool,
    ) -> StoreResult<DocRecord> {
        validate_doc(edv_id, doc)?;

        let (record, constraints) = build_record(edv_id, doc, deleted)?;
        let record_id = record
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        // Gate on the predecessor sequence. A sequence of 0 gates on a
        // value no stored record holds, so the lookup misses and the
        // upsert inserts.
        let gate = doc
            .sequence
            .checked_sub(1)
            .map_or(Value::from(-1), Value::from);
        let selector = serde_json::json!({ ID_FIELD: record_id.as_str(), "doc.sequence": gate });

        let result = self.collection.update_one(record, selector, true, &constraints);
        let stored = match result {
            Ok(stored) => stored.ok_or_else(|| {
                StoreError::internal("upsert returned no record")
            })?,
            Err(err) => {
                // The implicit id constraint fired: the document exists
                // but the gate missed it, so the sequence is stale.
                if let Some(existing) = err.constraint_existing() {
                    if existing.get(ID_FIELD).and_then(Value::as_str) == Some(record_id.as_str()) {
                        return Err(StoreError::invalid_state(
                            "Could not update document. Sequence does not match.",
                        ));
                    }
                }
                return Err(err);
            }
        };

        if deleted {
            self.purge.request(COLLECTION_NAME);
        }
        into_doc_record(stored)
    }

    /// Fetches a document by vault and document id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent (including after
    /// deletion).
    pub fn get(&self, edv_id: &str, id: &str) -> StoreResult<DocRecord> {
        LocalId::parse(edv_id)?;
        LocalId::parse(id)?;

        let key = record_key(edv_id, id);
        let record = self
            .collection
            .find_one(serde_json::json!({ ID_FIELD: key }))?
            .ok_or_else(|| StoreError::not_found("Document not found."))?;
        into_doc_record(record)
    }

    /// Runs a compiled selector against a vault's documents.
    ///
    /// The vault id is forced into the selector when absent, so a query
    /// can never escape its vault.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the query.
    pub fn find(
        &self,
        edv_id: &str,
        mut selector: Value,
        limit: Option<usize>,
        use_index: Option<IndexHint>,
    ) -> StoreResult<Vec<DocRecord>> {
        LocalId::parse(edv_id)?;

        if let Some(clauses) = selector.as_object_mut() {
            clauses
                .entry("localEdvId".to_string())
                .or_insert_with(|| Value::from(edv_id));
        } else {
            return Err(StoreError::validation("query.selector", "must be an object"));
        }

        let query = crate::engine::FindQuery {
            selector,
            limit,
            use_index,
        };
        self.collection
            .find(&query)?
            .into_iter()
            .map(into_doc_record)
            .collect()
    }
}

impl<E> std::fmt::Debug for DocStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStore").finish_non_exhaustive()
    }
}

// =============================================================================
// Record building
// =============================================================================

fn record_key(edv_id: &str, doc_id: &str) -> String {
    format!("{edv_id}:{doc_id}")
}

fn validate_doc(edv_id: &str, doc: &EncryptedDocument) -> StoreResult<()> {
    LocalId::parse(edv_id)?;
    LocalId::parse(&doc.id)?;
    validate_sequence("doc.sequence", doc.sequence)?;
    if !doc.jwe.is_object() {
        return Err(StoreError::validation("doc.jwe", "must be an object"));
    }
    for entry in doc.indexed.iter().flatten() {
        if entry.hmac.id.is_empty() || entry.hmac.key_type.is_empty() {
            return Err(StoreError::validation(
                "doc.indexed.hmac",
                "must carry non-empty \"id\" and \"type\" strings",
            ));
        }
    }
    Ok(())
}

/// Builds the storage record and its unique constraints from a document.
fn build_record(
    edv_id: &str,
    doc: &EncryptedDocument,
    deleted: bool,
) -> StoreResult<(JsonObject, Vec<UniqueConstraint>)> {
    let mut attributes = Vec::new();
    let mut attribute_names = Vec::new();
    let mut unique_attributes = Vec::new();

    for entry in doc.indexed.iter().flatten() {
        let hmac_id = encode_component(&entry.hmac.id);
        for attribute in &entry.attributes {
            let name = format!("{hmac_id}:{}", encode_component(&attribute.name));
            let full = format!("{name}:{}", encode_component(&attribute.value));
            attributes.push(Value::from(full.clone()));
            attribute_names.push(Value::from(name));
            if attribute.unique == Some(true) {
                unique_attributes.push(Value::from(full));
            }
        }
    }

    let doc_value = serde_json::to_value(doc)
        .map_err(|err| StoreError::internal(format!("could not serialize document: {err}")))?;

    let mut record = JsonObject::new();
    record.insert(
        ID_FIELD.to_string(),
        Value::from(record_key(edv_id, &doc.id)),
    );
    record.insert("localEdvId".to_string(), Value::from(edv_id));
    record.insert("doc".to_string(), doc_value);
    if !attributes.is_empty() {
        record.insert("attributes".to_string(), Value::Array(attributes));
        record.insert("attributeNames".to_string(), Value::Array(attribute_names));
    }
    if deleted {
        record.insert(DELETED_FIELD.to_string(), Value::Bool(true));
    }

    let mut constraints = Vec::new();
    if !unique_attributes.is_empty() {
        record.insert(
            "uniqueAttributes".to_string(),
            Value::Array(unique_attributes.clone()),
        );
        constraints.push(
            UniqueConstraint::new(serde_json::json!({
                "localEdvId": edv_id,
                "uniqueAttributes": { "$in": unique_attributes },
            }))
            .with_index(IndexHint::new(INDEX_DDOC, UNIQUE_ATTRIBUTES_INDEX)),
        );
    }

    Ok((record, constraints))
}

fn into_doc_record(record: Record) -> StoreResult<DocRecord> {
    let local_edv_id = record
        .body
        .get("localEdvId")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::internal("stored record is missing \"localEdvId\""))?
        .to_string();
    let doc_value = record
        .body
        .get("doc")
        .cloned()
        .ok_or_else(|| StoreError::internal("stored record is missing \"doc\""))?;
    let doc = serde_json::from_value(doc_value)
        .map_err(|err| StoreError::internal(format!("could not deserialize document: {err}")))?;

    Ok(DocRecord {
        id: record.id,
        rev: record.rev,
        local_edv_id,
        doc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    fn store() -> (Arc<MemoryEngine>, DocStore<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        engine.ensure_collection(COLLECTION_NAME).unwrap();
        for index in DocStore::<MemoryEngine>::indexes() {
            engine.ensure_index(COLLECTION_NAME, index).unwrap();
        }
        let purge = Arc::new(PurgeScheduler::new(Arc::clone(&engine)));
        (Arc::clone(&engine), DocStore::new(engine, purge))
    }

    fn edv_id() -> String {
        LocalId::generate().to_string()
    }

    fn doc(id: &str, sequence: u64) -> EncryptedDocument {
        EncryptedDocument {
            id: id.to_string(),
            sequence,
            jwe: serde_json::json!({"protected": "e30", "ciphertext": "c"}),
            indexed: None,
            meta: None,
        }
    }

    fn indexed_doc(
        id: &str,
        sequence: u64,
        attributes: Vec<(&str, &str, bool)>,
    ) -> EncryptedDocument {
        let mut document = doc(id, sequence);
        document.indexed = Some(vec![IndexedEntry {
            hmac: KeyReference {
                id: "urn:uuid:hmac-key".to_string(),
                key_type: "Sha256HmacKey2019".to_string(),
            },
            sequence,
            attributes: attributes
                .into_iter()
                .map(|(name, value, unique)| Attribute {
                    name: name.to_string(),
                    value: value.to_string(),
                    unique: unique.then_some(true),
                })
                .collect(),
        }]);
        document
    }

    #[test]
    fn encode_component_matches_uri_component_rules() {
        assert_eq!(encode_component("abc-_.!~*'()"), "abc-_.!~*'()");
        assert_eq!(encode_component("a b"), "a%20b");
        assert_eq!(encode_component("a:b/c"), "a%3Ab%2Fc");
        assert_eq!(encode_component("ü"), "%C3%BC");
    }

    #[test]
    fn insert_then_get_round_trips() {
        let (_, store) = store();
        let edv = edv_id();
        let document = doc(&LocalId::generate().to_string(), 0);

        let record = store.insert(&edv, &document).unwrap();
        assert_eq!(record.local_edv_id, edv);
        assert_eq!(record.id, format!("{edv}:{}", document.id));

        let fetched = store.get(&edv, &document.id).unwrap();
        assert_eq!(fetched.doc, document);
        assert_eq!(fetched.doc.sequence, 0);
    }

    #[test]
    fn insert_requires_sequence_zero() {
        let (_, store) = store();
        let err = store
            .insert(&edv_id(), &doc(&LocalId::generate().to_string(), 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let (_, store) = store();
        let edv = edv_id();
        let document = doc(&LocalId::generate().to_string(), 0);
        store.insert(&edv, &document).unwrap();

        let err = store.insert(&edv, &document).unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn same_doc_id_in_different_vaults_is_fine() {
        let (_, store) = store();
        let document = doc(&LocalId::generate().to_string(), 0);
        store.insert(&edv_id(), &document).unwrap();
        store.insert(&edv_id(), &document).unwrap();
    }

    #[test]
    fn upsert_gates_on_predecessor_sequence() {
        let (_, store) = store();
        let edv = edv_id();
        let id = LocalId::generate().to_string();
        store.insert(&edv, &doc(&id, 0)).unwrap();

        // Wrong successor: stored is 0, gate wants stored == 1.
        let err = store.upsert(&edv, &doc(&id, 2), false).unwrap_err();
        assert_eq!(
            format!("{err}"),
            "Could not update document. Sequence does not match."
        );
        // Same sequence as stored: gate wants stored == -1... also stale.
        let err = store.upsert(&edv, &doc(&id, 0), false).unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));

        // State unchanged, then the correct successor lands.
        assert_eq!(store.get(&edv, &id).unwrap().doc.sequence, 0);
        store.upsert(&edv, &doc(&id, 1), false).unwrap();
        assert_eq!(store.get(&edv, &id).unwrap().doc.sequence, 1);
    }

    #[test]
    fn upsert_inserts_fresh_documents() {
        let (_, store) = store();
        let edv = edv_id();
        let id = LocalId::generate().to_string();
        store.upsert(&edv, &doc(&id, 0), false).unwrap();
        assert_eq!(store.get(&edv, &id).unwrap().doc.sequence, 0);
    }

    #[test]
    fn deleted_upsert_tombstones_and_schedules_purge() {
        let (engine, store) = store();
        let edv = edv_id();
        let id = LocalId::generate().to_string();
        store.insert(&edv, &doc(&id, 0)).unwrap();

        store.upsert(&edv, &doc(&id, 1), true).unwrap();

        let err = store.get(&edv, &id).unwrap_err();
        assert!(err.is_not_found());

        store.purge.wait_idle(COLLECTION_NAME);
        assert_eq!(engine.tombstone_len(COLLECTION_NAME), 0);
    }

    #[test]
    fn unique_attribute_collision_rejected_across_docs() {
        let (_, store) = store();
        let edv = edv_id();
        let doc1 = indexed_doc(
            &LocalId::generate().to_string(),
            0,
            vec![("n-blind", "v-blind", true)],
        );
        store.insert(&edv, &doc1).unwrap();

        let doc2 = indexed_doc(
            &LocalId::generate().to_string(),
            0,
            vec![("n-blind", "v-blind", true)],
        );
        let err = store.insert(&edv, &doc2).unwrap_err();
        assert!(err.is_constraint());
        // The offending record is the first document.
        let existing = err.constraint_existing().unwrap();
        assert_eq!(existing["_id"], format!("{edv}:{}", doc1.id));
    }

    #[test]
    fn non_unique_attributes_may_coexist() {
        let (_, store) = store();
        let edv = edv_id();
        let doc1 = indexed_doc(
            &LocalId::generate().to_string(),
            0,
            vec![("n-blind", "v-blind", false)],
        );
        let doc2 = indexed_doc(
            &LocalId::generate().to_string(),
            0,
            vec![("n-blind", "v-blind", false)],
        );
        store.insert(&edv, &doc1).unwrap();
        store.insert(&edv, &doc2).unwrap();
    }

    #[test]
    fn unique_attribute_may_repeat_across_vaults() {
        let (_, store) = store();
        let document = indexed_doc(
            &LocalId::generate().to_string(),
            0,
            vec![("n-blind", "v-blind", true)],
        );
        store.insert(&edv_id(), &document).unwrap();
        store.insert(&edv_id(), &document).unwrap();
    }

    #[test]
    fn updating_own_unique_attribute_is_fine() {
        let (_, store) = store();
        let edv = edv_id();
        let id = LocalId::generate().to_string();
        store
            .insert(&edv, &indexed_doc(&id, 0, vec![("n", "v", true)]))
            .unwrap();
        // Same unique attribute, next sequence: the constraint hit is the
        // update target itself.
        store
            .upsert(&edv, &indexed_doc(&id, 1, vec![("n", "v", true)]), false)
            .unwrap();
    }

    #[test]
    fn find_forces_vault_scope() {
        let (_, store) = store();
        let edv_a = edv_id();
        let edv_b = edv_id();
        let document = indexed_doc(&LocalId::generate().to_string(), 0, vec![("n", "v", false)]);
        store.insert(&edv_a, &document).unwrap();
        store.insert(&edv_b, &document).unwrap();

        let found = store
            .find(&edv_a, serde_json::json!({}), None, None)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].local_edv_id, edv_a);
    }
}
