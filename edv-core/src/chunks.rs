//! Per-document chunk storage.
//!
//! Large documents are streamed as ordered chunks keyed
//! `"<localEdvId>:<docId>:<index>"`. A chunk write must agree with its
//! document: the chunk's `sequence` has to equal the document's current
//! `sequence`, which ties every chunk to one version of the document.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::docs::DocStore;
use crate::engine::{DocumentEngine, DELETED_FIELD, ID_FIELD, JsonObject, REV_FIELD};
use crate::error::{StoreError, StoreResult};
use crate::ids::LocalId;
use crate::purge::PurgeScheduler;
use crate::store::{validate_sequence, Collection, Record};

/// Collection holding chunk records.
pub const COLLECTION_NAME: &str = "edv-storage-chunk";

/// One encrypted chunk of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Sequence of the document version this chunk belongs to.
    pub sequence: u64,
    /// Position of the chunk within the document.
    pub index: u64,
    /// Byte offset of the chunk within the plaintext stream.
    pub offset: u64,
    /// The encrypted payload; not interpreted here.
    pub jwe: Value,
}

/// A stored chunk together with its record envelope.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Record primary key (`"<localEdvId>:<docId>:<index>"`).
    pub id: String,
    /// Revision tag.
    pub rev: String,
    /// The vault the chunk belongs to.
    pub local_edv_id: String,
    /// The document the chunk belongs to.
    pub doc_id: String,
    /// The chunk itself.
    pub chunk: Chunk,
}

/// Storage over the chunk collection of all vaults.
pub struct ChunkStore<E> {
    collection: Collection<E>,
    docs: DocStore<E>,
    purge: Arc<PurgeScheduler<E>>,
}

impl<E> Clone for ChunkStore<E> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            docs: self.docs.clone(),
            purge: Arc::clone(&self.purge),
        }
    }
}

impl<E: DocumentEngine> ChunkStore<E> {
    /// Creates the store.
    pub fn new(engine: Arc<E>, docs: DocStore<E>, purge: Arc<PurgeScheduler<E>>) -> Self {
        Self {
            collection: Collection::new(engine, COLLECTION_NAME),
            docs,
            purge,
        }
    }

    /// Writes a chunk, checking it against its document's sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the document does not exist
    /// and [`StoreError::InvalidState`] when `chunk.sequence` differs from
    /// the document's current sequence.
    pub fn upsert(&self, edv_id: &str, doc_id: &str, chunk: &Chunk) -> StoreResult<ChunkRecord> {
        LocalId::parse(edv_id)?;
        LocalId::parse(doc_id)?;
        validate_sequence("chunk.sequence", chunk.sequence)?;
        if !chunk.jwe.is_object() {
            return Err(StoreError::validation("chunk.jwe", "must be an object"));
        }

        let doc = self.docs.get(edv_id, doc_id)?;
        if chunk.sequence != doc.doc.sequence {
            return Err(StoreError::sequence_mismatch(
                "Could not update document chunk. Sequence does not match \
                 the associated document.",
                doc.doc.sequence,
                chunk.sequence,
            ));
        }

        let key = record_key(edv_id, doc_id, chunk.index);
        let record = build_record(&key, edv_id, doc_id, chunk)?;
        let selector = serde_json::json!({ ID_FIELD: key.as_str() });

        match self.collection.update_one(record, selector, true, &[]) {
            Ok(stored) => {
                let stored =
                    stored.ok_or_else(|| StoreError::internal("upsert returned no record"))?;
                into_chunk_record(stored)
            }
            Err(err) => {
                // A concurrent writer upserted the same chunk between the
                // lookup and the insert; its record is just as good.
                if let Some(existing) = err.constraint_existing() {
                    if existing.get(ID_FIELD).and_then(Value::as_str) == Some(key.as_str()) {
                        let body = existing
                            .as_object()
                            .cloned()
                            .ok_or_else(|| StoreError::internal("malformed existing record"))?;
                        let rev = body
                            .get(REV_FIELD)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        return into_chunk_record(Record {
                            id: key,
                            rev,
                            body,
                        });
                    }
                }
                Err(err)
            }
        }
    }

    /// Fetches a chunk by vault, document, and chunk index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    pub fn get(&self, edv_id: &str, doc_id: &str, index: u64) -> StoreResult<ChunkRecord> {
        LocalId::parse(edv_id)?;
        LocalId::parse(doc_id)?;

        let key = record_key(edv_id, doc_id, index);
        let record = self
            .collection
            .find_one(serde_json::json!({ ID_FIELD: key }))?
            .ok_or_else(|| StoreError::not_found("Document chunk not found."))?;
        into_chunk_record(record)
    }

    /// Removes a chunk, best effort. Returns `false` when it did not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails; a missing chunk is not an
    /// error.
    pub fn remove(&self, edv_id: &str, doc_id: &str, index: u64) -> StoreResult<bool> {
        LocalId::parse(edv_id)?;
        LocalId::parse(doc_id)?;

        let key = record_key(edv_id, doc_id, index);
        let Some(existing) = self
            .collection
            .find_one(serde_json::json!({ ID_FIELD: key }))?
        else {
            return Ok(false);
        };

        let mut body = existing.body;
        body.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        self.collection.engine().put(self.collection.name(), body)?;
        self.purge.request(COLLECTION_NAME);
        Ok(true)
    }

    /// Removes every chunk belonging to a document, best effort. Returns
    /// the number of chunks tombstoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn remove_all(&self, edv_id: &str, doc_id: &str) -> StoreResult<u64> {
        LocalId::parse(edv_id)?;
        LocalId::parse(doc_id)?;

        let selector = serde_json::json!({
            "localEdvId": edv_id,
            "docId": doc_id,
        });
        let records = self
            .collection
            .find(&crate::engine::FindQuery::new(selector))?;

        let mut removed = 0;
        for record in records {
            let mut body = record.body;
            body.insert(DELETED_FIELD.to_string(), Value::Bool(true));
            self.collection.engine().put(self.collection.name(), body)?;
            removed += 1;
        }
        if removed > 0 {
            self.purge.request(COLLECTION_NAME);
        }
        Ok(removed)
    }
}

impl<E> std::fmt::Debug for ChunkStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore").finish_non_exhaustive()
    }
}

fn record_key(edv_id: &str, doc_id: &str, index: u64) -> String {
    format!("{edv_id}:{doc_id}:{index}")
}

fn build_record(key: &str, edv_id: &str, doc_id: &str, chunk: &Chunk) -> StoreResult<JsonObject> {
    let chunk_value = serde_json::to_value(chunk)
        .map_err(|err| StoreError::internal(format!("could not serialize chunk: {err}")))?;

    let mut record = JsonObject::new();
    record.insert(ID_FIELD.to_string(), Value::from(key));
    record.insert("localEdvId".to_string(), Value::from(edv_id));
    record.insert("docId".to_string(), Value::from(doc_id));
    record.insert("chunk".to_string(), chunk_value);
    Ok(record)
}

fn into_chunk_record(record: Record) -> StoreResult<ChunkRecord> {
    let local_edv_id = record
        .body
        .get("localEdvId")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::internal("stored record is missing \"localEdvId\""))?
        .to_string();
    let doc_id = record
        .body
        .get("docId")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::internal("stored record is missing \"docId\""))?
        .to_string();
    let chunk_value = record
        .body
        .get("chunk")
        .cloned()
        .ok_or_else(|| StoreError::internal("stored record is missing \"chunk\""))?;
    let chunk = serde_json::from_value(chunk_value)
        .map_err(|err| StoreError::internal(format!("could not deserialize chunk: {err}")))?;

    Ok(ChunkRecord {
        id: record.id,
        rev: record.rev,
        local_edv_id,
        doc_id,
        chunk,
    })
}
