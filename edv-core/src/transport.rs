//! Transport boundary between the encryption layer and vault storage.
//!
//! The external encryption layer (the code that turns plaintext into JWE
//! blobs and back) talks to storage exclusively through [`Transport`].
//! [`LocalTransport`] serves one vault out of a [`StorageContext`];
//! uniqueness violations are translated to duplicates at this boundary,
//! so the layer above never sees raw constraint errors.

use crate::chunks::{Chunk, ChunkRecord};
use crate::context::StorageContext;
use crate::docs::EncryptedDocument;
use crate::edvs::EdvConfig;
use crate::engine::DocumentEngine;
use crate::error::{StoreError, StoreResult};
use crate::query::{self, EdvQuery};

/// Result of a transport find: documents or a count.
#[derive(Debug, Clone, Default)]
pub struct FindResult {
    /// Matching documents, absent for count queries.
    pub documents: Option<Vec<EncryptedDocument>>,
    /// Match count, present for count queries.
    pub count: Option<u64>,
    /// Whether more matches exist beyond the limit; left unset here,
    /// computed by pagination-aware callers.
    pub has_more: Option<bool>,
}

/// Storage operations the encryption layer consumes.
pub trait Transport {
    /// Creates a vault from its config.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the vault already exists.
    fn create_edv(&self, config: &EdvConfig) -> StoreResult<EdvConfig>;

    /// Fetches a vault config; `None` means the transport's own vault.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    fn get_config(&self, id: Option<&str>) -> StoreResult<EdvConfig>;

    /// Updates a vault config through the sequence gate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] on a stale sequence.
    fn update_config(&self, config: &EdvConfig) -> StoreResult<EdvConfig>;

    /// Inserts an encrypted document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the document id or a unique
    /// blinded attribute is taken.
    fn insert(&self, encrypted: &EncryptedDocument) -> StoreResult<()>;

    /// Writes an encrypted document through the sequence gate; `deleted`
    /// tombstones it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] on a stale sequence and
    /// [`StoreError::Duplicate`] on a unique-attribute collision with a
    /// different document.
    fn update(&self, encrypted: &EncryptedDocument, deleted: bool) -> StoreResult<()>;

    /// Fetches an encrypted document by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    fn get(&self, id: &str) -> StoreResult<EncryptedDocument>;

    /// Runs a blinded-attribute query.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed query.
    fn find(&self, query: &EdvQuery) -> StoreResult<FindResult>;

    /// Writes a document chunk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] when the chunk's sequence
    /// disagrees with its document.
    fn store_chunk(&self, doc_id: &str, chunk: &Chunk) -> StoreResult<ChunkRecord>;

    /// Fetches a document chunk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    fn get_chunk(&self, doc_id: &str, chunk_index: u64) -> StoreResult<Chunk>;
}

/// [`Transport`] over local storage, scoped to one vault.
pub struct LocalTransport<E> {
    context: StorageContext<E>,
    edv_id: String,
}

impl<E> Clone for LocalTransport<E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            edv_id: self.edv_id.clone(),
        }
    }
}

impl<E: DocumentEngine> LocalTransport<E> {
    /// Creates a transport for the vault `edv_id`.
    pub fn new(context: StorageContext<E>, edv_id: impl Into<String>) -> Self {
        Self {
            context,
            edv_id: edv_id.into(),
        }
    }

    /// The vault this transport serves.
    #[must_use]
    pub fn edv_id(&self) -> &str {
        &self.edv_id
    }

    pub(crate) fn context(&self) -> &StorageContext<E> {
        &self.context
    }

    fn map_duplicate(message: &'static str) -> impl Fn(StoreError) -> StoreError {
        move |err| {
            if err.is_constraint() {
                StoreError::duplicate(message)
            } else {
                err
            }
        }
    }
}

impl<E: DocumentEngine> Transport for LocalTransport<E> {
    fn create_edv(&self, config: &EdvConfig) -> StoreResult<EdvConfig> {
        let record = self
            .context
            .configs()
            .insert(config)
            .map_err(Self::map_duplicate("Duplicate EDV configuration."))?;
        Ok(record.config)
    }

    fn get_config(&self, id: Option<&str>) -> StoreResult<EdvConfig> {
        let id = id.unwrap_or(&self.edv_id);
        Ok(self.context.configs().get(id)?.config)
    }

    fn update_config(&self, config: &EdvConfig) -> StoreResult<EdvConfig> {
        Ok(self.context.configs().update(config)?.config)
    }

    fn insert(&self, encrypted: &EncryptedDocument) -> StoreResult<()> {
        self.context
            .docs()
            .insert(&self.edv_id, encrypted)
            .map_err(Self::map_duplicate("Duplicate document."))?;
        Ok(())
    }

    fn update(&self, encrypted: &EncryptedDocument, deleted: bool) -> StoreResult<()> {
        self.context
            .docs()
            .upsert(&self.edv_id, encrypted, deleted)
            .map_err(Self::map_duplicate("Duplicate document."))?;
        Ok(())
    }

    fn get(&self, id: &str) -> StoreResult<EncryptedDocument> {
        Ok(self.context.docs().get(&self.edv_id, id)?.doc)
    }

    fn find(&self, query: &EdvQuery) -> StoreResult<FindResult> {
        let compiled = query::compile(&self.edv_id, query)?;

        if compiled.count {
            // Counts ignore the limit: the caller wants the total.
            let records = self.context.docs().find(
                &self.edv_id,
                compiled.selector,
                None,
                Some(compiled.use_index),
            )?;
            return Ok(FindResult {
                documents: None,
                count: Some(records.len() as u64),
                has_more: None,
            });
        }

        let records = self.context.docs().find(
            &self.edv_id,
            compiled.selector,
            compiled.limit,
            Some(compiled.use_index),
        )?;
        Ok(FindResult {
            documents: Some(records.into_iter().map(|record| record.doc).collect()),
            count: None,
            has_more: None,
        })
    }

    fn store_chunk(&self, doc_id: &str, chunk: &Chunk) -> StoreResult<ChunkRecord> {
        self.context.chunks().upsert(&self.edv_id, doc_id, chunk)
    }

    fn get_chunk(&self, doc_id: &str, chunk_index: u64) -> StoreResult<Chunk> {
        Ok(self
            .context
            .chunks()
            .get(&self.edv_id, doc_id, chunk_index)?
            .chunk)
    }
}

impl<E> std::fmt::Debug for LocalTransport<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("edv_id", &self.edv_id)
            .finish_non_exhaustive()
    }
}
