//! Storage context: the per-process root of all collection handles.
//!
//! One context owns the engine handle, the four collection stores, and the
//! purge scheduler. Creating it runs the idempotent collection and index
//! setup, so two contexts over the same engine observe the same storage;
//! there is no global state.

use std::sync::Arc;

use crate::chunks::{self, ChunkStore};
use crate::docs::{self, DocStore};
use crate::edvs::{self, EdvConfigStore};
use crate::engine::DocumentEngine;
use crate::error::StoreResult;
use crate::purge::PurgeScheduler;
use crate::secrets::{self, SecretStore};
use crate::store::ConfigStore;

/// The root object tying an engine to the vault collections.
pub struct StorageContext<E> {
    engine: Arc<E>,
    configs: EdvConfigStore<E>,
    secrets: SecretStore<E>,
    docs: DocStore<E>,
    chunks: ChunkStore<E>,
    purge: Arc<PurgeScheduler<E>>,
}

impl<E> Clone for StorageContext<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            configs: self.configs.clone(),
            secrets: self.secrets.clone(),
            docs: self.docs.clone(),
            chunks: self.chunks.clone(),
            purge: Arc::clone(&self.purge),
        }
    }
}

impl<E: DocumentEngine> StorageContext<E> {
    /// Creates a context over an engine, ensuring all collections and
    /// indexes exist. Safe to call repeatedly over the same engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails during setup.
    pub fn initialize(engine: Arc<E>) -> StoreResult<Self> {
        engine.ensure_collection(edvs::COLLECTION_NAME)?;
        engine.ensure_collection(secrets::COLLECTION_NAME)?;
        engine.ensure_collection(docs::COLLECTION_NAME)?;
        engine.ensure_collection(chunks::COLLECTION_NAME)?;

        for index in EdvConfigStore::<E>::indexes() {
            engine.ensure_index(edvs::COLLECTION_NAME, index)?;
        }
        for index in DocStore::<E>::indexes() {
            engine.ensure_index(docs::COLLECTION_NAME, index)?;
        }

        let purge = Arc::new(PurgeScheduler::new(Arc::clone(&engine)));
        let docs = DocStore::new(Arc::clone(&engine), Arc::clone(&purge));
        let chunks = ChunkStore::new(Arc::clone(&engine), docs.clone(), Arc::clone(&purge));

        Ok(Self {
            configs: EdvConfigStore::new(Arc::clone(&engine)),
            secrets: ConfigStore::new(Arc::clone(&engine), secrets::COLLECTION_NAME),
            docs,
            chunks,
            purge,
            engine,
        })
    }

    /// The engine handle.
    #[must_use]
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Vault-config storage.
    #[must_use]
    pub fn configs(&self) -> &EdvConfigStore<E> {
        &self.configs
    }

    /// Secret-config storage.
    #[must_use]
    pub fn secrets(&self) -> &SecretStore<E> {
        &self.secrets
    }

    /// Document storage.
    #[must_use]
    pub fn docs(&self) -> &DocStore<E> {
        &self.docs
    }

    /// Chunk storage.
    #[must_use]
    pub fn chunks(&self) -> &ChunkStore<E> {
        &self.chunks
    }

    /// The purge scheduler.
    #[must_use]
    pub fn purge(&self) -> &Arc<PurgeScheduler<E>> {
        &self.purge
    }
}

impl<E> std::fmt::Debug for StorageContext<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext").finish_non_exhaustive()
    }
}
