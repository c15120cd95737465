//! Per-vault configuration storage.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{DocumentEngine, FindQuery, IndexHint, IndexSpec};
use crate::error::{StoreError, StoreResult};
use crate::ids::LocalId;
use crate::store::{validate_sequence, ConfigRecord, ConfigStore, StoredConfig};

/// Collection holding vault configs.
pub const COLLECTION_NAME: &str = "edv-storage-config";

/// Design document grouping this collection's indexes.
pub const INDEX_DDOC: &str = "edv-config";

/// Secondary index over the vault controller.
pub const CONTROLLER_INDEX: &str = "controller";

/// A reference to a key held in the paired secret: id plus type string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReference {
    /// The key's reference id.
    pub id: String,
    /// The key's type string.
    #[serde(rename = "type")]
    pub key_type: String,
}

impl KeyReference {
    fn validate(&self, parameter: &str) -> StoreResult<()> {
        if self.id.is_empty() || self.key_type.is_empty() {
            return Err(StoreError::validation(
                parameter,
                "must carry non-empty \"id\" and \"type\" strings",
            ));
        }
        Ok(())
    }
}

/// A vault's metadata: identity, controller, sequence, and key references.
///
/// The key references are optional in transit (a vault created from
/// locally generated secrets gets them filled in during creation), but a
/// persisted config always carries both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdvConfig {
    /// Vault identifier.
    pub id: String,
    /// Controller of the vault.
    pub controller: String,
    /// Optimistic concurrency counter.
    pub sequence: u64,
    /// Reference to the blinded-index HMAC key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hmac: Option<KeyReference>,
    /// Reference to the key-agreement key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_agreement_key: Option<KeyReference>,
}

impl StoredConfig for EdvConfig {
    fn id(&self) -> &str {
        &self.id
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn validate(&self) -> StoreResult<()> {
        LocalId::parse(&self.id)?;
        if self.controller.is_empty() {
            return Err(StoreError::validation(
                "config.controller",
                "must be a non-empty string",
            ));
        }
        validate_sequence("config.sequence", self.sequence)?;

        let hmac = self
            .hmac
            .as_ref()
            .ok_or_else(|| StoreError::validation("config.hmac", "is required"))?;
        hmac.validate("config.hmac")?;

        let kak = self
            .key_agreement_key
            .as_ref()
            .ok_or_else(|| StoreError::validation("config.keyAgreementKey", "is required"))?;
        kak.validate("config.keyAgreementKey")
    }
}

/// Repository over the vault-config collection.
pub struct EdvConfigStore<E> {
    store: ConfigStore<E, EdvConfig>,
}

impl<E> Clone for EdvConfigStore<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<E: DocumentEngine> EdvConfigStore<E> {
    /// Creates the repository.
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            store: ConfigStore::new(engine, COLLECTION_NAME),
        }
    }

    /// Indexes this collection requires.
    #[must_use]
    pub fn indexes() -> Vec<IndexSpec> {
        vec![IndexSpec {
            ddoc: INDEX_DDOC.to_string(),
            name: CONTROLLER_INDEX.to_string(),
            fields: vec!["config.controller".to_string()],
            require_field: None,
        }]
    }

    /// Inserts a new vault config.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] for a duplicate vault id.
    pub fn insert(&self, config: &EdvConfig) -> StoreResult<ConfigRecord<EdvConfig>> {
        self.store.insert(config)
    }

    /// Updates a vault config through the sequence gate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] when the sequence does not
    /// match or the config does not exist.
    pub fn update(&self, config: &EdvConfig) -> StoreResult<ConfigRecord<EdvConfig>> {
        self.store.update(config)
    }

    /// Fetches a vault config by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    pub fn get(&self, id: &str) -> StoreResult<ConfigRecord<EdvConfig>> {
        self.store.get(id)
    }

    /// Returns all vault configs owned by a controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the query.
    pub fn find_by_controller(&self, controller: &str) -> StoreResult<Vec<EdvConfig>> {
        let query = FindQuery::new(serde_json::json!({ "config.controller": controller }))
            .with_index(IndexHint::new(INDEX_DDOC, CONTROLLER_INDEX));
        self.store
            .collection()
            .find(&query)?
            .into_iter()
            .map(|record| {
                let body = record.body.get("config").cloned().ok_or_else(|| {
                    StoreError::internal("stored record is missing \"config\"")
                })?;
                serde_json::from_value(body).map_err(|err| {
                    StoreError::internal(format!("could not deserialize config: {err}"))
                })
            })
            .collect()
    }
}

impl<E> std::fmt::Debug for EdvConfigStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdvConfigStore").finish_non_exhaustive()
    }
}
