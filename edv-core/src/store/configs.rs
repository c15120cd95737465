//! Generic repository for identified configurations.
//!
//! Configurations are small JSON documents with an `id` and a monotonic
//! `sequence`. They are stored as `{_id: <id>, config: <body>}` records and
//! updated through a sequence gate: an update only lands when it carries
//! `sequence == stored + 1`.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::engine::{DocumentEngine, JsonObject, ID_FIELD};
use crate::error::{StoreError, StoreResult};
use crate::store::{Collection, Record};

/// A configuration storable in a [`ConfigStore`].
pub trait StoredConfig: Serialize + DeserializeOwned {
    /// The configuration's identifier.
    fn id(&self) -> &str;

    /// The configuration's sequence number.
    fn sequence(&self) -> u64;

    /// Asserts the configuration's shape.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first violation.
    fn validate(&self) -> StoreResult<()>;
}

/// A stored configuration together with its record envelope.
#[derive(Debug, Clone)]
pub struct ConfigRecord<T> {
    /// Primary key (`_id`).
    pub id: String,
    /// Revision tag (`_rev`).
    pub rev: String,
    /// The configuration body.
    pub config: T,
}

/// Typed repository over one configuration collection.
pub struct ConfigStore<E, T> {
    collection: Collection<E>,
    _config: PhantomData<fn() -> T>,
}

impl<E, T> Clone for ConfigStore<E, T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            _config: PhantomData,
        }
    }
}

impl<E: DocumentEngine, T: StoredConfig> ConfigStore<E, T> {
    /// Creates a repository over `collection_name`.
    pub fn new(engine: Arc<E>, collection_name: impl Into<String>) -> Self {
        Self {
            collection: Collection::new(engine, collection_name),
            _config: PhantomData,
        }
    }

    /// Returns the underlying collection handle.
    #[must_use]
    pub fn collection(&self) -> &Collection<E> {
        &self.collection
    }

    /// Inserts a new configuration.
    ///
    /// The configuration must validate and carry `sequence == 0`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] when a configuration with the
    /// same id already exists.
    pub fn insert(&self, config: &T) -> StoreResult<ConfigRecord<T>> {
        config.validate()?;
        if config.sequence() != 0 {
            return Err(StoreError::validation(
                "config.sequence",
                "must be \"0\" for a new configuration",
            ));
        }

        let record = self
            .collection
            .insert_one(Self::to_record_body(config)?, &[])?;
        Self::into_config_record(record)
    }

    /// Updates an existing configuration.
    ///
    /// The update lands only when the stored configuration holds
    /// `config.sequence() - 1`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] when the sequence does not
    /// match or the configuration does not exist.
    pub fn update(&self, config: &T) -> StoreResult<ConfigRecord<T>> {
        config.validate()?;

        let stale = || {
            StoreError::invalid_state(
                "Could not update configuration. Sequence does not match or \
                 configuration does not exist.",
            )
        };

        let Some(expected) = config.sequence().checked_sub(1) else {
            return Err(stale());
        };
        let selector = serde_json::json!({
            ID_FIELD: config.id(),
            "config.sequence": expected,
        });

        let updated =
            self.collection
                .update_one(Self::to_record_body(config)?, selector, false, &[])?;
        updated.map_or_else(|| Err(stale()), Self::into_config_record)
    }

    /// Fetches a configuration by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    pub fn get(&self, id: &str) -> StoreResult<ConfigRecord<T>> {
        let record = self
            .collection
            .find_one(serde_json::json!({ ID_FIELD: id }))?
            .ok_or_else(|| StoreError::not_found("Configuration not found."))?;
        Self::into_config_record(record)
    }

    fn to_record_body(config: &T) -> StoreResult<JsonObject> {
        let body = serde_json::to_value(config)
            .map_err(|err| StoreError::internal(format!("could not serialize config: {err}")))?;

        let mut record = JsonObject::new();
        record.insert(ID_FIELD.to_string(), Value::from(config.id()));
        record.insert("config".to_string(), body);
        Ok(record)
    }

    fn into_config_record(record: Record) -> StoreResult<ConfigRecord<T>> {
        let body = record
            .body
            .get("config")
            .cloned()
            .ok_or_else(|| StoreError::internal("stored record is missing \"config\""))?;
        let config = serde_json::from_value(body)
            .map_err(|err| StoreError::internal(format!("could not deserialize config: {err}")))?;
        Ok(ConfigRecord {
            id: record.id,
            rev: record.rev,
            config,
        })
    }
}

impl<E: crate::engine::DocumentEngine, T> std::fmt::Debug for ConfigStore<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("collection", &self.collection.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        id: String,
        sequence: u64,
        label: String,
    }

    impl StoredConfig for TestConfig {
        fn id(&self) -> &str {
            &self.id
        }

        fn sequence(&self) -> u64 {
            self.sequence
        }

        fn validate(&self) -> StoreResult<()> {
            if self.id.is_empty() {
                return Err(StoreError::validation("config.id", "must be a non-empty string"));
            }
            crate::store::validate_sequence("config.sequence", self.sequence)
        }
    }

    fn store() -> ConfigStore<MemoryEngine, TestConfig> {
        let engine = Arc::new(MemoryEngine::new());
        engine.ensure_collection("test-config").unwrap();
        ConfigStore::new(engine, "test-config")
    }

    fn config(sequence: u64, label: &str) -> TestConfig {
        TestConfig {
            id: "cfg-1".to_string(),
            sequence,
            label: label.to_string(),
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let store = store();
        store.insert(&config(0, "first")).unwrap();

        let record = store.get("cfg-1").unwrap();
        assert_eq!(record.config, config(0, "first"));
        assert_eq!(record.id, "cfg-1");
    }

    #[test]
    fn insert_requires_sequence_zero() {
        let store = store();
        let err = store.insert(&config(1, "first")).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn insert_rejects_duplicates() {
        let store = store();
        store.insert(&config(0, "first")).unwrap();
        let err = store.insert(&config(0, "again")).unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn update_applies_with_next_sequence() {
        let store = store();
        store.insert(&config(0, "first")).unwrap();
        store.update(&config(1, "second")).unwrap();

        let record = store.get("cfg-1").unwrap();
        assert_eq!(record.config.sequence, 1);
        assert_eq!(record.config.label, "second");
    }

    #[test]
    fn update_rejects_stale_sequence() {
        let store = store();
        store.insert(&config(0, "first")).unwrap();

        for stale in [0, 2, 5] {
            let err = store.update(&config(stale, "nope")).unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidState { .. }),
                "sequence {stale} should be rejected"
            );
        }

        // State unchanged.
        assert_eq!(store.get("cfg-1").unwrap().config.label, "first");
    }

    #[test]
    fn update_rejects_missing_configuration() {
        let store = store();
        let err = store.update(&config(1, "ghost")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
        assert!(format!("{err}").contains("Sequence does not match"));
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = store();
        let err = store.get("cfg-404").unwrap_err();
        assert_eq!(format!("{err}"), "Configuration not found.");
    }
}
