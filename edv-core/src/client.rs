//! The vault client: creation, unlocking, and document CRUD.
//!
//! [`EdvClient::create_edv`] derives and persists a vault's secret from a
//! password (or registers a caller-supplied config without one);
//! [`EdvClient::from_local_secrets`] unlocks an existing vault. An
//! unlocked client carries the blinded-index HMAC key and the
//! key-agreement key and talks to storage through a vault-scoped
//! [`LocalTransport`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunks::{Chunk, ChunkRecord};
use crate::context::StorageContext;
use crate::docs::EncryptedDocument;
use crate::edvs::{EdvConfig, KeyReference};
use crate::engine::DocumentEngine;
use crate::error::{StoreError, StoreResult};
use crate::query::{EdvQuery, MAX_FIND_LIMIT};
use crate::secrets::{self, CipherVersion, UnlockedSecret};
use crate::store::StoredConfig;
use crate::store::MAX_SEQUENCE;
use crate::transport::{LocalTransport, Transport};

/// Options for [`EdvClient::create_edv`].
#[derive(Debug, Clone)]
pub struct CreateEdvOptions {
    /// The vault config. With a password, its `hmac` and
    /// `keyAgreementKey` must be unset; they are filled from the
    /// generated secret.
    pub config: EdvConfig,
    /// Password protecting the vault's secret. Without one, only the
    /// config is registered and no client is returned.
    pub password: Option<String>,
    /// Cipher suite for a newly generated secret.
    pub cipher_version: CipherVersion,
}

/// Result of [`EdvClient::create_edv`].
#[derive(Debug)]
pub struct CreateEdvResult<E> {
    /// The stored vault config.
    pub config: EdvConfig,
    /// An unlocked client, present when a password was supplied.
    pub client: Option<EdvClient<E>>,
}

/// A page of find results.
#[derive(Debug, Clone, Default)]
pub struct FindPage {
    /// Matching documents, up to the requested limit.
    pub documents: Vec<EncryptedDocument>,
    /// Whether more matches exist beyond the limit; set only when a limit
    /// was given.
    pub has_more: Option<bool>,
}

/// The exported public form of a vault's key-agreement key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyDescriptor {
    /// The key's reference id.
    pub id: String,
    /// The key's type string.
    #[serde(rename = "type")]
    pub key_type: String,
    /// The public key, multicodec-framed and multibase-encoded.
    pub public_key_multibase: String,
}

/// An unlocked vault client.
pub struct EdvClient<E> {
    context: StorageContext<E>,
    config: EdvConfig,
    keys: UnlockedSecret,
    transport: LocalTransport<E>,
}

impl<E: DocumentEngine> EdvClient<E> {
    // =========================================================================
    // Creation and unlocking
    // =========================================================================

    /// Creates a vault.
    ///
    /// With a password, a secret is generated (or an existing one with a
    /// matching password is reused), the config's key references are
    /// filled from it, and an unlocked client is returned. Without a
    /// password the supplied config is registered as-is and no client is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] for an existing vault id, a
    /// plain error when the config carries key references alongside a
    /// password or when an existing secret's password does not match.
    pub fn create_edv(
        context: &StorageContext<E>,
        options: CreateEdvOptions,
    ) -> StoreResult<CreateEdvResult<E>> {
        let CreateEdvOptions {
            mut config,
            password,
            cipher_version,
        } = options;

        let Some(password) = password else {
            config.validate()?;
            let transport = LocalTransport::new(context.clone(), config.id.clone());
            let stored = transport.create_edv(&config)?;
            return Ok(CreateEdvResult {
                config: stored,
                client: None,
            });
        };

        if config.hmac.is_some() || config.key_agreement_key.is_some() {
            return Err(StoreError::internal(
                "\"config\" must not have \"hmac\" or \"keyAgreementKey\" if \
                 these are to be populated using locally generated secrets.",
            ));
        }

        let keys = lazy_create_secret(context, &config.id, &password, cipher_version)?;

        config.hmac = Some(KeyReference {
            id: keys
                .hmac
                .id()
                .ok_or_else(|| StoreError::internal("derived HMAC key has no id"))?
                .to_string(),
            key_type: keys.hmac.key_type().to_string(),
        });
        config.key_agreement_key = Some(KeyReference {
            id: keys
                .key_agreement_key
                .id()
                .ok_or_else(|| StoreError::internal("derived key agreement key has no id"))?
                .to_string(),
            key_type: keys.key_agreement_key.key_type().to_string(),
        });
        config.validate()?;

        let transport = LocalTransport::new(context.clone(), config.id.clone());
        let stored = transport.create_edv(&config)?;
        debug!(edv_id = %stored.id, "created vault");

        Ok(CreateEdvResult {
            config: stored.clone(),
            client: Some(Self {
                context: context.clone(),
                config: stored,
                keys,
                transport,
            }),
        })
    }

    /// Unlocks an existing vault with its password.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no secret or config exists
    /// for the vault and a plain `Invalid password.` error when the
    /// password does not unlock the secret.
    pub fn from_local_secrets(
        context: &StorageContext<E>,
        edv_id: &str,
        password: &str,
    ) -> StoreResult<Self> {
        let secret = context.secrets().get(edv_id)?;
        let keys = secrets::decrypt(&secret.config, password)?
            .ok_or_else(|| StoreError::internal("Invalid password."))?;
        let config = context.configs().get(edv_id)?.config;

        Ok(Self {
            context: context.clone(),
            transport: LocalTransport::new(context.clone(), edv_id),
            config,
            keys,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The vault's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// The vault's config as of unlocking or the last config update.
    #[must_use]
    pub const fn config(&self) -> &EdvConfig {
        &self.config
    }

    /// The unlocked keys.
    #[must_use]
    pub const fn keys(&self) -> &UnlockedSecret {
        &self.keys
    }

    /// The vault-scoped transport, for handing to an encryption layer.
    #[must_use]
    pub const fn transport(&self) -> &LocalTransport<E> {
        &self.transport
    }

    /// Resolves a key reference id to the stored key-agreement key's
    /// public form. Only the vault's own key is resolvable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for any other id.
    pub fn resolve_key(&self, id: &str) -> StoreResult<PublicKeyDescriptor> {
        let kak = &self.keys.key_agreement_key;
        if kak.id() != Some(id) {
            return Err(StoreError::not_found("Key not found."));
        }
        Ok(PublicKeyDescriptor {
            id: id.to_string(),
            key_type: kak.key_type().to_string(),
            public_key_multibase: kak.public_key_multibase(),
        })
    }

    // =========================================================================
    // Config operations
    // =========================================================================

    /// Fetches the vault's stored config.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the vault is gone.
    pub fn get_config(&self) -> StoreResult<EdvConfig> {
        self.transport.get_config(None)
    }

    /// Updates the vault's config through the sequence gate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] on a stale sequence.
    pub fn update_config(&mut self, config: &EdvConfig) -> StoreResult<EdvConfig> {
        let stored = self.transport.update_config(config)?;
        self.config = stored.clone();
        Ok(stored)
    }

    // =========================================================================
    // Document operations
    // =========================================================================

    /// Inserts a new encrypted document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the document id or a unique
    /// blinded attribute is taken.
    pub fn insert(&self, doc: &EncryptedDocument) -> StoreResult<()> {
        self.transport.insert(doc)
    }

    /// Updates a document the caller holds at its current stored
    /// sequence; the stored document ends up at `sequence + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] when the caller's sequence is
    /// stale and [`StoreError::Duplicate`] on a unique-attribute
    /// collision.
    pub fn update(&self, doc: &EncryptedDocument) -> StoreResult<EncryptedDocument> {
        let next = next_version(doc)?;
        self.transport.update(&next, false)?;
        Ok(next)
    }

    /// Deletes a document the caller holds at its current stored
    /// sequence, tombstoning it and removing its chunks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] when the caller's sequence is
    /// stale.
    pub fn delete(&self, doc: &EncryptedDocument) -> StoreResult<EncryptedDocument> {
        let next = next_version(doc)?;
        self.transport.update(&next, true)?;
        self.context.chunks().remove_all(self.id(), &next.id)?;
        Ok(next)
    }

    /// Fetches an encrypted document by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent (including after
    /// deletion).
    pub fn get(&self, id: &str) -> StoreResult<EncryptedDocument> {
        self.transport.get(id)
    }

    /// Runs a blinded-attribute query, paging by `query.limit`.
    ///
    /// When a limit is given, one extra match is probed for so the page
    /// can report whether more exist.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed query or a limit
    /// outside `[1, 1000]`.
    pub fn find(&self, query: &EdvQuery) -> StoreResult<FindPage> {
        let Some(limit) = query.limit else {
            let result = self.transport.find(query)?;
            return Ok(FindPage {
                documents: result.documents.unwrap_or_default(),
                has_more: None,
            });
        };

        if !(1..=MAX_FIND_LIMIT).contains(&limit) {
            return Err(StoreError::validation(
                "query.limit",
                format!("must be an integer between 1 and {MAX_FIND_LIMIT}"),
            ));
        }

        // Probe one past the page to learn whether another page exists.
        let mut probe = query.clone();
        probe.limit = Some(limit + 1);
        let result = self.transport.find(&probe)?;

        let mut documents = result.documents.unwrap_or_default();
        let has_more = documents.len() > limit;
        documents.truncate(limit);
        Ok(FindPage {
            documents,
            has_more: Some(has_more),
        })
    }

    /// Counts the documents matching a query.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed query.
    pub fn count(&self, query: &EdvQuery) -> StoreResult<u64> {
        let mut count_query = query.clone();
        count_query.count = true;
        count_query.limit = None;
        let result = self.transport.find(&count_query)?;
        result
            .count
            .ok_or_else(|| StoreError::internal("count query returned no count"))
    }

    // =========================================================================
    // Chunk operations
    // =========================================================================

    /// Writes a chunk of a document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] when the chunk's sequence
    /// disagrees with the document.
    pub fn store_chunk(&self, doc_id: &str, chunk: &Chunk) -> StoreResult<ChunkRecord> {
        self.transport.store_chunk(doc_id, chunk)
    }

    /// Fetches one chunk of a document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    pub fn get_chunk(&self, doc_id: &str, chunk_index: u64) -> StoreResult<Chunk> {
        self.transport.get_chunk(doc_id, chunk_index)
    }

    /// Reads a document's chunks in order, starting at index 0, until the
    /// first gap.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails; a missing chunk ends the
    /// stream.
    pub fn read_chunks(&self, doc_id: &str) -> StoreResult<Vec<Chunk>> {
        let mut chunks = Vec::new();
        for index in 0.. {
            match self.transport.get_chunk(doc_id, index) {
                Ok(chunk) => chunks.push(chunk),
                Err(err) if err.is_not_found() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(chunks)
    }
}

impl<E> std::fmt::Debug for EdvClient<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdvClient")
            .field("edv_id", &self.config.id)
            .finish_non_exhaustive()
    }
}

/// The caller's document advanced to the next sequence.
fn next_version(doc: &EncryptedDocument) -> StoreResult<EncryptedDocument> {
    if doc.sequence >= MAX_SEQUENCE {
        return Err(StoreError::validation(
            "doc.sequence",
            "reached the maximum sequence",
        ));
    }
    let mut next = doc.clone();
    next.sequence += 1;
    Ok(next)
}

/// Generates and persists a vault secret, reusing a compatible existing
/// one.
fn lazy_create_secret<E: DocumentEngine>(
    context: &StorageContext<E>,
    id: &str,
    password: &str,
    cipher_version: CipherVersion,
) -> StoreResult<UnlockedSecret> {
    let generated = secrets::generate(id, password, cipher_version)?;
    match context.secrets().insert(&generated.config) {
        Ok(_) => Ok(generated.keys),
        Err(err) if err.is_constraint() => {
            // A secret already exists. If its vault config also exists,
            // this is a duplicate vault; otherwise a previous creation
            // stopped halfway and the secret may be reused, provided the
            // password matches.
            match context.configs().get(id) {
                Ok(_) => Err(StoreError::duplicate("Duplicate EDV configuration.")),
                Err(config_err) if config_err.is_not_found() => {
                    let existing = context.secrets().get(id)?;
                    secrets::decrypt(&existing.config, password)?.ok_or_else(|| {
                        StoreError::internal(format!(
                            "Secret already exists for EDV ID ({id}) but password \
                             to unlock it is invalid."
                        ))
                    })
                }
                Err(config_err) => Err(config_err),
            }
        }
        Err(err) => Err(err),
    }
}
