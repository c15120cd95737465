//! Client-side encrypted data vault storage.
//!
//! This crate stores opaque encrypted documents (JWE blobs with blinded
//! index attributes) in named vaults over a local document database, and
//! manages the password-gated key material needed to use them.
//!
//! # Layers
//!
//! 1. [`engine`] — the document-database contract: collections keyed by
//!    `_id`, optimistic `_rev` concurrency, selector queries, tombstone
//!    purge. [`engine::MemoryEngine`] is the in-process reference
//!    implementation; a persistent engine lives in its own crate.
//! 2. [`store`] — uniqueness-checked write primitives and the generic
//!    sequence-gated config repository.
//! 3. [`crypto`] / [`secrets`] — the per-vault key hierarchy: a password
//!    derives a wrapping key (PBKDF2 + AES-KW) protecting a random
//!    key-derivation key, whose MAC outputs seed the blinded-index HMAC
//!    key and the key-agreement key (X25519 or P-256).
//! 4. [`edvs`], [`docs`], [`chunks`], [`query`], [`purge`] — the vault
//!    collections and the blinded-attribute query compiler.
//! 5. [`transport`] / [`client`] — the boundary consumed by an external
//!    encryption layer, and the client tying it all together.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use edv_core::client::{CreateEdvOptions, EdvClient};
//! use edv_core::context::StorageContext;
//! use edv_core::edvs::EdvConfig;
//! use edv_core::engine::MemoryEngine;
//! use edv_core::ids::LocalId;
//! use edv_core::secrets::CipherVersion;
//!
//! # fn main() -> Result<(), edv_core::error::StoreError> {
//! let context = StorageContext::initialize(Arc::new(MemoryEngine::new()))?;
//!
//! let result = EdvClient::create_edv(&context, CreateEdvOptions {
//!     config: EdvConfig {
//!         id: LocalId::generate().to_string(),
//!         controller: "urn:controller".to_string(),
//!         sequence: 0,
//!         hmac: None,
//!         key_agreement_key: None,
//!     },
//!     password: Some("correct horse battery staple".to_string()),
//!     cipher_version: CipherVersion::Recommended,
//! })?;
//!
//! let client = result.client.expect("password given, client returned");
//! assert_eq!(client.id(), result.config.id);
//! # Ok(())
//! # }
//! ```

pub mod chunks;
pub mod client;
pub mod context;
pub mod crypto;
pub mod docs;
pub mod edvs;
pub mod engine;
pub mod error;
pub mod ids;
pub mod purge;
pub mod query;
pub mod secrets;
pub mod store;
pub mod transport;

pub use client::{CreateEdvOptions, CreateEdvResult, EdvClient, FindPage};
pub use context::StorageContext;
pub use error::{StoreError, StoreResult};
pub use ids::LocalId;
