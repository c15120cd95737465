//! Password-gated secret configs and the per-vault key hierarchy.
//!
//! Each vault pairs 1:1 with a secret config holding a salt and one or two
//! wrapped keys. The hierarchy:
//!
//! ```text
//! password ── PBKDF2 ──▶ KEK (AES-KW)
//!                         │ wraps
//! random KDK (HMAC key) ◀─┘
//!   │ sign("hmac")             ──▶ blinded-index HMAC key
//!   │ sign("keyAgreementKey")  ──▶ X25519 KAK        (recommended suite)
//!   └ (fips: a generated P-256 KAK is wrapped alongside instead)
//! ```
//!
//! Unlocking reverses the derivation. A wrong password surfaces as
//! `Ok(None)` from [`decrypt`], never as an error: unwrap failure is
//! indistinguishable from corrupted input, and nothing beyond the `None`
//! return reveals whether a password was close.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{
    derive_bits, HmacKey, Kek, KeyAgreementKey, P256Kak, X25519Kak, PBKDF2_ITERATIONS,
    P256_RAW_EXPORT_SIZE, SALT_SIZE,
};
use crate::error::{StoreError, StoreResult};
use crate::ids::{multihash_decode, multihash_encode, LocalId};
use crate::store::{validate_sequence, ConfigStore, StoredConfig};

/// Collection holding secret configs.
pub const COLLECTION_NAME: &str = "edv-storage-secret";

/// The only defined stored-secret version.
pub const SECRET_VERSION: &str = "1";

/// Wrapped size of the 32-byte key-derivation key.
pub const WRAPPED_KEY_SIZE: usize = 40;

/// Wrapped size of the 72-byte P-256 raw export.
pub const WRAPPED_KAK_SIZE: usize = P256_RAW_EXPORT_SIZE + 8;

/// Domain label MACed to derive the blinded-index HMAC key.
const HMAC_LABEL: &[u8] = b"hmac";

/// Domain label MACed to derive the X25519 key-agreement secret.
const KAK_LABEL: &[u8] = b"keyAgreementKey";

/// Typed repository over the secret-config collection.
pub type SecretStore<E> = ConfigStore<E, SecretConfig>;

/// Cipher suite selecting the key-agreement algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CipherVersion {
    /// X25519 key agreement.
    #[default]
    Recommended,
    /// NIST P-256 key agreement.
    Fips,
}

impl CipherVersion {
    /// Returns the suite's string label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recommended => "recommended",
            Self::Fips => "fips",
        }
    }
}

/// The password-protected payload of a secret config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedSecret {
    /// Stored-secret format version.
    pub version: String,
    /// PBKDF2 salt, multihash-encoded.
    pub salt: String,
    /// Wrapped key-derivation key, multihash-encoded.
    pub wrapped_key: String,
    /// Wrapped P-256 key pair, multihash-encoded; present only for the
    /// fips suite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapped_key_agreement_key: Option<String>,
}

/// A secret config as persisted alongside its vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretConfig {
    /// The paired vault's id.
    pub id: String,
    /// Reference id assigned to the derived HMAC key.
    pub hmac_id: String,
    /// Reference id assigned to the derived key-agreement key.
    pub key_agreement_key_id: String,
    /// The wrapped key material.
    pub secret: WrappedSecret,
    /// Optimistic concurrency counter.
    pub sequence: u64,
}

impl StoredConfig for SecretConfig {
    fn id(&self) -> &str {
        &self.id
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn validate(&self) -> StoreResult<()> {
        LocalId::parse(&self.id)?;
        if self.hmac_id.is_empty() {
            return Err(StoreError::validation("config.hmacId", "must be a non-empty string"));
        }
        if self.key_agreement_key_id.is_empty() {
            return Err(StoreError::validation(
                "config.keyAgreementKeyId",
                "must be a non-empty string",
            ));
        }
        if self.secret.version != SECRET_VERSION {
            return Err(StoreError::validation(
                "config.secret.version",
                format!("must be \"{SECRET_VERSION}\""),
            ));
        }
        if self.secret.salt.is_empty() || self.secret.wrapped_key.is_empty() {
            return Err(StoreError::validation(
                "config.secret",
                "must carry \"salt\" and \"wrappedKey\"",
            ));
        }
        validate_sequence("config.sequence", self.sequence)
    }
}

/// The keys of an unlocked vault.
#[derive(Debug)]
pub struct UnlockedSecret {
    /// Blinded-index HMAC key, carrying its reference id.
    pub hmac: HmacKey,
    /// Key-agreement key, carrying its reference id.
    pub key_agreement_key: KeyAgreementKey,
    /// The suite the secret was generated under.
    pub cipher_version: CipherVersion,
}

/// Output of [`generate`]: the persistable config and the unlocked keys.
#[derive(Debug)]
pub struct GeneratedSecret {
    /// The secret config, ready for insertion.
    pub config: SecretConfig,
    /// The derived keys, already carrying their reference ids.
    pub keys: UnlockedSecret,
}

/// Generates a fresh secret config for a vault.
///
/// A random key-derivation key is wrapped under a PBKDF2-derived KEK; for
/// the fips suite a P-256 key pair is generated and wrapped alongside.
/// Sub-keys are derived exactly as [`decrypt`] would derive them, and the
/// key reference ids are fresh UUID URNs.
///
/// # Errors
///
/// Returns a constraint error when `id` is not a well-formed vault
/// identifier.
pub fn generate(id: &str, password: &str, cipher_version: CipherVersion) -> StoreResult<GeneratedSecret> {
    LocalId::parse(id)?;

    let kdk = HmacKey::generate();

    let derived = derive_bits(password, None, PBKDF2_ITERATIONS, 256)?;
    let kek = Kek::import(&derived.bits)?;
    drop(derived.bits);

    let wrapped_key = kek.wrap_key(kdk.secret_bytes())?;
    debug_assert_eq!(wrapped_key.len(), WRAPPED_KEY_SIZE);

    let wrapped_key_agreement_key = match cipher_version {
        CipherVersion::Recommended => None,
        CipherVersion::Fips => {
            let kak = P256Kak::generate();
            let raw = kak.to_raw_export();
            let wrapped = kek.wrap_key(&raw[..])?;
            debug_assert_eq!(wrapped.len(), WRAPPED_KAK_SIZE);
            Some(multihash_encode(&wrapped))
        }
    };

    let secret = WrappedSecret {
        version: SECRET_VERSION.to_string(),
        salt: multihash_encode(&derived.salt),
        wrapped_key: multihash_encode(&wrapped_key),
        wrapped_key_agreement_key,
    };

    let (mut hmac, mut key_agreement_key, derived_version) = derive_keys(&kdk, &kek, &secret)?;
    debug_assert_eq!(derived_version, cipher_version);

    let hmac_id = uuid::Uuid::new_v4().urn().to_string();
    let key_agreement_key_id = uuid::Uuid::new_v4().urn().to_string();
    hmac.set_id(hmac_id.clone());
    key_agreement_key.set_id(key_agreement_key_id.clone());

    Ok(GeneratedSecret {
        config: SecretConfig {
            id: id.to_string(),
            hmac_id,
            key_agreement_key_id,
            secret,
            sequence: 0,
        },
        keys: UnlockedSecret {
            hmac,
            key_agreement_key,
            cipher_version,
        },
    })
}

/// Attempts to unlock a secret config with a password.
///
/// Returns `Ok(None)` when the password does not unwrap the stored key;
/// never an error, so callers cannot distinguish a wrong password from
/// corrupted wrapped bytes.
///
/// # Errors
///
/// Returns an error for an unsupported version, malformed stored
/// encodings, or a wrapped key-agreement key that unwraps to garbage.
pub fn decrypt(config: &SecretConfig, password: &str) -> StoreResult<Option<UnlockedSecret>> {
    if config.secret.version != SECRET_VERSION {
        return Err(StoreError::internal(format!(
            "Unsupported secret version \"{}\".",
            config.secret.version
        )));
    }

    let salt_bytes = multihash_decode("config.secret.salt", &config.secret.salt, SALT_SIZE)?;
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&salt_bytes);

    let derived = derive_bits(password, Some(salt), PBKDF2_ITERATIONS, 256)?;
    let kek = Kek::import(&derived.bits)?;
    drop(derived.bits);

    let wrapped_key = multihash_decode(
        "config.secret.wrappedKey",
        &config.secret.wrapped_key,
        WRAPPED_KEY_SIZE,
    )?;
    let Some(kdk_secret) = kek.unwrap_key(&wrapped_key) else {
        // Wrong password (or corrupted wrapped key; indistinguishable).
        return Ok(None);
    };
    let kdk = HmacKey::import(&kdk_secret)?;
    drop(kdk_secret);

    let (mut hmac, mut key_agreement_key, cipher_version) = derive_keys(&kdk, &kek, &config.secret)?;
    hmac.set_id(config.hmac_id.clone());
    key_agreement_key.set_id(config.key_agreement_key_id.clone());

    Ok(Some(UnlockedSecret {
        hmac,
        key_agreement_key,
        cipher_version,
    }))
}

/// Derives the per-vault sub-keys from an unwrapped key-derivation key.
fn derive_keys(
    kdk: &HmacKey,
    kek: &Kek,
    secret: &WrappedSecret,
) -> StoreResult<(HmacKey, KeyAgreementKey, CipherVersion)> {
    let hmac_secret = Zeroizing::new(kdk.sign(HMAC_LABEL));
    let hmac = HmacKey::import(&hmac_secret)?;
    drop(hmac_secret);

    if let Some(wrapped_kak) = &secret.wrapped_key_agreement_key {
        let wrapped = multihash_decode(
            "config.secret.wrappedKeyAgreementKey",
            wrapped_kak,
            WRAPPED_KAK_SIZE,
        )?;
        let raw = kek
            .unwrap_key(&wrapped)
            .ok_or_else(|| StoreError::internal("Invalid stored key agreement key."))?;
        let kak = P256Kak::from_raw_export(&raw)?;
        return Ok((hmac, KeyAgreementKey::P256(kak), CipherVersion::Fips));
    }

    let kak_secret = Zeroizing::new(kdk.sign(KAK_LABEL));
    let kak = X25519Kak::import(&kak_secret)?;
    drop(kak_secret);
    Ok((hmac, KeyAgreementKey::X25519(kak), CipherVersion::Recommended))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault_id() -> String {
        LocalId::generate().to_string()
    }

    #[test]
    fn generate_then_decrypt_recommended() {
        let id = vault_id();
        let generated = generate(&id, "pw", CipherVersion::Recommended).unwrap();

        assert_eq!(generated.config.id, id);
        assert_eq!(generated.config.sequence, 0);
        assert_eq!(generated.config.secret.version, "1");
        assert!(generated.config.secret.wrapped_key_agreement_key.is_none());
        assert!(generated.config.hmac_id.starts_with("urn:uuid:"));

        let unlocked = decrypt(&generated.config, "pw").unwrap().unwrap();
        assert_eq!(unlocked.cipher_version, CipherVersion::Recommended);
        assert_eq!(unlocked.hmac.id(), Some(generated.config.hmac_id.as_str()));
        assert_eq!(
            unlocked.key_agreement_key.id(),
            Some(generated.config.key_agreement_key_id.as_str())
        );

        // Same sub-keys on both sides of the round trip.
        assert_eq!(
            generated.keys.hmac.sign(b"attr"),
            unlocked.hmac.sign(b"attr")
        );
        assert_eq!(
            generated.keys.key_agreement_key.public_key_multibase(),
            unlocked.key_agreement_key.public_key_multibase()
        );
    }

    #[test]
    fn generate_then_decrypt_fips() {
        let id = vault_id();
        let generated = generate(&id, "pw", CipherVersion::Fips).unwrap();
        assert!(generated.config.secret.wrapped_key_agreement_key.is_some());

        let unlocked = decrypt(&generated.config, "pw").unwrap().unwrap();
        assert_eq!(unlocked.cipher_version, CipherVersion::Fips);
        assert_eq!(unlocked.key_agreement_key.key_type(), "Multikey");
        assert_eq!(
            generated.keys.key_agreement_key.public_key_multibase(),
            unlocked.key_agreement_key.public_key_multibase()
        );
    }

    #[test]
    fn wrong_password_is_none_not_error() {
        let generated = generate(&vault_id(), "pw", CipherVersion::Recommended).unwrap();
        assert!(decrypt(&generated.config, "invalid").unwrap().is_none());
    }

    #[test]
    fn unsupported_version_is_an_error() {
        let mut generated = generate(&vault_id(), "pw", CipherVersion::Recommended).unwrap();
        generated.config.secret.version = "2".to_string();
        let err = decrypt(&generated.config, "pw").unwrap_err();
        assert_eq!(format!("{err}"), "Unsupported secret version \"2\".");
    }

    #[test]
    fn corrupted_wrapped_kak_is_an_error() {
        let mut generated = generate(&vault_id(), "pw", CipherVersion::Fips).unwrap();
        // Re-wrap garbage of the right size so only the inner check fails.
        generated.config.secret.wrapped_key_agreement_key =
            Some(multihash_encode(&[0u8; WRAPPED_KAK_SIZE]));
        let err = decrypt(&generated.config, "pw").unwrap_err();
        assert_eq!(format!("{err}"), "Invalid stored key agreement key.");
    }

    #[test]
    fn generate_rejects_malformed_id() {
        let err = generate("not-an-id", "pw", CipherVersion::Recommended).unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn salt_and_wrapped_sizes_are_checked() {
        let mut generated = generate(&vault_id(), "pw", CipherVersion::Recommended).unwrap();
        generated.config.secret.salt = multihash_encode(&[0u8; 17]);
        let err = decrypt(&generated.config, "pw").unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn distinct_generations_use_distinct_salts() {
        let a = generate(&vault_id(), "pw", CipherVersion::Recommended).unwrap();
        let b = generate(&vault_id(), "pw", CipherVersion::Recommended).unwrap();
        assert_ne!(a.config.secret.salt, b.config.secret.salt);
        assert_ne!(a.config.secret.wrapped_key, b.config.secret.wrapped_key);
    }

    #[test]
    fn config_validates_in_store_shape() {
        let generated = generate(&vault_id(), "pw", CipherVersion::Fips).unwrap();
        generated.config.validate().unwrap();

        let mut bad = generated.config.clone();
        bad.hmac_id.clear();
        assert!(bad.validate().is_err());
    }
}
