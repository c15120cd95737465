//! HMAC-SHA-256 key for blinded index attributes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{StoreError, StoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Raw key length in bytes (256 bits).
pub const HMAC_KEY_SIZE: usize = 32;

/// JOSE algorithm label.
pub const HMAC_ALGORITHM: &str = "HS256";

/// Key type string used in key references.
pub const HMAC_KEY_TYPE: &str = "Sha256HmacKey2019";

/// A 256-bit HMAC-SHA-256 key.
///
/// Used both as the blinded-index MAC key of an unlocked vault and as the
/// key-derivation key whose MAC outputs seed the per-vault sub-keys. The
/// secret is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HmacKey {
    #[zeroize(skip)]
    id: Option<String>,
    secret: [u8; HMAC_KEY_SIZE],
}

impl HmacKey {
    /// Generates a new random key.
    ///
    /// # Panics
    ///
    /// Panics if the system's random number generator fails.
    #[must_use]
    pub fn generate() -> Self {
        let mut secret = [0u8; HMAC_KEY_SIZE];
        getrandom::getrandom(&mut secret).expect("getrandom failed");
        Self { id: None, secret }
    }

    /// Imports a raw 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `secret` is not exactly 32 bytes.
    pub fn import(secret: &[u8]) -> StoreResult<Self> {
        let secret: [u8; HMAC_KEY_SIZE] = secret.try_into().map_err(|_| {
            StoreError::validation("secret", format!("must be {HMAC_KEY_SIZE} bytes"))
        })?;
        Ok(Self { id: None, secret })
    }

    /// Returns the key's reference id, if assigned.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Assigns the key's reference id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Returns the JOSE algorithm label.
    #[must_use]
    pub const fn algorithm(&self) -> &'static str {
        HMAC_ALGORITHM
    }

    /// Returns the key type string.
    #[must_use]
    pub const fn key_type(&self) -> &'static str {
        HMAC_KEY_TYPE
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub const fn secret_bytes(&self) -> &[u8; HMAC_KEY_SIZE] {
        &self.secret
    }

    /// Computes the HMAC-SHA-256 tag over `data`.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Verifies a tag over `data` in constant time.
    #[must_use]
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacKey")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
