//! AES-256 key-wrapping key.

use aes_kw::KekAes256;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{StoreError, StoreResult};

/// Raw key length in bytes (256 bits).
pub const KEK_SIZE: usize = 32;

/// Bytes added by the key-wrap integrity block: a 32-byte key wraps to 40
/// bytes, a 72-byte key to 80.
pub const KEY_WRAP_OVERHEAD: usize = 8;

/// A 256-bit AES key-wrapping key derived from the vault password.
///
/// Wrapping follows RFC 3394; the wrapped output carries an integrity
/// check, so unwrapping with the wrong key fails rather than yielding
/// garbage. The secret is zeroized on drop.
pub struct Kek {
    secret: [u8; KEK_SIZE],
}

impl Kek {
    /// Imports a raw 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `secret` is not exactly 32 bytes.
    pub fn import(secret: &[u8]) -> StoreResult<Self> {
        let secret: [u8; KEK_SIZE] = secret
            .try_into()
            .map_err(|_| StoreError::validation("secret", format!("must be {KEK_SIZE} bytes")))?;
        Ok(Self { secret })
    }

    /// Wraps a key, producing `unwrapped.len() + 8` bytes.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `unwrapped` is not a multiple of 8
    /// bytes of at least 16 bytes, the sizes the wrap algorithm accepts.
    pub fn wrap_key(&self, unwrapped: &[u8]) -> StoreResult<Vec<u8>> {
        KekAes256::from(self.secret)
            .wrap_vec(unwrapped)
            .map_err(|_| {
                StoreError::validation(
                    "unwrapped",
                    "must be a multiple of 8 bytes, at least 16 bytes long",
                )
            })
    }

    /// Unwraps a key.
    ///
    /// Returns `None` when the integrity check fails; a wrong wrapping
    /// key and corrupted input are indistinguishable.
    #[must_use]
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        KekAes256::from(self.secret)
            .unwrap_vec(wrapped)
            .ok()
            .map(Zeroizing::new)
    }
}

impl Drop for Kek {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kek").field("secret", &"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_kek() -> Kek {
        let mut secret = [0u8; KEK_SIZE];
        getrandom::getrandom(&mut secret).expect("getrandom failed");
        Kek::import(&secret).unwrap()
    }

    #[test]
    fn wrap_adds_integrity_block() {
        let kek = random_kek();
        let wrapped = kek.wrap_key(&[0x42u8; 32]).unwrap();
        assert_eq!(wrapped.len(), 32 + KEY_WRAP_OVERHEAD);

        let wrapped = kek.wrap_key(&[0x42u8; 72]).unwrap();
        assert_eq!(wrapped.len(), 72 + KEY_WRAP_OVERHEAD);
    }

    #[test]
    fn unwrap_round_trips() {
        let kek = random_kek();
        let key = [0x17u8; 32];
        let wrapped = kek.wrap_key(&key).unwrap();
        let unwrapped = kek.unwrap_key(&wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), key);
    }

    #[test]
    fn unwrap_with_wrong_key_returns_none() {
        let wrapped = random_kek().wrap_key(&[0x17u8; 32]).unwrap();
        assert!(random_kek().unwrap_key(&wrapped).is_none());
    }

    #[test]
    fn unwrap_of_tampered_data_returns_none() {
        let kek = random_kek();
        let mut wrapped = kek.wrap_key(&[0x17u8; 32]).unwrap();
        wrapped[3] ^= 0xFF;
        assert!(kek.unwrap_key(&wrapped).is_none());
    }

    #[test]
    fn wrap_rejects_unaligned_input() {
        let kek = random_kek();
        assert!(kek.wrap_key(&[0u8; 31]).is_err());
    }
}
