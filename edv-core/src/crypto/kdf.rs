//! PBKDF2-SHA-256 bit derivation for the password-derived wrapping key.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{StoreError, StoreResult};

/// Iteration count for stored-secret version `"1"`.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length in bytes.
pub const SALT_SIZE: usize = 16;

/// Output of a PBKDF2 derivation.
pub struct DerivedBits {
    /// The salt used, freshly generated when none was supplied.
    pub salt: [u8; SALT_SIZE],
    /// The derived bits, zeroized on drop.
    pub bits: Zeroizing<Vec<u8>>,
}

/// Derives `bit_length` bits from a UTF-8 password.
///
/// The salt defaults to 16 fresh random bytes when not supplied.
///
/// # Errors
///
/// Returns a validation error when `bit_length` is zero or not a multiple
/// of 8.
///
/// # Panics
///
/// Panics if the system's random number generator fails while generating
/// a salt.
pub fn derive_bits(
    password: &str,
    salt: Option<[u8; SALT_SIZE]>,
    iterations: u32,
    bit_length: usize,
) -> StoreResult<DerivedBits> {
    if bit_length == 0 || bit_length % 8 != 0 {
        return Err(StoreError::validation(
            "bit_length",
            "must be a positive multiple of 8",
        ));
    }

    let salt = salt.unwrap_or_else(|| {
        let mut fresh = [0u8; SALT_SIZE];
        getrandom::getrandom(&mut fresh).expect("getrandom failed");
        fresh
    });

    let mut bits = Zeroizing::new(vec![0u8; bit_length / 8]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut bits);

    Ok(DerivedBits { salt, bits })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reduced iteration count keeps the unit tests fast; production callers
    // pass PBKDF2_ITERATIONS.
    const TEST_ITERATIONS: u32 = 10;

    #[test]
    fn derivation_is_deterministic_per_salt() {
        let salt = [0x42u8; SALT_SIZE];
        let a = derive_bits("password", Some(salt), TEST_ITERATIONS, 256).unwrap();
        let b = derive_bits("password", Some(salt), TEST_ITERATIONS, 256).unwrap();
        assert_eq!(a.bits, b.bits);
        assert_eq!(a.bits.len(), 32);
    }

    #[test]
    fn different_password_different_bits() {
        let salt = [0x42u8; SALT_SIZE];
        let a = derive_bits("password", Some(salt), TEST_ITERATIONS, 256).unwrap();
        let b = derive_bits("other", Some(salt), TEST_ITERATIONS, 256).unwrap();
        assert_ne!(a.bits, b.bits);
    }

    #[test]
    fn fresh_salt_when_none_given() {
        let a = derive_bits("password", None, TEST_ITERATIONS, 256).unwrap();
        let b = derive_bits("password", None, TEST_ITERATIONS, 256).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.bits, b.bits);
    }

    #[test]
    fn rejects_unaligned_bit_length() {
        assert!(derive_bits("pw", None, TEST_ITERATIONS, 0).is_err());
        assert!(derive_bits("pw", None, TEST_ITERATIONS, 100).is_err());
    }
}
