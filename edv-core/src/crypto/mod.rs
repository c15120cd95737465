//! Cryptographic primitives for the secret vault.
//!
//! Everything here operates on byte slices and zeroizes secret-bearing
//! buffers: the blinded-index MAC key ([`HmacKey`]), the password-derived
//! key-encryption key ([`Kek`]), PBKDF2 bit derivation ([`derive_bits`]),
//! and the two key-agreement suites ([`X25519Kak`], [`P256Kak`]).

mod hmac;
mod kak;
mod kdf;
mod kek;

pub use hmac::{HmacKey, HMAC_ALGORITHM, HMAC_KEY_SIZE, HMAC_KEY_TYPE};
pub use kak::{
    KeyAgreementKey, P256Kak, X25519Kak, MULTIKEY_TYPE, P256_RAW_EXPORT_SIZE,
    X25519_KEY_TYPE,
};
pub use kdf::{derive_bits, DerivedBits, PBKDF2_ITERATIONS, SALT_SIZE};
pub use kek::{Kek, KEK_SIZE, KEY_WRAP_OVERHEAD};
