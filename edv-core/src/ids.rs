//! Identifier and key-material encodings.
//!
//! Vault, document, and secret identifiers are 16 random bytes rendered as
//! `z` + base58btc of an identity multihash (`0x00 0x10` header followed by
//! the raw bytes). Key material blobs (salts and wrapped keys) use the same
//! multibase/multihash framing with a length-checked payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Multibase prefix for base58btc.
const MULTIBASE_BASE58: char = 'z';

/// Multihash code for the identity hash function.
const MULTIHASH_IDENTITY: u8 = 0x00;

/// Raw length of a local identifier.
pub const LOCAL_ID_SIZE: usize = 16;

/// A 16-byte local identifier for vaults, documents, and secrets.
///
/// The canonical text form is `z` + base58btc(`0x00 0x10` || bytes). Any
/// string that does not round-trip through this encoding is rejected.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId([u8; LOCAL_ID_SIZE]);

impl LocalId {
    /// Creates a local identifier from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; LOCAL_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generates a new random local identifier.
    ///
    /// # Panics
    ///
    /// Panics if the system's random number generator fails.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; LOCAL_ID_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Returns the raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; LOCAL_ID_SIZE] {
        &self.0
    }

    /// Parses a local identifier from its multibase text form.
    ///
    /// # Errors
    ///
    /// Returns a constraint error when the string is not the base58btc
    /// multibase form of an identity multihash over 16 bytes.
    pub fn parse(id: &str) -> StoreResult<Self> {
        Self::try_parse(id).ok_or_else(|| {
            StoreError::constraint(format!(
                "Identifier \"{id}\" must be base58-encoded multibase, \
                 multihash array of 16 random bytes."
            ))
        })
    }

    fn try_parse(id: &str) -> Option<Self> {
        let encoded = id.strip_prefix(MULTIBASE_BASE58)?;
        let decoded = bs58::decode(encoded).into_vec().ok()?;
        if decoded.len() != 2 + LOCAL_ID_SIZE {
            return None;
        }
        if decoded[0] != MULTIHASH_IDENTITY || decoded[1] != LOCAL_ID_SIZE as u8 {
            return None;
        }
        let mut bytes = [0u8; LOCAL_ID_SIZE];
        bytes.copy_from_slice(&decoded[2..]);
        Some(Self(bytes))
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", multihash_encode(&self.0))
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({self})")
    }
}

impl Serialize for LocalId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LocalId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::try_parse(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid local identifier \"{text}\""))
        })
    }
}

/// Encodes bytes as `z` + base58btc of an identity multihash.
///
/// The payload length must fit the single-byte multihash length field.
#[must_use]
pub fn multihash_encode(data: &[u8]) -> String {
    debug_assert!(data.len() <= u8::MAX as usize);
    let mut framed = Vec::with_capacity(2 + data.len());
    framed.push(MULTIHASH_IDENTITY);
    framed.push(data.len() as u8);
    framed.extend_from_slice(data);
    format!("{MULTIBASE_BASE58}{}", bs58::encode(framed).into_string())
}

/// Decodes a `z` + base58btc identity multihash string, checking the
/// payload length against `expected_size`.
///
/// # Errors
///
/// Returns a validation error naming `parameter` when the string is not a
/// well-formed multihash of exactly `expected_size` bytes.
pub fn multihash_decode(parameter: &str, text: &str, expected_size: usize) -> StoreResult<Vec<u8>> {
    let invalid = || {
        StoreError::validation(
            parameter,
            format!(
                "must be a base58-encoded multibase, multihash array \
                 of {expected_size} bytes"
            ),
        )
    };

    let encoded = text.strip_prefix(MULTIBASE_BASE58).ok_or_else(invalid)?;
    let decoded = bs58::decode(encoded).into_vec().map_err(|_| invalid())?;
    if decoded.len() != 2 + expected_size
        || decoded[0] != MULTIHASH_IDENTITY
        || decoded[1] as usize != expected_size
    {
        return Err(invalid());
    }
    Ok(decoded[2..].to_vec())
}
