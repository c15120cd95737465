//! Key-agreement keys: X25519 (recommended suite) and NIST P-256 (fips
//! suite).
//!
//! Public keys are exported as `publicKeyMultibase` strings: `z` +
//! base58btc over a two-byte multicodec header and the raw key bytes.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{StoreError, StoreResult};

/// Key type string for the X25519 suite.
pub const X25519_KEY_TYPE: &str = "X25519KeyAgreementKey2020";

/// Key type string for the P-256 suite.
pub const MULTIKEY_TYPE: &str = "Multikey";

/// Raw export form of a P-256 key pair: 32 secret bytes, 33 compressed
/// public bytes, 7 bytes of zero padding to reach a wrappable size.
pub const P256_RAW_EXPORT_SIZE: usize = 72;

const X25519_KEY_SIZE: usize = 32;
const P256_SECRET_SIZE: usize = 32;
const P256_COMPRESSED_PUBLIC_SIZE: usize = 33;

/// Multicodec header for an X25519 public key.
const MULTICODEC_X25519_PUBLIC: [u8; 2] = [0xec, 0x01];

/// Multicodec header for an X25519 secret key.
const MULTICODEC_X25519_SECRET: [u8; 2] = [0x82, 0x26];

/// Multicodec header for a P-256 public key.
const MULTICODEC_P256_PUBLIC: [u8; 2] = [0x80, 0x24];

fn multicodec_multibase(header: [u8; 2], bytes: &[u8]) -> String {
    let mut framed = Vec::with_capacity(2 + bytes.len());
    framed.extend_from_slice(&header);
    framed.extend_from_slice(bytes);
    format!("z{}", bs58::encode(framed).into_string())
}

// Random source bridging getrandom into the rand_core traits the P-256
// key generator expects.
struct OsRng;

impl rand_core::RngCore for OsRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        getrandom::getrandom(dest).expect("getrandom failed");
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        getrandom::getrandom(dest).map_err(|_| rand_core::Error::new("getrandom failed"))
    }
}

impl rand_core::CryptoRng for OsRng {}

// =============================================================================
// X25519
// =============================================================================

/// An X25519 key-agreement key pair.
///
/// The public half is always recomputed from the secret, so importing the
/// 32 secret bytes reconstructs the full pair. The secret is zeroized on
/// drop.
pub struct X25519Kak {
    id: Option<String>,
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519Kak {
    /// Generates a new random key pair.
    ///
    /// # Panics
    ///
    /// Panics if the system's random number generator fails.
    #[must_use]
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; X25519_KEY_SIZE];
        getrandom::getrandom(&mut secret_bytes).expect("getrandom failed");
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Self {
            id: None,
            secret,
            public,
        }
    }

    /// Imports a key pair from its 32 secret bytes.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `secret` is not exactly 32 bytes.
    pub fn import(secret: &[u8]) -> StoreResult<Self> {
        let secret_bytes: [u8; X25519_KEY_SIZE] = secret.try_into().map_err(|_| {
            StoreError::validation("secret", format!("must be {X25519_KEY_SIZE} bytes"))
        })?;
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Ok(Self {
            id: None,
            secret,
            public,
        })
    }

    /// Derives the 32-byte shared secret with a peer public key.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `public_key` is not exactly 32
    /// bytes.
    pub fn derive_secret(&self, public_key: &[u8]) -> StoreResult<Zeroizing<[u8; 32]>> {
        let peer: [u8; X25519_KEY_SIZE] = public_key.try_into().map_err(|_| {
            StoreError::validation("public_key", format!("must be {X25519_KEY_SIZE} bytes"))
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    /// Returns the raw public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        self.public.as_bytes()
    }

    /// Returns the public key in multibase form.
    #[must_use]
    pub fn public_key_multibase(&self) -> String {
        multicodec_multibase(MULTICODEC_X25519_PUBLIC, self.public.as_bytes())
    }

    /// Returns the secret key in multibase form.
    #[must_use]
    pub fn secret_key_multibase(&self) -> Zeroizing<String> {
        Zeroizing::new(multicodec_multibase(
            MULTICODEC_X25519_SECRET,
            self.secret.as_bytes(),
        ))
    }
}

impl std::fmt::Debug for X25519Kak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X25519Kak")
            .field("id", &self.id)
            .field("public", &self.public_key_multibase())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// P-256
// =============================================================================

/// A NIST P-256 key-agreement key pair for the fips cipher suite.
///
/// Unlike X25519, the stored form carries both halves: the raw export is
/// the 32 secret bytes followed by the 33-byte compressed public point,
/// zero-padded to 72 bytes so it can be key-wrapped.
pub struct P256Kak {
    id: Option<String>,
    secret: p256::SecretKey,
    public: p256::PublicKey,
}

impl P256Kak {
    /// Generates a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let secret = p256::SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self {
            id: None,
            secret,
            public,
        }
    }

    /// Imports a key pair from its secret scalar and SEC1 public point.
    ///
    /// # Errors
    ///
    /// Returns a validation error when either half fails to parse or the
    /// halves do not belong together.
    pub fn import(secret_key: &[u8], public_key: &[u8]) -> StoreResult<Self> {
        let secret = p256::SecretKey::from_slice(secret_key)
            .map_err(|_| StoreError::validation("secret_key", "must be a valid P-256 scalar"))?;
        let public = p256::PublicKey::from_sec1_bytes(public_key)
            .map_err(|_| StoreError::validation("public_key", "must be a valid SEC1 point"))?;
        if secret.public_key() != public {
            return Err(StoreError::validation(
                "public_key",
                "does not match the secret key",
            ));
        }
        Ok(Self {
            id: None,
            secret,
            public,
        })
    }

    /// Reassembles a key pair from its 72-byte raw export form.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the buffer has the wrong length or
    /// either half fails to parse.
    pub fn from_raw_export(raw: &[u8]) -> StoreResult<Self> {
        if raw.len() != P256_RAW_EXPORT_SIZE {
            return Err(StoreError::validation(
                "raw",
                format!("must be {P256_RAW_EXPORT_SIZE} bytes"),
            ));
        }
        let secret_end = P256_SECRET_SIZE;
        let public_end = secret_end + P256_COMPRESSED_PUBLIC_SIZE;
        Self::import(&raw[..secret_end], &raw[secret_end..public_end])
    }

    /// Serializes the key pair into its 72-byte raw export form.
    #[must_use]
    pub fn to_raw_export(&self) -> Zeroizing<[u8; P256_RAW_EXPORT_SIZE]> {
        let mut raw = Zeroizing::new([0u8; P256_RAW_EXPORT_SIZE]);
        raw[..P256_SECRET_SIZE].copy_from_slice(&self.secret.to_bytes());
        raw[P256_SECRET_SIZE..P256_SECRET_SIZE + P256_COMPRESSED_PUBLIC_SIZE]
            .copy_from_slice(self.public.to_encoded_point(true).as_bytes());
        raw
    }

    /// Derives the 32-byte ECDH shared secret with a peer public key in
    /// SEC1 form (compressed or uncompressed).
    ///
    /// # Errors
    ///
    /// Returns a validation error when `public_key` fails to parse.
    pub fn derive_secret(&self, public_key: &[u8]) -> StoreResult<Zeroizing<[u8; 32]>> {
        let peer = p256::PublicKey::from_sec1_bytes(public_key)
            .map_err(|_| StoreError::validation("public_key", "must be a valid SEC1 point"))?;
        let shared =
            p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut bytes = Zeroizing::new([0u8; 32]);
        bytes.copy_from_slice(shared.raw_secret_bytes());
        Ok(bytes)
    }

    /// Returns the compressed public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; P256_COMPRESSED_PUBLIC_SIZE] {
        let point = self.public.to_encoded_point(true);
        let mut bytes = [0u8; P256_COMPRESSED_PUBLIC_SIZE];
        bytes.copy_from_slice(point.as_bytes());
        bytes
    }

    /// Returns the public key in multibase form.
    #[must_use]
    pub fn public_key_multibase(&self) -> String {
        multicodec_multibase(MULTICODEC_P256_PUBLIC, &self.public_key_bytes())
    }
}

impl std::fmt::Debug for P256Kak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P256Kak")
            .field("id", &self.id)
            .field("public", &self.public_key_multibase())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Suite-agnostic wrapper
// =============================================================================

/// A key-agreement key of either suite.
#[derive(Debug)]
pub enum KeyAgreementKey {
    /// X25519 (recommended cipher suite).
    X25519(X25519Kak),
    /// NIST P-256 (fips cipher suite).
    P256(P256Kak),
}

impl KeyAgreementKey {
    /// Returns the key's reference id, if assigned.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::X25519(key) => key.id.as_deref(),
            Self::P256(key) => key.id.as_deref(),
        }
    }

    /// Assigns the key's reference id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = Some(id.into());
        match self {
            Self::X25519(key) => key.id = id,
            Self::P256(key) => key.id = id,
        }
    }

    /// Returns the key type string for key references.
    #[must_use]
    pub const fn key_type(&self) -> &'static str {
        match self {
            Self::X25519(_) => X25519_KEY_TYPE,
            Self::P256(_) => MULTIKEY_TYPE,
        }
    }

    /// Returns the public key in multibase form.
    #[must_use]
    pub fn public_key_multibase(&self) -> String {
        match self {
            Self::X25519(key) => key.public_key_multibase(),
            Self::P256(key) => key.public_key_multibase(),
        }
    }

    /// Derives the 32-byte shared secret with a peer public key in the
    /// suite's raw form.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the peer key does not parse.
    pub fn derive_secret(&self, public_key: &[u8]) -> StoreResult<Zeroizing<[u8; 32]>> {
        match self {
            Self::X25519(key) => key.derive_secret(public_key),
            Self::P256(key) => key.derive_secret(public_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_agreement_matches_both_ways() {
        let alice = X25519Kak::generate();
        let bob = X25519Kak::generate();

        let ab = alice.derive_secret(bob.public_key_bytes()).unwrap();
        let ba = bob.derive_secret(alice.public_key_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn x25519_import_reconstructs_public_half() {
        let key = X25519Kak::generate();
        let copy = X25519Kak::import(key.secret.as_bytes()).unwrap();
        assert_eq!(key.public_key_bytes(), copy.public_key_bytes());
    }

    #[test]
    fn x25519_multibase_headers() {
        let key = X25519Kak::generate();
        let public = key.public_key_multibase();
        assert!(public.starts_with('z'));
        let decoded = bs58::decode(&public[1..]).into_vec().unwrap();
        assert_eq!(&decoded[..2], &MULTICODEC_X25519_PUBLIC);
        assert_eq!(decoded.len(), 2 + 32);

        let secret = key.secret_key_multibase();
        let decoded = bs58::decode(&secret[1..]).into_vec().unwrap();
        assert_eq!(&decoded[..2], &MULTICODEC_X25519_SECRET);
    }

    #[test]
    fn p256_agreement_matches_both_ways() {
        let alice = P256Kak::generate();
        let bob = P256Kak::generate();

        let ab = alice.derive_secret(&bob.public_key_bytes()).unwrap();
        let ba = bob.derive_secret(&alice.public_key_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn p256_raw_export_round_trips() {
        let key = P256Kak::generate();
        let raw = key.to_raw_export();
        assert_eq!(raw.len(), P256_RAW_EXPORT_SIZE);
        // Trailing pad bytes stay zero.
        assert_eq!(&raw[65..], &[0u8; 7]);

        let restored = P256Kak::from_raw_export(&raw[..]).unwrap();
        assert_eq!(key.public_key_bytes(), restored.public_key_bytes());

        let shared_a = key.derive_secret(&restored.public_key_bytes()).unwrap();
        let shared_b = restored.derive_secret(&key.public_key_bytes()).unwrap();
        assert_eq!(*shared_a, *shared_b);
    }

    #[test]
    fn p256_import_rejects_mismatched_halves() {
        let a = P256Kak::generate();
        let b = P256Kak::generate();
        let err = P256Kak::import(&a.secret.to_bytes(), &b.public_key_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn p256_from_raw_export_rejects_bad_length() {
        assert!(P256Kak::from_raw_export(&[0u8; 71]).is_err());
        assert!(P256Kak::from_raw_export(&[0u8; 73]).is_err());
    }

    #[test]
    fn p256_multibase_header() {
        let key = P256Kak::generate();
        let public = key.public_key_multibase();
        let decoded = bs58::decode(&public[1..]).into_vec().unwrap();
        assert_eq!(&decoded[..2], &MULTICODEC_P256_PUBLIC);
        assert_eq!(decoded.len(), 2 + 33);
    }

    #[test]
    fn wrapper_reports_suite_types() {
        let mut x = KeyAgreementKey::X25519(X25519Kak::generate());
        assert_eq!(x.key_type(), X25519_KEY_TYPE);
        x.set_id("urn:uuid:x");
        assert_eq!(x.id(), Some("urn:uuid:x"));

        let p = KeyAgreementKey::P256(P256Kak::generate());
        assert_eq!(p.key_type(), MULTIKEY_TYPE);
        assert!(p.id().is_none());
    }
}
