//! Ed25519 signatures over asset checksums.
//!
//! The signed message is the 32 raw bytes of the asset's SHA256 digest.
//! Ed25519 is deterministic, so signing the same content twice yields the
//! same signature; clients verify the reconstructed binary, never the patch.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use updraft_schema::Sha256Digest;

use crate::hashing::FileHashCache;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid Base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Expected a {expected}-byte {what}, got {actual} bytes")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid public key")]
    PublicKey,

    #[error("Failed to read key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Signature verification failed")]
    Mismatch,
}

fn decode_fixed<const N: usize>(b64: &str, what: &'static str) -> Result<[u8; N], SigningError> {
    let bytes = STANDARD.decode(b64.trim())?;
    bytes.as_slice().try_into().map_err(|_| SigningError::Length {
        what,
        expected: N,
        actual: bytes.len(),
    })
}

/// Signs asset checksums with the release key.
pub struct ReleaseSigner {
    key: SigningKey,
}

impl std::fmt::Debug for ReleaseSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseSigner")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

impl ReleaseSigner {
    /// Load a 32-byte Ed25519 secret key encoded as standard Base64.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError`] if the input is not Base64 or not 32 bytes.
    pub fn from_base64(secret_b64: &str) -> Result<Self, SigningError> {
        let key_arr = decode_fixed::<32>(secret_b64, "Ed25519 private key")?;
        Ok(Self {
            key: SigningKey::from_bytes(&key_arr),
        })
    }

    /// Load a Base64 secret key from a file (surrounding whitespace ignored).
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::KeyFile`] if the file cannot be read, or a
    /// decoding error as for [`from_base64`](Self::from_base64).
    pub fn from_file(path: &Path) -> Result<Self, SigningError> {
        let content = std::fs::read_to_string(path).map_err(|source| SigningError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_base64(&content)
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut secret_bytes);
        Self {
            key: SigningKey::from_bytes(&secret_bytes),
        }
    }

    /// Secret key as Base64, for writing a key file.
    pub fn secret_base64(&self) -> String {
        STANDARD.encode(self.key.to_bytes())
    }

    /// Public key as Base64, for embedding in clients.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.key.verifying_key().to_bytes())
    }

    /// Base64 signature over `checksum`.
    pub fn sign(&self, checksum: &Sha256Digest) -> String {
        STANDARD.encode(self.key.sign(&checksum.to_bytes()).to_bytes())
    }

    /// Check a signature produced by [`sign`](Self::sign) with this key.
    pub fn verify(&self, checksum: &Sha256Digest, signature_b64: &str) -> bool {
        verify_with(&self.key.verifying_key(), checksum, signature_b64).is_ok()
    }
}

fn verify_with(
    key: &VerifyingKey,
    checksum: &Sha256Digest,
    signature_b64: &str,
) -> Result<(), SigningError> {
    let sig = decode_fixed::<64>(signature_b64, "Ed25519 signature")?;
    key.verify(&checksum.to_bytes(), &Signature::from_bytes(&sig))
        .map_err(|_| SigningError::Mismatch)
}

/// The checksum clients verify for the file at `path`.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub async fn checksum_for_file(
    hashes: &FileHashCache,
    path: &Path,
) -> std::io::Result<Sha256Digest> {
    hashes.digest(path).await
}

/// Verify a signature against a Base64 public key, as a client would.
///
/// # Errors
///
/// Returns [`SigningError::Mismatch`] for a well-formed but wrong signature,
/// or a decoding error for malformed inputs.
pub fn verify_signature(
    public_key_b64: &str,
    checksum: &Sha256Digest,
    signature_b64: &str,
) -> Result<(), SigningError> {
    let public = decode_fixed::<32>(public_key_b64, "Ed25519 public key")?;
    let key = VerifyingKey::from_bytes(&public).map_err(|_| SigningError::PublicKey)?;
    verify_with(&key, checksum, signature_b64)
}
