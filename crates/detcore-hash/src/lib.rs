//! Domain-separated cryptographic hash primitive.
//!
//! Every digest in the engine flows through this crate. The reference
//! algorithm is BLAKE3; an operator may opt in to a SHA-256 fallback only
//! via [`HashEngine::with_fallback`], which raises a `compat_warning` on
//! every digest it produces. There is no silent algorithm substitution.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed ASCII domain prefixes, concatenated with a `\0` separator before
/// hashing. Changing any of these is a contract-version bump.
pub mod domains {
    pub const REQUEST: &str = "req:";
    pub const RESULT: &str = "res:";
    pub const CAS: &str = "cas:";
    pub const POLICY: &str = "pol:";
    pub const PROOF_BUNDLE: &str = "pb:";
}

#[derive(Error, Debug)]
pub enum HashError {
    #[error("hash primitive unavailable: {0}")]
    HashUnavailable(String),
    #[error("io error hashing file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl HashError {
    pub fn code(&self) -> &'static str {
        match self {
            HashError::HashUnavailable(_) => "hash_unavailable",
            HashError::Io { .. } => "hash_unavailable",
        }
    }
}

/// A fixed 32-byte digest, rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(s)
            .map_err(|e| HashError::HashUnavailable(format!("invalid hex digest: {e}")))?;
        if bytes.len() != 32 {
            return Err(HashError::HashUnavailable(format!(
                "expected 32-byte digest, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Digest(out))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Known-good test vectors checked at engine startup and in `doctor`.
const VECTOR_EMPTY: &str = "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262";
const VECTOR_HELLO: &str = "ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f";

/// Which algorithm backs a given [`HashEngine`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Blake3,
    Sha256Fallback,
}

/// The hash engine. Stateless beyond its chosen backend; safe to share
/// across threads (no interior mutability, no global state).
#[derive(Debug, Clone, Copy)]
pub struct HashEngine {
    backend: Backend,
}

impl Default for HashEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HashEngine {
    /// The reference engine: BLAKE3, fail-closed if self-test vectors
    /// don't match.
    pub fn new() -> Self {
        Self {
            backend: Backend::Blake3,
        }
    }

    /// Opt in to a SHA-256 fallback. Every digest computed by the returned
    /// engine carries a `compat_warning`; see [`HashEngine::compat_warning`].
    pub fn with_fallback() -> Self {
        Self {
            backend: Backend::Sha256Fallback,
        }
    }

    pub fn compat_warning(&self) -> bool {
        self.backend == Backend::Sha256Fallback
    }

    /// Run the build-time self-test vectors. Returns `Err` if the backend
    /// does not reproduce the published outputs.
    pub fn self_test(&self) -> Result<(), HashError> {
        if self.backend == Backend::Sha256Fallback {
            // Fallback backend is explicitly opted into; vectors are
            // BLAKE3-specific and not expected to match, so self-test is
            // skipped for it, but it must never claim to be the primary
            // algorithm.
            return Ok(());
        }
        let empty = self.hash(b"");
        if empty.to_hex() != VECTOR_EMPTY {
            return Err(HashError::HashUnavailable(
                "empty-input vector mismatch".into(),
            ));
        }
        let hello = self.hash(b"hello");
        if hello.to_hex() != VECTOR_HELLO {
            return Err(HashError::HashUnavailable(
                "'hello' vector mismatch".into(),
            ));
        }
        Ok(())
    }

    /// Primitive hash of raw bytes.
    pub fn hash(&self, bytes: &[u8]) -> Digest {
        match self.backend {
            Backend::Blake3 => Digest(*blake3::hash(bytes).as_bytes()),
            Backend::Sha256Fallback => {
                use sha2::Digest as _;
                let mut hasher = sha2::Sha256::new();
                hasher.update(bytes);
                let out: [u8; 32] = hasher.finalize().into();
                Digest(out)
            }
        }
    }

    /// `hash(prefix_bytes || 0x00 || bytes)` under a fixed ASCII domain.
    pub fn hash_domain(&self, prefix: &str, bytes: &[u8]) -> Digest {
        match self.backend {
            Backend::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(prefix.as_bytes());
                hasher.update(&[0u8]);
                hasher.update(bytes);
                Digest(*hasher.finalize().as_bytes())
            }
            Backend::Sha256Fallback => {
                use sha2::Digest as _;
                let mut hasher = sha2::Sha256::new();
                hasher.update(prefix.as_bytes());
                hasher.update([0u8]);
                hasher.update(bytes);
                let out: [u8; 32] = hasher.finalize().into();
                Digest(out)
            }
        }
    }

    /// Stream a file's bytes through the CAS domain without buffering the
    /// whole file in memory twice.
    pub fn hash_file(&self, path: &Path) -> Result<Digest, HashError> {
        let mut file = std::fs::File::open(path).map_err(|e| HashError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut buf = [0u8; 64 * 1024];
        match self.backend {
            Backend::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(domains::CAS.as_bytes());
                hasher.update(&[0u8]);
                loop {
                    let n = file.read(&mut buf).map_err(|e| HashError::Io {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(Digest(*hasher.finalize().as_bytes()))
            }
            Backend::Sha256Fallback => {
                use sha2::Digest as _;
                let mut hasher = sha2::Sha256::new();
                hasher.update(domains::CAS.as_bytes());
                hasher.update([0u8]);
                loop {
                    let n = file.read(&mut buf).map_err(|e| HashError::Io {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                let out: [u8; 32] = hasher.finalize().into();
                Ok(Digest(out))
            }
        }
    }
}

/// Incremental hasher for large inputs, mirroring the teacher's
/// `HashEngine::incremental_hash`/`finalize_hash` pair. Only available on
/// the BLAKE3 backend; the fallback path hashes single-shot.
pub struct Incremental {
    hasher: blake3::Hasher,
}

impl Incremental {
    pub fn new_domain(prefix: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(prefix.as_bytes());
        hasher.update(&[0u8]);
        Self { hasher }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn finalize(&self) -> Digest {
        Digest(*self.hasher.finalize().as_bytes())
    }
}
