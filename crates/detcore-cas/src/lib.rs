//! Content-addressed blob store.
//!
//! Objects live at `objects/<d[0..2]>/<d[2..4]>/<d>` under the store root,
//! where `d` is the 64-hex content digest — a two-level shard that caps
//! directory fan-out, mirroring the layout conventions in the teacher's
//! `storage` crate generalized to a filesystem backend. Every write goes
//! through a temp file in the same directory, is fsynced, then renamed
//! into place, so no partial object is ever observable (crash-safety is
//! the defining property of [`ContentStore::put_atomic`]).

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use detcore_hash::{domains, Digest, HashEngine, Incremental};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Store layout version. Any change to sharding depth, metadata layout, or
/// digest domain requires bumping this and documenting a migration.
pub const FORMAT_VERSION: &str = "v2";

#[derive(Error, Debug)]
pub enum CasError {
    #[error("object not found: {0}")]
    MissingObject(String),
    #[error("integrity check failed for {digest}: {reason}")]
    IntegrityFailure { digest: String, reason: String },
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("gc conflict on {0}: ref-count changed during collection")]
    GcConflict(String),
}

impl CasError {
    pub fn code(&self) -> &'static str {
        match self {
            CasError::MissingObject(_) => "cas_missing_object",
            CasError::IntegrityFailure { .. } => "cas_integrity_failure",
            CasError::WriteFailed(_) => "cas_write_failed",
            CasError::GcConflict(_) => "cas_gc_conflict",
        }
    }
}

/// Compression applied to the on-disk bytes. The CAS key is always the
/// digest of the *uncompressed* content, regardless of this choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Identity,
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMeta {
    compression: Compression,
    size: u64,
    stored_blob_digest: String,
    created_at: DateTime<Utc>,
    ref_count: u64,
}

/// A loaded CAS object's public metadata.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub content_digest: Digest,
    pub compression: Compression,
    pub size: u64,
    pub stored_blob_digest: Digest,
    pub created_at: DateTime<Utc>,
    pub ref_count: u64,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub checked: usize,
    pub failures: Vec<Digest>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub executed: bool,
    pub removed: Vec<Digest>,
    pub conflicts: Vec<Digest>,
}

/// The content-addressed store.
pub struct ContentStore {
    root: PathBuf,
    hash: HashEngine,
    /// Coarse write lock: makes `put`/`put_atomic` linearizable per digest
    /// and excludes `gc` from observing a half-written object. A single
    /// lock is sufficient here; the engine's concurrency model (§5) calls
    /// for correctness, not fine-grained striping.
    write_lock: Mutex<()>,
    gc_generation: AtomicU64,
}

impl ContentStore {
    /// Open (creating if absent) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CasError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects"))
            .map_err(|e| CasError::WriteFailed(e.to_string()))?;
        fs::create_dir_all(root.join("tmp")).map_err(|e| CasError::WriteFailed(e.to_string()))?;
        let marker = root.join("VERSION");
        if !marker.exists() {
            atomic_write(&root.join("tmp"), &marker, FORMAT_VERSION.as_bytes())
                .map_err(|e| CasError::WriteFailed(e.to_string()))?;
        }
        Ok(Self {
            root,
            hash: HashEngine::new(),
            write_lock: Mutex::new(()),
            gc_generation: AtomicU64::new(0),
        })
    }

    fn shard_dir(&self, digest_hex: &str) -> PathBuf {
        self.root
            .join("objects")
            .join(&digest_hex[0..2])
            .join(&digest_hex[2..4])
    }

    fn object_path(&self, digest_hex: &str) -> PathBuf {
        self.shard_dir(digest_hex).join(digest_hex)
    }

    fn meta_path(&self, digest_hex: &str) -> PathBuf {
        self.shard_dir(digest_hex).join(format!("{digest_hex}.meta.json"))
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path(&digest.to_hex()).exists()
    }

    /// Idempotent insert. Returns the existing digest if content is
    /// already present (still bumping the reference count).
    pub fn put(&self, bytes: &[u8], compression: Compression) -> Result<Digest, CasError> {
        self.put_atomic(bytes, compression)
    }

    /// Crash-safe insert: stage to a temp file in the same filesystem,
    /// fsync, then rename into place. No partial object is ever
    /// observable by a concurrent reader.
    pub fn put_atomic(&self, bytes: &[u8], compression: Compression) -> Result<Digest, CasError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");

        let content_digest = self.hash.hash_domain(domains::CAS, bytes);
        let hex = content_digest.to_hex();
        let shard = self.shard_dir(&hex);
        fs::create_dir_all(&shard).map_err(|e| CasError::WriteFailed(e.to_string()))?;

        let stored_bytes = match compression {
            Compression::Identity => bytes.to_vec(),
            Compression::Zstd => zstd::encode_all(bytes, 0)
                .map_err(|e| CasError::WriteFailed(format!("zstd encode failed: {e}")))?,
        };
        let stored_blob_digest = self.hash.hash_domain(domains::CAS, &stored_bytes);

        let object_path = self.object_path(&hex);
        let meta_path = self.meta_path(&hex);

        if object_path.exists() {
            // Idempotent re-insert: bump the reference count in place.
            self.bump_ref_count(&meta_path, 1)?;
            debug!(digest = %hex, "cas put: object already present, ref-count bumped");
            return Ok(content_digest);
        }

        let tmp_dir = self.root.join("tmp");
        atomic_write(&tmp_dir, &object_path, &stored_bytes)
            .map_err(|e| CasError::WriteFailed(e.to_string()))?;

        let meta = ObjectMeta {
            compression,
            size: bytes.len() as u64,
            stored_blob_digest: stored_blob_digest.to_hex(),
            created_at: Utc::now(),
            ref_count: 1,
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| CasError::WriteFailed(format!("meta serialize failed: {e}")))?;
        atomic_write(&tmp_dir, &meta_path, &meta_bytes)
            .map_err(|e| CasError::WriteFailed(e.to_string()))?;

        debug!(digest = %hex, size = bytes.len(), "cas put: new object written");
        Ok(content_digest)
    }

    /// Insert the file at `path` by streaming it once: [`Incremental`]
    /// folds 64 KiB chunks into the content digest while the same chunks
    /// are copied into the temp file, so a large insert never holds the
    /// whole file in one in-memory buffer the way `put_atomic` does.
    /// Identity compression only — a compressed insert needs the whole
    /// buffer for `zstd::encode_all` anyway, so it goes through
    /// `put_atomic` instead.
    pub fn put_path(&self, path: &Path) -> Result<Digest, CasError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");

        let tmp_dir = self.root.join("tmp");
        fs::create_dir_all(&tmp_dir).map_err(|e| CasError::WriteFailed(e.to_string()))?;
        let tmp_path = tmp_dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let mut incremental = Incremental::new_domain(domains::CAS);
        let mut size = 0u64;
        {
            let mut src =
                File::open(path).map_err(|e| CasError::WriteFailed(e.to_string()))?;
            let mut dst =
                File::create(&tmp_path).map_err(|e| CasError::WriteFailed(e.to_string()))?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = src
                    .read(&mut buf)
                    .map_err(|e| CasError::WriteFailed(e.to_string()))?;
                if n == 0 {
                    break;
                }
                incremental.update(&buf[..n]);
                dst.write_all(&buf[..n])
                    .map_err(|e| CasError::WriteFailed(e.to_string()))?;
                size += n as u64;
            }
            dst.sync_all().map_err(|e| CasError::WriteFailed(e.to_string()))?;
        }

        let content_digest = incremental.finalize();
        let hex = content_digest.to_hex();
        let shard = self.shard_dir(&hex);
        fs::create_dir_all(&shard).map_err(|e| CasError::WriteFailed(e.to_string()))?;

        let object_path = self.object_path(&hex);
        let meta_path = self.meta_path(&hex);

        if object_path.exists() {
            let _ = fs::remove_file(&tmp_path);
            self.bump_ref_count(&meta_path, 1)?;
            debug!(digest = %hex, "cas put_path: object already present, ref-count bumped");
            return Ok(content_digest);
        }

        fs::rename(&tmp_path, &object_path).map_err(|e| CasError::WriteFailed(e.to_string()))?;

        let meta = ObjectMeta {
            compression: Compression::Identity,
            size,
            stored_blob_digest: hex.clone(),
            created_at: Utc::now(),
            ref_count: 1,
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| CasError::WriteFailed(format!("meta serialize failed: {e}")))?;
        atomic_write(&tmp_dir, &meta_path, &meta_bytes)
            .map_err(|e| CasError::WriteFailed(e.to_string()))?;

        debug!(digest = %hex, size, "cas put_path: new object written via streaming");
        Ok(content_digest)
    }

    fn bump_ref_count(&self, meta_path: &Path, delta: i64) -> Result<(), CasError> {
        let mut meta = read_meta(meta_path)?;
        meta.ref_count = (meta.ref_count as i64 + delta).max(0) as u64;
        let tmp_dir = self.root.join("tmp");
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| CasError::WriteFailed(format!("meta serialize failed: {e}")))?;
        atomic_write(&tmp_dir, meta_path, &meta_bytes)
            .map_err(|e| CasError::WriteFailed(e.to_string()))
    }

    /// Decrement the reference count for `digest`, e.g. when the result
    /// record referencing it is deleted. Never errors if the object is
    /// already absent (a no-op).
    pub fn dec_ref(&self, digest: &Digest) -> Result<(), CasError> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let hex = digest.to_hex();
        let meta_path = self.meta_path(&hex);
        if !meta_path.exists() {
            return Ok(());
        }
        self.bump_ref_count(&meta_path, -1)
    }

    /// Read an object back, verifying the on-disk bytes against the
    /// recorded stored-blob digest before decompressing.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>, CasError> {
        let hex = digest.to_hex();
        let object_path = self.object_path(&hex);
        let meta_path = self.meta_path(&hex);

        if !object_path.exists() {
            return Err(CasError::MissingObject(hex));
        }
        let meta = read_meta(&meta_path)?;

        let mut stored_bytes = Vec::new();
        File::open(&object_path)
            .and_then(|mut f| f.read_to_end(&mut stored_bytes))
            .map_err(|e| CasError::WriteFailed(e.to_string()))?;

        let actual_stored_digest = self.hash.hash_domain(domains::CAS, &stored_bytes);
        if actual_stored_digest.to_hex() != meta.stored_blob_digest {
            warn!(digest = %hex, "cas get: stored-blob digest mismatch, object is corrupt");
            return Err(CasError::IntegrityFailure {
                digest: hex,
                reason: "stored-blob digest mismatch".into(),
            });
        }

        let content = match meta.compression {
            Compression::Identity => stored_bytes,
            Compression::Zstd => zstd::decode_all(stored_bytes.as_slice())
                .map_err(|e| CasError::WriteFailed(format!("zstd decode failed: {e}")))?,
        };

        let actual_content_digest = self.hash.hash_domain(domains::CAS, &content);
        if actual_content_digest != *digest {
            return Err(CasError::IntegrityFailure {
                digest: hex,
                reason: "decompressed content does not match content digest".into(),
            });
        }

        Ok(content)
    }

    pub fn info(&self, digest: &Digest) -> Result<ObjectInfo, CasError> {
        let hex = digest.to_hex();
        let meta_path = self.meta_path(&hex);
        if !meta_path.exists() {
            return Err(CasError::MissingObject(hex));
        }
        let meta = read_meta(&meta_path)?;
        Ok(ObjectInfo {
            content_digest: *digest,
            compression: meta.compression,
            size: meta.size,
            stored_blob_digest: Digest::from_hex(&meta.stored_blob_digest)
                .map_err(|e| CasError::WriteFailed(e.to_string()))?,
            created_at: meta.created_at,
            ref_count: meta.ref_count,
        })
    }

    fn all_digests(&self) -> Vec<Digest> {
        let objects_dir = self.root.join("objects");
        walkdir::WalkDir::new(objects_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if name.ends_with(".meta.json") {
                    return None;
                }
                Digest::from_hex(&name).ok()
            })
            .collect()
    }

    /// Sample `n` objects uniformly and verify content integrity
    /// end-to-end via [`ContentStore::get`].
    pub fn verify(&self, sample_n: usize) -> VerifyReport {
        let all = self.all_digests();
        let mut rng = rand::thread_rng();
        let sample: Vec<Digest> = all.into_iter().choose_multiple(&mut rng, sample_n);
        let mut failures = Vec::new();
        for digest in &sample {
            if self.get(digest).is_err() {
                failures.push(*digest);
            }
        }
        VerifyReport {
            checked: sample.len(),
            failures,
        }
    }

    /// Objects whose reference count has dropped to zero.
    pub fn find_gc_candidates(&self) -> Vec<Digest> {
        self.all_digests()
            .into_iter()
            .filter(|d| {
                self.info(d)
                    .map(|info| info.ref_count == 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Collect the given digests. In dry-run mode (`execute: false`) only
    /// reports what would be removed. Takes the write lock for the whole
    /// pass so `put` never observes a half-deleted object.
    pub fn gc(&self, digests: &[Digest], execute: bool) -> GcReport {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let generation = self.gc_generation.fetch_add(1, Ordering::SeqCst);
        let mut report = GcReport {
            executed: execute,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for digest in digests {
            if !seen.insert(*digest) {
                continue;
            }
            let info = match self.info(digest) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if info.ref_count != 0 {
                report.conflicts.push(*digest);
                continue;
            }
            if execute {
                let hex = digest.to_hex();
                let _ = fs::remove_file(self.object_path(&hex));
                let _ = fs::remove_file(self.meta_path(&hex));
                append_journal(&self.root, &hex, generation);
            }
            report.removed.push(*digest);
        }
        report
    }
}

fn read_meta(meta_path: &Path) -> Result<ObjectMeta, CasError> {
    let bytes = fs::read(meta_path).map_err(|e| {
        CasError::IntegrityFailure {
            digest: meta_path.display().to_string(),
            reason: format!("missing or unreadable metadata: {e}"),
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|e| CasError::IntegrityFailure {
        digest: meta_path.display().to_string(),
        reason: format!("corrupt metadata: {e}"),
    })
}

fn append_journal(root: &Path, digest_hex: &str, generation: u64) {
    let journal_path = root.join("gc.journal");
    if let Ok(mut f) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal_path)
    {
        let _ = writeln!(f, "{generation}\t{digest_hex}\t{}", Utc::now().to_rfc3339());
    }
}

/// Write `bytes` to a temp file in `tmp_dir`, fsync it, then rename it
/// into `final_path`. `tmp_dir` must be on the same filesystem as
/// `final_path` for the rename to be atomic.
fn atomic_write(tmp_dir: &Path, final_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(tmp_dir)?;
    let tmp_path = tmp_dir.join(format!(".tmp-{}", Uuid::new_v4()));
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, final_path)?;
    Ok(())
}
