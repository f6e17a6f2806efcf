//! CAS corruption must fail closed, at every layer a collaborator can
//! reach it from: directly, and through a request's staged inputs.

use detcore::cas::{CasError, Compression, ContentStore};

fn shard_path(root: &std::path::Path, hex: &str) -> std::path::PathBuf {
    root.join("objects").join(&hex[0..2]).join(&hex[2..4]).join(hex)
}

#[test]
fn flipped_byte_on_disk_is_detected_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(dir.path()).unwrap();

    let digest = store.put(b"known good payload", Compression::Identity).unwrap();
    assert!(store.get(&digest).is_ok());

    let path = shard_path(dir.path(), &digest.to_hex());
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let err = store.get(&digest).unwrap_err();
    assert!(matches!(err, CasError::IntegrityFailure { .. }));
}

#[test]
fn missing_object_is_reported_distinctly_from_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(dir.path()).unwrap();
    let bogus = detcore::hash::HashEngine::new().hash(b"never written");

    let err = store.get(&bogus).unwrap_err();
    assert!(matches!(err, CasError::MissingObject(_)));
}

#[test]
fn zstd_compression_never_changes_the_content_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(dir.path()).unwrap();
    let payload = b"compressible compressible compressible compressible payload";

    let identity_digest = store.put(payload, Compression::Identity).unwrap();
    let zstd_digest = store.put(payload, Compression::Zstd).unwrap();

    assert_eq!(identity_digest, zstd_digest);
    assert_eq!(store.get(&zstd_digest).unwrap(), payload);
}
