//! Server-side photo object storage.
//!
//! Objects are stored on disk, one directory per photo:
//! ```text
//! <DATA_DIR>/
//!   <photo_id>/
//!     main.jpg
//!     thumb.jpg
//! ```
//!
//! Access from outside goes through time-limited signed URLs; the signature
//! covers the photo id, the object kind, and the expiry.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::PathBuf;
use uuid::Uuid;

/// The two objects stored per photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoKind {
    Main,
    Thumbnail,
}

impl PhotoKind {
    pub fn filename(&self) -> &'static str {
        match self {
            PhotoKind::Main => "main.jpg",
            PhotoKind::Thumbnail => "thumb.jpg",
        }
    }

    /// The storage key exposed on the wire.
    pub fn key(&self, photo_id: Uuid) -> String {
        format!("{}/{}", photo_id, self.filename())
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "main" => Some(PhotoKind::Main),
            "thumbnail" | "thumb" => Some(PhotoKind::Thumbnail),
            _ => None,
        }
    }
}

impl fmt::Display for PhotoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhotoKind::Main => write!(f, "main"),
            PhotoKind::Thumbnail => write!(f, "thumbnail"),
        }
    }
}

#[derive(Debug)]
pub enum PhotoStoreError {
    IoError(PathBuf, io::Error),
}

impl fmt::Display for PhotoStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhotoStoreError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for PhotoStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PhotoStoreError::IoError(_, e) => Some(e),
        }
    }
}

/// Disk-backed object store for uploaded photos.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    data_dir: PathBuf,
}

impl PhotoStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn object_path(&self, photo_id: Uuid, kind: PhotoKind) -> PathBuf {
        // Uuid-typed ids cannot traverse paths.
        self.data_dir
            .join(photo_id.to_string())
            .join(kind.filename())
    }

    /// Writes one object and returns its wire key.
    pub fn store(
        &self,
        photo_id: Uuid,
        kind: PhotoKind,
        bytes: &[u8],
    ) -> Result<String, PhotoStoreError> {
        let path = self.object_path(photo_id, kind);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PhotoStoreError::IoError(parent.to_path_buf(), e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| PhotoStoreError::IoError(path.clone(), e))?;
        Ok(kind.key(photo_id))
    }

    pub fn load(&self, photo_id: Uuid, kind: PhotoKind) -> Result<Option<Vec<u8>>, PhotoStoreError> {
        let path = self.object_path(photo_id, kind);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PhotoStoreError::IoError(path, e)),
        }
    }

    /// Removes both objects for a photo. Returns whether anything existed.
    pub fn delete_all(&self, photo_id: Uuid) -> Result<bool, PhotoStoreError> {
        let dir = self.data_dir.join(photo_id.to_string());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PhotoStoreError::IoError(dir, e)),
        }
    }
}

/// Signature for a time-limited photo URL: sha256 over secret, photo id,
/// object kind, and expiry epoch seconds, hex encoded.
pub fn sign_access(secret: &str, photo_id: Uuid, kind: PhotoKind, expires: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(photo_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(kind.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(expires.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Validates a presented signature against the expected one and the clock.
pub fn verify_access(
    secret: &str,
    photo_id: Uuid,
    kind: PhotoKind,
    expires: i64,
    signature: &str,
    now_epoch: i64,
) -> bool {
    if expires < now_epoch {
        return false;
    }
    let expected = sign_access(secret, photo_id, kind, expires);
    // Constant-time-ish comparison; both sides are fixed-length hex.
    expected.len() == signature.len()
        && expected
            .bytes()
            .zip(signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_load_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let store = PhotoStore::new(dir.path());
        let photo_id = Uuid::new_v4();

        let key = store
            .store(photo_id, PhotoKind::Main, b"main bytes")
            .unwrap();
        assert_eq!(key, format!("{}/main.jpg", photo_id));
        store
            .store(photo_id, PhotoKind::Thumbnail, b"thumb bytes")
            .unwrap();

        assert_eq!(
            store.load(photo_id, PhotoKind::Main).unwrap().unwrap(),
            b"main bytes"
        );
        assert_eq!(
            store.load(photo_id, PhotoKind::Thumbnail).unwrap().unwrap(),
            b"thumb bytes"
        );

        assert!(store.delete_all(photo_id).unwrap());
        assert!(store.load(photo_id, PhotoKind::Main).unwrap().is_none());
        // Deleting again reports nothing existed.
        assert!(!store.delete_all(photo_id).unwrap());
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = PhotoStore::new(dir.path());
        assert!(store
            .load(Uuid::new_v4(), PhotoKind::Main)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(PhotoKind::parse("main"), Some(PhotoKind::Main));
        assert_eq!(PhotoKind::parse("Thumbnail"), Some(PhotoKind::Thumbnail));
        assert_eq!(PhotoKind::parse("original"), None);
    }

    #[test]
    fn test_signature_verifies_and_expires() {
        let photo_id = Uuid::new_v4();
        let sig = sign_access("secret", photo_id, PhotoKind::Main, 1_000);

        assert!(verify_access("secret", photo_id, PhotoKind::Main, 1_000, &sig, 999));
        // Expired.
        assert!(!verify_access("secret", photo_id, PhotoKind::Main, 1_000, &sig, 1_001));
        // Wrong kind, key, or secret.
        assert!(!verify_access("secret", photo_id, PhotoKind::Thumbnail, 1_000, &sig, 999));
        assert!(!verify_access("other", photo_id, PhotoKind::Main, 1_000, &sig, 999));
        assert!(!verify_access("secret", Uuid::new_v4(), PhotoKind::Main, 1_000, &sig, 999));
        // Tampered expiry.
        assert!(!verify_access("secret", photo_id, PhotoKind::Main, 2_000, &sig, 999));
    }
}
