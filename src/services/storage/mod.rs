//! Blob storage contract consumed by the resource manager.
//!
//! Backends address objects by opaque string keys. The manager builds keys
//! with [`storage_key_for`]; backends must treat them as paths relative to
//! their own root.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("invalid file name `{0}`")]
    InvalidName(String),
    #[error("shared link rejected: {0}")]
    InvalidLink(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Swappable blob store (local disk, object store, CDN-fronted store...).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store the local file at `source` under `key`. Returns the stored key.
    /// Fails with `AlreadyExists` rather than replace an existing object.
    async fn upload(&self, key: &str, source: &Path) -> BackendResult<String>;

    /// Copy the object to `destination`.
    ///
    /// If `destination` is an existing directory the object is written into
    /// it under the last segment of the key; otherwise `destination` is the
    /// target file path. Returns the written path.
    async fn download(&self, key: &str, destination: &Path) -> BackendResult<PathBuf>;

    /// Rename the object in place, keeping its parent prefix.
    /// The new key is [`renamed_key`]`(key, new_name)`. An occupied target
    /// fails with `AlreadyExists`.
    async fn rename(&self, key: &str, new_name: &str) -> BackendResult<bool>;

    /// Remove the object. `Ok(false)` means it was already absent.
    async fn delete(&self, key: &str) -> BackendResult<bool>;

    /// Issue a URL granting read access for `ttl_minutes`.
    async fn shareable_link(&self, key: &str, ttl_minutes: u32) -> BackendResult<String>;
}

/// `resources/<YYYY-MM-DD>/<file_name>`, dated by the upload instant (UTC).
pub fn storage_key_for(file_name: &str, at: DateTime<Utc>) -> String {
    format!("resources/{}/{}", at.format("%Y-%m-%d"), file_name)
}

/// Key an object ends up under after [`StorageBackend::rename`].
pub fn renamed_key(key: &str, new_name: &str) -> String {
    match key.rsplit_once('/') {
        Some((prefix, _)) => format!("{}/{}", prefix, new_name),
        None => new_name.to_string(),
    }
}

/// Last path segment of a key.
pub fn key_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// A file name must be a single, non-traversing path segment.
pub fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.bytes().any(|b| b.is_ascii_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn storage_key_uses_upload_date() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 23, 59, 1).unwrap();
        assert_eq!(
            storage_key_for("scan.png", at),
            "resources/2024-03-07/scan.png"
        );
    }

    #[test]
    fn renamed_key_keeps_prefix() {
        assert_eq!(
            renamed_key("resources/2024-03-07/scan.png", "report.png"),
            "resources/2024-03-07/report.png"
        );
        assert_eq!(renamed_key("scan.png", "report.png"), "report.png");
    }

    #[test]
    fn file_name_validation() {
        assert!(is_valid_file_name("report final.pdf"));
        assert!(!is_valid_file_name(""));
        assert!(!is_valid_file_name(".."));
        assert!(!is_valid_file_name("a/b.png"));
        assert!(!is_valid_file_name("a\\b.png"));
    }
}
