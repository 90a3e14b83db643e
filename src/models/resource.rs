//! Represents a logical file resource and its physical versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::path::PathBuf;
use uuid::Uuid;

/// A logical file identity, independent of where its bytes live.
///
/// A resource with at least one version always has exactly one default
/// version. The resource row itself carries no storage location; every
/// physical copy is a [`Version`].
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Resource {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// MIME type of the originally uploaded file.
    pub original_mime_type: Option<String>,

    /// Whether the resource may be served without restriction.
    pub is_public_resource: bool,

    /// Whether thumbnail/preview renditions were produced on upload.
    pub is_multi_resolution_image: bool,

    /// When the resource row was created.
    pub created_at: DateTime<Utc>,

    /// The version served when no specific version is requested.
    #[sqlx(skip)]
    pub default_version: Option<Version>,

    /// All versions in insertion order.
    #[sqlx(skip)]
    pub versions: Vec<Version>,
}

/// One physical rendition of a resource.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Version {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Owning resource.
    pub resource_id: Uuid,

    /// Identifier unique within the resource ("1", "2", "1:Thumbnail", ...).
    pub version_identifier: String,

    /// Stored file name (last segment of the storage key).
    pub file_name: String,

    /// Name of the file as supplied by the uploader.
    pub original_name: String,

    pub mime_type: Option<String>,

    /// Size in kilobytes (bytes / 1024).
    pub size_kb: f64,

    /// Location in the storage backend. Only set after a successful upload.
    pub storage_key: Option<String>,

    pub is_default: bool,

    pub created_at: DateTime<Utc>,
}

/// Describes one local file that is about to become a version.
#[derive(Clone, Debug)]
pub struct FileMetadata {
    /// Requested identifier; generated when `None`.
    pub version_identifier: Option<String>,
    pub file_name: String,
    pub original_name: String,
    pub source_file_path: PathBuf,
    pub mime_type: Option<String>,
    pub size_kb: f64,
}

impl FileMetadata {
    /// Build metadata for a file that already sits on local disk.
    ///
    /// Mime type is guessed from the extension, size is read from the
    /// filesystem.
    pub async fn from_local_file(
        path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        original_name: impl Into<String>,
    ) -> std::io::Result<Self> {
        let source_file_path = path.into();
        let stat = tokio::fs::metadata(&source_file_path).await?;
        let mime_type = mime_guess::from_path(&source_file_path)
            .first()
            .map(|m| m.essence_str().to_string());
        Ok(Self {
            version_identifier: None,
            file_name: file_name.into(),
            original_name: original_name.into(),
            source_file_path,
            mime_type,
            size_kb: stat.len() as f64 / 1024.0,
        })
    }
}

/// Request to create a brand new resource from one uploaded file.
#[derive(Clone, Debug)]
pub struct UploadSpec {
    pub file: FileMetadata,
    pub is_multi_resolution_image: bool,
    pub is_public_resource: bool,
}

/// Row values for a new resource.
#[derive(Clone, Debug)]
pub struct NewResource {
    pub original_mime_type: Option<String>,
    pub is_public_resource: bool,
    pub is_multi_resolution_image: bool,
}

/// Row values for a new version. `storage_key` must point at an object the
/// backend has already accepted.
#[derive(Clone, Debug)]
pub struct NewVersion {
    pub version_identifier: String,
    pub file_name: String,
    pub original_name: String,
    pub mime_type: Option<String>,
    pub size_kb: f64,
    pub storage_key: String,
}

impl NewVersion {
    pub fn from_metadata(
        metadata: &FileMetadata,
        version_identifier: impl Into<String>,
        storage_key: impl Into<String>,
    ) -> Self {
        Self {
            version_identifier: version_identifier.into(),
            file_name: metadata.file_name.clone(),
            original_name: metadata.original_name.clone(),
            mime_type: metadata.mime_type.clone(),
            size_kb: metadata.size_kb,
            storage_key: storage_key.into(),
        }
    }
}
