//! Persistence contract for resources and their versions.

pub mod sqlite;

use crate::models::{
    resource::{NewResource, NewVersion, Resource, Version},
    search::{SearchFilters, SearchResults},
};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("resource `{0}` not found")]
    ResourceNotFound(Uuid),
    #[error("version `{version}` already exists for resource `{resource_id}`")]
    DuplicateVersion { resource_id: Uuid, version: String },
    #[error("resource `{resource_id}` still has {remaining} version(s)")]
    VersionsRemaining { resource_id: Uuid, remaining: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Stores resources and versions and keeps the one-default-version rule.
///
/// Implementations must reject a second version with the same identifier
/// for one resource, and must keep exactly one default among the surviving
/// versions whenever versions are added or removed.
#[async_trait]
pub trait ResourceLedger: Send + Sync {
    /// Insert a resource row with no versions yet.
    async fn create(&self, resource: &NewResource) -> LedgerResult<Resource>;

    /// Append a version. With `make_default` the previous default is cleared
    /// in the same transaction. The first version of a resource always
    /// becomes the default.
    async fn add_version(
        &self,
        resource_id: Uuid,
        version: &NewVersion,
        make_default: bool,
    ) -> LedgerResult<Version>;

    /// Resource with `default_version` and `versions` populated.
    async fn get_by_id(&self, id: Uuid) -> LedgerResult<Option<Resource>>;

    async fn get_version(
        &self,
        resource_id: Uuid,
        version_identifier: &str,
    ) -> LedgerResult<Option<Version>>;

    async fn get_versions(&self, resource_id: Uuid) -> LedgerResult<Vec<Version>>;

    async fn get_version_names(&self, resource_id: Uuid) -> LedgerResult<Vec<String>>;

    async fn delete_version(
        &self,
        resource_id: Uuid,
        version_identifier: &str,
    ) -> LedgerResult<bool>;

    /// Remove the resource row. Fails with `VersionsRemaining` while any
    /// version still exists.
    async fn delete(&self, resource_id: Uuid) -> LedgerResult<bool>;

    /// Rename the default version's file and move its storage key to the
    /// renamed location. Other versions are untouched.
    async fn rename(&self, resource_id: Uuid, new_file_name: &str) -> LedgerResult<bool>;

    async fn search(&self, filters: &SearchFilters) -> LedgerResult<SearchResults>;

    /// Every resource matching the filters (no paging), for bulk download.
    async fn search_for_download(&self, filters: &SearchFilters) -> LedgerResult<Vec<Resource>>;
}
