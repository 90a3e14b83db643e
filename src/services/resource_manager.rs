//! src/services/resource_manager.rs
//!
//! FileResourceManager - orchestrates the ledger, the blob store and the
//! rendition generator. Multi-step writes register compensations as they go
//! so a failure part-way through leaves neither ledger rows nor stored
//! objects behind.

use crate::{
    config::{MultiResolutionPolicy, ResourceConfig},
    models::{
        resource::{FileMetadata, NewResource, NewVersion, Resource, UploadSpec, Version},
        search::{SearchFilters, SearchResults},
    },
    services::{
        cleanup::{CleanupReport, cleanup_directory},
        compensation::Compensations,
        ledger::{LedgerError, ResourceLedger},
        renditions::{RenditionError, RenditionGenerator, is_supported_image_type},
        staging::create_staging_dir,
        storage::{
            BackendError, StorageBackend, is_valid_file_name, key_file_name, renamed_key,
            storage_key_for,
        },
    },
};
use chrono::Utc;
use std::{
    error::Error as StdError,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of the version created by `upload`.
pub const DEFAULT_VERSION: &str = "1";

const MAX_VERSION_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("file resource `{0}` not found")]
    ResourceNotFound(Uuid),
    #[error("version `{version}` of file resource `{resource_id}` not found")]
    VersionNotFound { resource_id: Uuid, version: String },
    #[error("multi-resolution images are not supported for `{0}`")]
    UnsupportedMediaType(String),
    #[error("{context}: {source}")]
    BackendFailure {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("file resource `{resource_id}`: {reason}")]
    IntegrityViolation { resource_id: Uuid, reason: String },
    #[error("{0}")]
    Validation(String),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

impl ResourceError {
    fn backend(context: impl Into<String>, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        ResourceError::BackendFailure {
            context: context.into(),
            source: source.into(),
        }
    }

    fn integrity(resource_id: Uuid, reason: impl Into<String>) -> Self {
        ResourceError::IntegrityViolation {
            resource_id,
            reason: reason.into(),
        }
    }

    fn from_ledger(context: impl Into<String>, err: LedgerError) -> Self {
        match err {
            LedgerError::ResourceNotFound(id) => ResourceError::ResourceNotFound(id),
            LedgerError::DuplicateVersion {
                resource_id,
                version,
            } => ResourceError::integrity(
                resource_id,
                format!("version `{}` already exists", version),
            ),
            LedgerError::VersionsRemaining {
                resource_id,
                remaining,
            } => ResourceError::integrity(
                resource_id,
                format!("{} version(s) still reference this resource", remaining),
            ),
            other => ResourceError::backend(context, other),
        }
    }

    fn from_storage(resource_id: Uuid, context: impl Into<String>, err: BackendError) -> Self {
        match err {
            BackendError::NotFound(key) => ResourceError::integrity(
                resource_id,
                format!("stored object `{}` is missing", key),
            ),
            BackendError::InvalidName(name) => {
                ResourceError::Validation(format!("invalid file name `{}`", name))
            }
            BackendError::InvalidKey(key) => {
                ResourceError::Validation(format!("invalid storage key `{}`", key))
            }
            BackendError::AlreadyExists(key) => {
                ResourceError::Validation(format!("storage key `{}` is already in use", key))
            }
            other => ResourceError::backend(
                format!("{} (resource {})", context.into(), resource_id),
                other,
            ),
        }
    }
}

#[derive(Clone)]
pub struct FileResourceManager {
    ledger: Arc<dyn ResourceLedger>,
    storage: Arc<dyn StorageBackend>,
    renditions: RenditionGenerator,
    config: ResourceConfig,
}

impl FileResourceManager {
    pub fn new(
        ledger: Arc<dyn ResourceLedger>,
        storage: Arc<dyn StorageBackend>,
        config: ResourceConfig,
    ) -> Self {
        Self {
            ledger,
            storage,
            renditions: RenditionGenerator::default(),
            config,
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Create a resource from one uploaded file.
    ///
    /// The default version "1" is always stored first. Multi-resolution
    /// uploads of supported raster types also get "1:Thumbnail" and
    /// "1:Preview". Any failure unwinds every step already taken.
    pub async fn upload(&self, spec: UploadSpec) -> ResourceResult<Resource> {
        validate_metadata(&spec.file).await?;

        let mut multi_resolution = spec.is_multi_resolution_image;
        if multi_resolution && !is_supported_image_type(spec.file.mime_type.as_deref()) {
            let mime = spec
                .file
                .mime_type
                .clone()
                .unwrap_or_else(|| "unknown".into());
            match self.config.multi_resolution_policy {
                MultiResolutionPolicy::Reject => {
                    return Err(ResourceError::UnsupportedMediaType(mime));
                }
                MultiResolutionPolicy::Warn => {
                    warn!(
                        "multi-resolution image type `{}` is not supported; storing original only",
                        mime
                    );
                    multi_resolution = false;
                }
            }
        }

        let mut undo = Compensations::new();
        match self.upload_steps(&spec, multi_resolution, &mut undo).await {
            Ok(resource) => {
                undo.commit();
                info!(
                    resource_id = %resource.id,
                    versions = resource.versions.len(),
                    "uploaded file resource"
                );
                Ok(resource)
            }
            Err(err) => {
                self.rollback(undo, &err).await;
                Err(err)
            }
        }
    }

    async fn upload_steps(
        &self,
        spec: &UploadSpec,
        multi_resolution: bool,
        undo: &mut Compensations,
    ) -> ResourceResult<Resource> {
        let mut resource = self.create_resource(spec, multi_resolution, undo).await?;

        let key = storage_key_for(&spec.file.file_name, Utc::now());
        let default = self
            .store_version(resource.id, &spec.file, DEFAULT_VERSION, key, true, undo)
            .await?;
        let mut versions = vec![default.clone()];

        if multi_resolution {
            let renditions = self
                .renditions
                .generate(&spec.file.source_file_path, DEFAULT_VERSION)
                .await
                .map_err(|err| match err {
                    RenditionError::Image(e) => {
                        ResourceError::Validation(format!("cannot decode image: {}", e))
                    }
                    other => ResourceError::backend(
                        format!("generating renditions for resource {}", resource.id),
                        other,
                    ),
                })?;

            let mut stored = Ok(());
            for rendition in &renditions {
                let metadata = FileMetadata {
                    version_identifier: Some(rendition.version_identifier.clone()),
                    file_name: rendition.file_name.clone(),
                    original_name: spec.file.original_name.clone(),
                    source_file_path: rendition.path.clone(),
                    mime_type: rendition.mime_type.clone(),
                    size_kb: rendition.size_kb,
                };
                let key = storage_key_for(&metadata.file_name, Utc::now());
                match self
                    .store_version(
                        resource.id,
                        &metadata,
                        &rendition.version_identifier,
                        key,
                        false,
                        undo,
                    )
                    .await
                {
                    Ok(version) => versions.push(version),
                    Err(err) => {
                        stored = Err(err);
                        break;
                    }
                }
            }

            for rendition in &renditions {
                if let Err(err) = fs::remove_file(&rendition.path).await {
                    debug!("could not remove {}: {}", rendition.path.display(), err);
                }
            }
            stored?;
        }

        resource.default_version = Some(default);
        resource.versions = versions;
        Ok(resource)
    }

    /// Store an existing local file under an explicit storage key as a new
    /// single-version resource.
    pub async fn upload_local(
        &self,
        source: &Path,
        storage_key: &str,
        is_public_resource: bool,
    ) -> ResourceResult<Resource> {
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ResourceError::Validation(format!("invalid source path {}", source.display()))
            })?
            .to_string();
        let metadata = FileMetadata::from_local_file(source, file_name.clone(), file_name)
            .await
            .map_err(|err| {
                ResourceError::Validation(format!(
                    "source file {} is not readable: {}",
                    source.display(),
                    err
                ))
            })?;

        let spec = UploadSpec {
            file: metadata,
            is_multi_resolution_image: false,
            is_public_resource,
        };

        let mut undo = Compensations::new();
        let result = async {
            let mut resource = self.create_resource(&spec, false, &mut undo).await?;
            let version = self
                .store_version(
                    resource.id,
                    &spec.file,
                    DEFAULT_VERSION,
                    storage_key.to_string(),
                    true,
                    &mut undo,
                )
                .await?;
            resource.default_version = Some(version.clone());
            resource.versions = vec![version];
            Ok::<_, ResourceError>(resource)
        }
        .await;

        match result {
            Ok(resource) => {
                undo.commit();
                Ok(resource)
            }
            Err(err) => {
                self.rollback(undo, &err).await;
                Err(err)
            }
        }
    }

    /// Add a version to an existing resource and return the refreshed
    /// resource. Without an explicit identifier the next free number is used.
    pub async fn upload_version(
        &self,
        resource_id: Uuid,
        metadata: FileMetadata,
        make_default: bool,
    ) -> ResourceResult<Resource> {
        validate_metadata(&metadata).await?;
        self.get_by_id(resource_id).await?;

        let identifier = match metadata.version_identifier.clone() {
            Some(identifier) => {
                validate_version_identifier(&identifier)?;
                identifier
            }
            None => self.generate_version_identifier(resource_id).await?,
        };

        let mut undo = Compensations::new();
        let key = storage_key_for(&metadata.file_name, Utc::now());
        match self
            .store_version(resource_id, &metadata, &identifier, key, make_default, &mut undo)
            .await
        {
            Ok(version) => {
                undo.commit();
                info!(
                    resource_id = %resource_id,
                    version = %version.version_identifier,
                    make_default,
                    "added version"
                );
            }
            Err(err) => {
                self.rollback(undo, &err).await;
                return Err(err);
            }
        }

        self.get_by_id(resource_id).await
    }

    /// Rename the default version, in the blob store first and then in the
    /// ledger. Other versions keep their names.
    pub async fn rename(&self, id: Uuid, new_file_name: &str) -> ResourceResult<bool> {
        if !is_valid_file_name(new_file_name) {
            return Err(ResourceError::Validation(format!(
                "invalid file name `{}`",
                new_file_name
            )));
        }

        let resource = self.get_by_id(id).await?;
        let key = default_storage_key(&resource)?.to_string();

        self.storage
            .rename(&key, new_file_name)
            .await
            .map_err(|err| ResourceError::from_storage(id, "renaming stored object", err))?;

        match self.ledger.rename(id, new_file_name).await {
            Ok(renamed) => Ok(renamed),
            Err(err) => {
                let moved = renamed_key(&key, new_file_name);
                if let Err(revert) = self.storage.rename(&moved, key_file_name(&key)).await {
                    warn!("could not revert rename of {} to {}: {}", moved, key, revert);
                }
                Err(ResourceError::from_ledger(
                    format!("renaming resource {}", id),
                    err,
                ))
            }
        }
    }

    pub async fn get_by_id(&self, id: Uuid) -> ResourceResult<Resource> {
        self.ledger
            .get_by_id(id)
            .await
            .map_err(|err| ResourceError::from_ledger(format!("loading resource {}", id), err))?
            .ok_or(ResourceError::ResourceNotFound(id))
    }

    pub async fn search(&self, filters: &SearchFilters) -> ResourceResult<SearchResults> {
        self.ledger
            .search(filters)
            .await
            .map_err(|err| ResourceError::from_ledger("searching resources", err))
    }

    /// Copy the default version into a fresh download staging directory.
    pub async fn download(&self, id: Uuid) -> ResourceResult<PathBuf> {
        let resource = self.get_by_id(id).await?;
        let key = default_storage_key(&resource)?;
        let folder = self.download_folder().await?;
        self.storage
            .download(key, &folder)
            .await
            .map_err(|err| ResourceError::from_storage(id, "downloading default version", err))
    }

    pub async fn download_by_version(
        &self,
        id: Uuid,
        version_identifier: &str,
    ) -> ResourceResult<PathBuf> {
        let version = self
            .ledger
            .get_version(id, version_identifier)
            .await
            .map_err(|err| ResourceError::from_ledger(format!("loading resource {}", id), err))?
            .ok_or_else(|| ResourceError::VersionNotFound {
                resource_id: id,
                version: version_identifier.to_string(),
            })?;
        let key = version_storage_key(&version)?;
        let folder = self.download_folder().await?;
        self.storage
            .download(key, &folder)
            .await
            .map_err(|err| {
                ResourceError::from_storage(
                    id,
                    format!("downloading version {}", version_identifier),
                    err,
                )
            })
    }

    /// Download the default version of every matching resource into one
    /// staging directory and return that directory.
    pub async fn search_and_download(&self, filters: &SearchFilters) -> ResourceResult<PathBuf> {
        let resources = self
            .ledger
            .search_for_download(filters)
            .await
            .map_err(|err| ResourceError::from_ledger("searching resources", err))?;
        let folder = self.download_folder().await?;

        for resource in &resources {
            let result = async {
                let key = default_storage_key(resource)?;
                let file_name = resource
                    .default_version
                    .as_ref()
                    .map(|v| v.file_name.as_str())
                    .unwrap_or_else(|| key_file_name(key));
                self.storage
                    .download(key, &folder.join(file_name))
                    .await
                    .map_err(|err| {
                        ResourceError::from_storage(resource.id, "bulk download", err)
                    })
            }
            .await;

            if let Err(err) = result {
                if let Err(rm) = fs::remove_dir_all(&folder).await {
                    debug!("could not remove {}: {}", folder.display(), rm);
                }
                return Err(err);
            }
        }

        debug!(
            "downloaded {} resources into {}",
            resources.len(),
            folder.display()
        );
        Ok(folder)
    }

    pub async fn shareable_link(&self, id: Uuid, ttl_minutes: u32) -> ResourceResult<String> {
        if ttl_minutes == 0 {
            return Err(ResourceError::Validation(
                "link duration must be at least one minute".into(),
            ));
        }
        let resource = self.get_by_id(id).await?;
        let key = default_storage_key(&resource)?;
        self.storage
            .shareable_link(key, ttl_minutes)
            .await
            .map_err(|err| ResourceError::from_storage(id, "issuing shareable link", err))
    }

    /// Delete every version, then the resource.
    ///
    /// A version's ledger row is only removed once the blob store confirms
    /// its object is gone. If any version survives the resource stays, with
    /// its surviving versions, and an integrity violation is returned.
    pub async fn delete(&self, id: Uuid) -> ResourceResult<bool> {
        self.get_by_id(id).await?;
        let versions = self.versions_of(id).await?;

        for version in &versions {
            let confirmed = match &version.storage_key {
                None => true,
                Some(key) => match self.storage.delete(key).await {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!("object {} for resource {} was already absent", key, id);
                        true
                    }
                    Err(err) => {
                        warn!(
                            resource_id = %id,
                            version = %version.version_identifier,
                            "failed to delete stored object {}: {}",
                            key,
                            err
                        );
                        false
                    }
                },
            };
            if !confirmed {
                continue;
            }

            let removed = self
                .ledger
                .delete_version(id, &version.version_identifier)
                .await
                .map_err(|err| {
                    ResourceError::from_ledger(
                        format!("deleting version {}", version.version_identifier),
                        err,
                    )
                })?;
            if !removed {
                return Err(ResourceError::integrity(
                    id,
                    format!(
                        "error deleting version `{}` from the ledger",
                        version.version_identifier
                    ),
                ));
            }
        }

        let remaining = self.versions_of(id).await?;
        if !remaining.is_empty() {
            return Err(ResourceError::integrity(
                id,
                format!(
                    "cannot delete all versions; {} of {} remain",
                    remaining.len(),
                    versions.len()
                ),
            ));
        }

        let deleted = self
            .ledger
            .delete(id)
            .await
            .map_err(|err| ResourceError::from_ledger(format!("deleting resource {}", id), err))?;
        info!(resource_id = %id, "deleted file resource");
        Ok(deleted)
    }

    /// Sweep stale staging directories from both temp roots.
    pub async fn cleanup_temp_files(&self) -> CleanupReport {
        let retention = self.config.retention();
        let now = Utc::now();
        let mut report = CleanupReport::default();
        for root in [
            &self.config.download_temp_folder,
            &self.config.upload_temp_folder,
        ] {
            report.merge(cleanup_directory(root, retention, now).await);
        }
        report
    }

    async fn create_resource(
        &self,
        spec: &UploadSpec,
        multi_resolution: bool,
        undo: &mut Compensations,
    ) -> ResourceResult<Resource> {
        let resource = self
            .ledger
            .create(&NewResource {
                original_mime_type: spec.file.mime_type.clone(),
                is_public_resource: spec.is_public_resource,
                is_multi_resolution_image: multi_resolution,
            })
            .await
            .map_err(|err| ResourceError::from_ledger("creating resource", err))?;

        let ledger = self.ledger.clone();
        let id = resource.id;
        undo.push(format!("remove resource {}", id), async move {
            ledger.delete(id).await?;
            Ok(())
        });
        Ok(resource)
    }

    /// Upload one file and record it as a version. Both steps register their
    /// inverse in `undo`.
    async fn store_version(
        &self,
        resource_id: Uuid,
        metadata: &FileMetadata,
        version_identifier: &str,
        key: String,
        make_default: bool,
        undo: &mut Compensations,
    ) -> ResourceResult<Version> {
        let stored_key = self
            .storage
            .upload(&key, &metadata.source_file_path)
            .await
            .map_err(|err| {
                ResourceError::from_storage(
                    resource_id,
                    format!("uploading version {}", version_identifier),
                    err,
                )
            })?;

        // Backends refuse occupied keys, so this object is ours to remove.
        let storage = self.storage.clone();
        let object_key = stored_key.clone();
        undo.push(format!("remove object {}", stored_key), async move {
            storage.delete(&object_key).await?;
            Ok(())
        });

        let version = self
            .ledger
            .add_version(
                resource_id,
                &NewVersion::from_metadata(metadata, version_identifier, stored_key),
                make_default,
            )
            .await
            .map_err(|err| {
                ResourceError::from_ledger(format!("recording version {}", version_identifier), err)
            })?;

        let ledger = self.ledger.clone();
        let identifier = version.version_identifier.clone();
        undo.push(
            format!("remove version {} of {}", identifier, resource_id),
            async move {
                ledger.delete_version(resource_id, &identifier).await?;
                Ok(())
            },
        );
        Ok(version)
    }

    /// `count + 1`, bumped until it does not collide with a current name.
    /// Names freed by deletion can be handed out again.
    async fn generate_version_identifier(&self, resource_id: Uuid) -> ResourceResult<String> {
        let names = self
            .ledger
            .get_version_names(resource_id)
            .await
            .map_err(|err| ResourceError::from_ledger("listing version names", err))?;
        let mut count = names.len() + 1;
        let mut candidate = count.to_string();
        while names.contains(&candidate) {
            count += 1;
            candidate = count.to_string();
        }
        Ok(candidate)
    }

    async fn versions_of(&self, id: Uuid) -> ResourceResult<Vec<Version>> {
        self.ledger
            .get_versions(id)
            .await
            .map_err(|err| ResourceError::from_ledger(format!("listing versions of {}", id), err))
    }

    async fn download_folder(&self) -> ResourceResult<PathBuf> {
        create_staging_dir(&self.config.download_temp_folder, Utc::now())
            .await
            .map_err(|err| ResourceError::backend("creating download staging directory", err))
    }

    async fn rollback(&self, undo: Compensations, cause: &ResourceError) {
        if undo.is_empty() {
            return;
        }
        warn!("rolling back {} step(s) after: {}", undo.len(), cause);
        let failed = undo.unwind().await;
        if failed > 0 {
            warn!("{} compensation(s) failed; manual cleanup may be needed", failed);
        }
    }
}

fn default_storage_key(resource: &Resource) -> ResourceResult<&str> {
    let version = resource
        .default_version
        .as_ref()
        .ok_or_else(|| ResourceError::integrity(resource.id, "resource has no default version"))?;
    version_storage_key(version)
}

fn version_storage_key(version: &Version) -> ResourceResult<&str> {
    version.storage_key.as_deref().ok_or_else(|| {
        ResourceError::integrity(
            version.resource_id,
            format!("version `{}` has no storage key", version.version_identifier),
        )
    })
}

async fn validate_metadata(metadata: &FileMetadata) -> ResourceResult<()> {
    if !is_valid_file_name(&metadata.file_name) {
        return Err(ResourceError::Validation(format!(
            "invalid file name `{}`",
            metadata.file_name
        )));
    }
    if !metadata.size_kb.is_finite() || metadata.size_kb < 0.0 {
        return Err(ResourceError::Validation("file size must be non-negative".into()));
    }
    match fs::metadata(&metadata.source_file_path).await {
        Ok(stat) if stat.is_file() => Ok(()),
        _ => Err(ResourceError::Validation(format!(
            "source file {} does not exist",
            metadata.source_file_path.display()
        ))),
    }
}

fn validate_version_identifier(identifier: &str) -> ResourceResult<()> {
    if identifier.trim().is_empty()
        || identifier.len() > MAX_VERSION_IDENTIFIER_LEN
        || identifier.chars().any(char::is_control)
    {
        return Err(ResourceError::Validation(format!(
            "invalid version identifier `{}`",
            identifier
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        ledger::sqlite::{SqliteLedger, memory_ledger},
        storage::{BackendResult, local::LocalStorageBackend},
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use image::{ImageBuffer, Rgb};
    use std::{io, sync::Mutex};
    use tempfile::TempDir;

    /// Local backend with injectable failures keyed on key substrings.
    struct FlakyBackend {
        inner: LocalStorageBackend,
        fail_upload: Mutex<Option<String>>,
        fail_delete: Mutex<Option<String>>,
    }

    impl FlakyBackend {
        fn should_fail(slot: &Mutex<Option<String>>, key: &str) -> bool {
            slot.lock()
                .unwrap()
                .as_ref()
                .is_some_and(|pattern| key.contains(pattern.as_str()))
        }

        fn injected(what: &str) -> BackendError {
            BackendError::Io(io::Error::other(format!("injected {what} failure")))
        }
    }

    #[async_trait]
    impl StorageBackend for FlakyBackend {
        async fn upload(&self, key: &str, source: &Path) -> BackendResult<String> {
            if Self::should_fail(&self.fail_upload, key) {
                return Err(Self::injected("upload"));
            }
            self.inner.upload(key, source).await
        }

        async fn download(&self, key: &str, destination: &Path) -> BackendResult<PathBuf> {
            self.inner.download(key, destination).await
        }

        async fn rename(&self, key: &str, new_name: &str) -> BackendResult<bool> {
            self.inner.rename(key, new_name).await
        }

        async fn delete(&self, key: &str) -> BackendResult<bool> {
            if Self::should_fail(&self.fail_delete, key) {
                return Err(Self::injected("delete"));
            }
            self.inner.delete(key).await
        }

        async fn shareable_link(&self, key: &str, ttl_minutes: u32) -> BackendResult<String> {
            self.inner.shareable_link(key, ttl_minutes).await
        }
    }

    struct Harness {
        manager: FileResourceManager,
        ledger: Arc<SqliteLedger>,
        storage: Arc<FlakyBackend>,
        dir: TempDir,
    }

    impl Harness {
        async fn new(policy: MultiResolutionPolicy) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let ledger = Arc::new(memory_ledger().await);
            let storage = Arc::new(FlakyBackend {
                inner: LocalStorageBackend::new(
                    dir.path().join("objects"),
                    "http://localhost:3000",
                    "test-secret",
                ),
                fail_upload: Mutex::new(None),
                fail_delete: Mutex::new(None),
            });
            let config = ResourceConfig {
                download_temp_folder: dir.path().join("tmp/downloads"),
                upload_temp_folder: dir.path().join("tmp/uploads"),
                temp_cleanup_before_minutes: 60,
                multi_resolution_policy: policy,
            };
            let manager = FileResourceManager::new(ledger.clone(), storage.clone(), config);
            Self {
                manager,
                ledger,
                storage,
                dir,
            }
        }

        fn objects_root(&self) -> PathBuf {
            self.dir.path().join("objects")
        }

        fn object_exists(&self, key: &str) -> bool {
            self.objects_root().join(key).exists()
        }

        fn stored_file_count(&self) -> usize {
            fn walk(path: &Path) -> usize {
                match std::fs::read_dir(path) {
                    Ok(entries) => entries
                        .flatten()
                        .map(|e| {
                            let p = e.path();
                            if p.is_dir() { walk(&p) } else { 1 }
                        })
                        .sum(),
                    Err(_) => 0,
                }
            }
            walk(&self.objects_root())
        }

        async fn text_file(&self, name: &str, contents: &[u8]) -> FileMetadata {
            let path = self.dir.path().join("incoming").join(name);
            fs::create_dir_all(path.parent().unwrap()).await.unwrap();
            fs::write(&path, contents).await.unwrap();
            FileMetadata::from_local_file(&path, name, name).await.unwrap()
        }

        async fn png_file(&self, name: &str, width: u32, height: u32) -> FileMetadata {
            let path = self.dir.path().join("incoming").join(name);
            fs::create_dir_all(path.parent().unwrap()).await.unwrap();
            ImageBuffer::from_pixel(width, height, Rgb([200u8, 30, 30]))
                .save(&path)
                .unwrap();
            FileMetadata::from_local_file(&path, name, name).await.unwrap()
        }
    }

    fn spec(file: FileMetadata, multi: bool) -> UploadSpec {
        UploadSpec {
            file,
            is_multi_resolution_image: multi,
            is_public_resource: false,
        }
    }

    fn identifiers(resource: &Resource) -> Vec<&str> {
        resource
            .versions
            .iter()
            .map(|v| v.version_identifier.as_str())
            .collect()
    }

    fn default_count(resource: &Resource) -> usize {
        resource.versions.iter().filter(|v| v.is_default).count()
    }

    #[tokio::test]
    async fn single_upload_round_trips() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let file = h.text_file("notes.txt", b"blood pressure 120/80").await;
        let original_len = fs::metadata(&file.source_file_path).await.unwrap().len();

        let resource = h.manager.upload(spec(file, false)).await.unwrap();
        assert_eq!(identifiers(&resource), vec!["1"]);
        let default = resource.default_version.as_ref().unwrap();
        assert!(default.is_default);
        assert_eq!(
            default.storage_key.as_deref().unwrap(),
            storage_key_for("notes.txt", Utc::now())
        );

        let local = h.manager.download(resource.id).await.unwrap();
        assert_eq!(fs::metadata(&local).await.unwrap().len(), original_len);

        let staging = local.parent().unwrap();
        assert_eq!(staging.parent().unwrap(), h.dir.path().join("tmp/downloads"));
        let name = staging.file_name().unwrap().to_str().unwrap();
        assert!(name.parse::<i64>().is_ok());
    }

    #[tokio::test]
    async fn multi_resolution_upload_adds_renditions() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let file = h.png_file("xray.png", 1200, 800).await;
        let source = file.source_file_path.clone();
        let original_len = fs::metadata(&source).await.unwrap().len();

        let resource = h.manager.upload(spec(file, true)).await.unwrap();
        assert!(resource.is_multi_resolution_image);
        assert_eq!(identifiers(&resource), vec!["1", "1:Thumbnail", "1:Preview"]);
        assert_eq!(default_count(&resource), 1);
        assert_eq!(
            resource.default_version.as_ref().unwrap().version_identifier,
            "1"
        );

        // Rendition files written beside the source are cleaned up.
        assert!(!source.with_file_name("xray_thumbnail.png").exists());
        assert!(!source.with_file_name("xray_preview.png").exists());

        let stored = h.ledger.get_by_id(resource.id).await.unwrap().unwrap();
        assert_eq!(stored.versions.len(), 3);
        assert_eq!(default_count(&stored), 1);

        let local = h.manager.download(resource.id).await.unwrap();
        assert_eq!(fs::metadata(&local).await.unwrap().len(), original_len);

        let thumb = h
            .manager
            .download_by_version(resource.id, "1:Thumbnail")
            .await
            .unwrap();
        assert_eq!(image::image_dimensions(&thumb).unwrap(), (200, 133));
    }

    #[tokio::test]
    async fn unsupported_type_warns_and_stores_original() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let file = h.text_file("summary.pdf", b"%PDF-1.4 not an image").await;

        let resource = h.manager.upload(spec(file, true)).await.unwrap();
        assert_eq!(identifiers(&resource), vec!["1"]);
        assert!(!resource.is_multi_resolution_image);
    }

    #[tokio::test]
    async fn unsupported_type_rejected_by_policy() {
        let h = Harness::new(MultiResolutionPolicy::Reject).await;
        let file = h.text_file("summary.pdf", b"%PDF-1.4 not an image").await;

        let err = h.manager.upload(spec(file, true)).await.unwrap_err();
        assert!(matches!(err, ResourceError::UnsupportedMediaType(ref m) if m == "application/pdf"));
        let all = h.manager.search(&SearchFilters::default()).await.unwrap();
        assert_eq!(all.total_count, 0);
        assert_eq!(h.stored_file_count(), 0);
    }

    #[tokio::test]
    async fn failed_rendition_upload_rolls_everything_back() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        *h.storage.fail_upload.lock().unwrap() = Some("_preview".into());
        let file = h.png_file("scan.png", 800, 1200).await;

        let err = h.manager.upload(spec(file, true)).await.unwrap_err();
        assert!(matches!(err, ResourceError::BackendFailure { .. }));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_resources")
            .fetch_one(&*h.ledger.db)
            .await
            .unwrap();
        assert_eq!(count, 0);
        let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_resource_versions")
            .fetch_one(&*h.ledger.db)
            .await
            .unwrap();
        assert_eq!(versions, 0);
        assert_eq!(h.stored_file_count(), 0);
    }

    #[tokio::test]
    async fn upload_version_generates_next_identifier() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("a.txt", b"v1").await, false))
            .await
            .unwrap();

        let updated = h
            .manager
            .upload_version(resource.id, h.text_file("b.txt", b"v2").await, false)
            .await
            .unwrap();
        assert_eq!(identifiers(&updated), vec!["1", "2"]);
        assert_eq!(
            updated.default_version.as_ref().unwrap().version_identifier,
            "1"
        );

        let updated = h
            .manager
            .upload_version(resource.id, h.text_file("c.txt", b"v3").await, true)
            .await
            .unwrap();
        assert_eq!(identifiers(&updated), vec!["1", "2", "3"]);
        assert_eq!(default_count(&updated), 1);
        assert_eq!(
            updated.default_version.as_ref().unwrap().version_identifier,
            "3"
        );
    }

    #[tokio::test]
    async fn generated_identifier_skips_existing_names() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("a.txt", b"v1").await, false))
            .await
            .unwrap();
        let mut explicit = h.text_file("b.txt", b"v2").await;
        explicit.version_identifier = Some("2".into());
        h.manager
            .upload_version(resource.id, explicit, false)
            .await
            .unwrap();
        let mut explicit = h.text_file("c.txt", b"v3").await;
        explicit.version_identifier = Some("3".into());
        h.manager
            .upload_version(resource.id, explicit, false)
            .await
            .unwrap();

        // Remove "2": three names become two, so the next candidate "3"
        // collides and is bumped to "4".
        h.ledger.delete_version(resource.id, "2").await.unwrap();
        let updated = h
            .manager
            .upload_version(resource.id, h.text_file("d.txt", b"v4").await, false)
            .await
            .unwrap();
        assert_eq!(identifiers(&updated), vec!["1", "3", "4"]);
    }

    #[tokio::test]
    async fn duplicate_identifier_is_compensated() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("a.txt", b"v1").await, false))
            .await
            .unwrap();

        let mut dup = h.text_file("dup.txt", b"again").await;
        dup.version_identifier = Some("1".into());
        let err = h
            .manager
            .upload_version(resource.id, dup, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::IntegrityViolation { .. }));
        assert!(!h.object_exists(&storage_key_for("dup.txt", Utc::now())));
        assert_eq!(h.stored_file_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_identifier_with_same_name_keeps_original_object() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("a.txt", b"original").await, false))
            .await
            .unwrap();

        let mut dup = h.text_file("a.txt", b"second!!!").await;
        dup.version_identifier = Some("1".into());
        let err = h
            .manager
            .upload_version(resource.id, dup, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Validation(_)));

        let local = h.manager.download(resource.id).await.unwrap();
        assert_eq!(fs::read(&local).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn new_version_with_taken_name_is_refused() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("a.txt", b"original").await, false))
            .await
            .unwrap();

        let err = h
            .manager
            .upload_version(resource.id, h.text_file("a.txt", b"second!!!").await, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Validation(_)));

        let stored = h.manager.get_by_id(resource.id).await.unwrap();
        assert_eq!(identifiers(&stored), vec!["1"]);
        let v1 = h.manager.download_by_version(resource.id, "1").await.unwrap();
        assert_eq!(fs::read(&v1).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn rename_onto_taken_name_leaves_both_objects() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("a.txt", b"default").await, false))
            .await
            .unwrap();
        h.manager
            .upload_version(resource.id, h.text_file("b.txt", b"sibling").await, false)
            .await
            .unwrap();

        let err = h.manager.rename(resource.id, "b.txt").await.unwrap_err();
        assert!(matches!(err, ResourceError::Validation(_)));

        let stored = h.manager.get_by_id(resource.id).await.unwrap();
        let default = stored.default_version.as_ref().unwrap();
        assert_eq!(default.file_name, "a.txt");
        let keys: Vec<_> = stored
            .versions
            .iter()
            .filter_map(|v| v.storage_key.clone())
            .collect();
        assert_ne!(keys[0], keys[1]);

        let v1 = h.manager.download_by_version(resource.id, "1").await.unwrap();
        assert_eq!(fs::read(&v1).await.unwrap(), b"default");
        let v2 = h.manager.download_by_version(resource.id, "2").await.unwrap();
        assert_eq!(fs::read(&v2).await.unwrap(), b"sibling");
    }

    #[tokio::test]
    async fn upload_local_rejects_unsafe_key() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let file = h.text_file("report.txt", b"monthly").await;
        let err = h
            .manager
            .upload_local(&file.source_file_path, "../outside/report.txt", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Validation(_)));
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_resources")
            .fetch_one(&*h.ledger.db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn upload_version_requires_existing_resource() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let missing = Uuid::new_v4();
        let err = h
            .manager
            .upload_version(missing, h.text_file("a.txt", b"v").await, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::ResourceNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn rename_only_touches_default_version() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.png_file("chart.png", 640, 480).await, true))
            .await
            .unwrap();
        let old_key = resource
            .default_version
            .as_ref()
            .unwrap()
            .storage_key
            .clone()
            .unwrap();

        assert!(h.manager.rename(resource.id, "weekly.png").await.unwrap());

        let renamed = h.manager.get_by_id(resource.id).await.unwrap();
        let default = renamed.default_version.as_ref().unwrap();
        assert_eq!(default.file_name, "weekly.png");
        let new_key = default.storage_key.clone().unwrap();
        assert_eq!(new_key, renamed_key(&old_key, "weekly.png"));
        assert!(h.object_exists(&new_key));
        assert!(!h.object_exists(&old_key));

        let thumb = renamed
            .versions
            .iter()
            .find(|v| v.version_identifier == "1:Thumbnail")
            .unwrap();
        assert_eq!(thumb.file_name, "chart_thumbnail.png");
        assert!(h.object_exists(thumb.storage_key.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn rename_validates_and_reports_missing() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let err = h.manager.rename(Uuid::new_v4(), "x.txt").await.unwrap_err();
        assert!(matches!(err, ResourceError::ResourceNotFound(_)));

        let err = h
            .manager
            .rename(Uuid::new_v4(), "../x.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_removes_versions_then_resource() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.png_file("mri.png", 300, 300).await, true))
            .await
            .unwrap();
        assert_eq!(h.stored_file_count(), 3);

        assert!(h.manager.delete(resource.id).await.unwrap());
        assert_eq!(h.stored_file_count(), 0);
        assert!(matches!(
            h.manager.get_by_id(resource.id).await,
            Err(ResourceError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_keeps_resource_when_a_version_survives() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("a.txt", b"v1").await, false))
            .await
            .unwrap();
        h.manager
            .upload_version(resource.id, h.text_file("b.txt", b"v2").await, false)
            .await
            .unwrap();
        h.manager
            .upload_version(resource.id, h.text_file("c.txt", b"v3").await, false)
            .await
            .unwrap();
        *h.storage.fail_delete.lock().unwrap() = Some("b.txt".into());

        let err = h.manager.delete(resource.id).await.unwrap_err();
        assert!(matches!(err, ResourceError::IntegrityViolation { .. }));

        let survivor = h.manager.get_by_id(resource.id).await.unwrap();
        assert_eq!(identifiers(&survivor), vec!["2"]);
        assert_eq!(default_count(&survivor), 1);
        assert!(h.object_exists(survivor.versions[0].storage_key.as_deref().unwrap()));

        // Once the backend recovers the delete completes.
        *h.storage.fail_delete.lock().unwrap() = None;
        assert!(h.manager.delete(resource.id).await.unwrap());
    }

    #[tokio::test]
    async fn shareable_link_targets_default_version() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("lab.txt", b"results").await, false))
            .await
            .unwrap();

        let url = h.manager.shareable_link(resource.id, 30).await.unwrap();
        assert!(url.starts_with("http://localhost:3000/shared/"));

        let err = h.manager.shareable_link(resource.id, 0).await.unwrap_err();
        assert!(matches!(err, ResourceError::Validation(_)));
    }

    #[tokio::test]
    async fn search_and_download_collects_defaults() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        for name in ["one.txt", "two.txt"] {
            h.manager
                .upload(spec(h.text_file(name, name.as_bytes()).await, false))
                .await
                .unwrap();
        }

        let folder = h
            .manager
            .search_and_download(&SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(
            fs::read(folder.join("one.txt")).await.unwrap(),
            b"one.txt"
        );
        assert_eq!(
            fs::read(folder.join("two.txt")).await.unwrap(),
            b"two.txt"
        );
    }

    #[tokio::test]
    async fn download_of_unknown_version_is_not_found() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let resource = h
            .manager
            .upload(spec(h.text_file("a.txt", b"v1").await, false))
            .await
            .unwrap();
        let err = h
            .manager
            .download_by_version(resource.id, "9")
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::VersionNotFound { .. }));
    }

    #[tokio::test]
    async fn cleanup_sweeps_both_temp_roots() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let stale = (Utc::now() - Duration::minutes(120))
            .timestamp_millis()
            .to_string();
        let fresh = Utc::now().timestamp_millis().to_string();
        let cfg = h.manager.config().clone();
        for root in [&cfg.download_temp_folder, &cfg.upload_temp_folder] {
            std::fs::create_dir_all(root.join(&stale)).unwrap();
            std::fs::create_dir_all(root.join(&fresh)).unwrap();
        }

        let report = h.manager.cleanup_temp_files().await;
        assert_eq!(report.removed, 2);
        assert_eq!(report.retained, 2);
        assert!(!cfg.download_temp_folder.join(&stale).exists());
        assert!(cfg.upload_temp_folder.join(&fresh).exists());
    }

    #[tokio::test]
    async fn upload_local_uses_explicit_key() {
        let h = Harness::new(MultiResolutionPolicy::Warn).await;
        let file = h.text_file("report.txt", b"monthly").await;

        let resource = h
            .manager
            .upload_local(&file.source_file_path, "reports/2024/report.txt", true)
            .await
            .unwrap();
        assert!(resource.is_public_resource);
        assert_eq!(
            resource
                .default_version
                .as_ref()
                .unwrap()
                .storage_key
                .as_deref(),
            Some("reports/2024/report.txt")
        );
        assert!(h.object_exists("reports/2024/report.txt"));

        let err = h
            .manager
            .upload_local(&h.dir.path().join("missing.txt"), "x/missing.txt", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Validation(_)));
    }
}
