//! src/services/storage/local.rs
//!
//! LocalStorageBackend - stores object payloads on local disk beneath
//! `base_path/{key}` and issues md5-signed, expiring links that the
//! `/shared/{token}` route verifies.

use super::{BackendError, BackendResult, StorageBackend, key_file_name, renamed_key};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Clone)]
pub struct LocalStorageBackend {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    /// Public URL prefix used when building shareable links.
    public_base_url: String,

    link_secret: String,
}

impl LocalStorageBackend {
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        link_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            link_secret: link_secret.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`.
    fn ensure_key_safe(&self, key: &str) -> BackendResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn object_path(&self, key: &str) -> BackendResult<PathBuf> {
        self.ensure_key_safe(key)?;
        Ok(self.base_path.join(key))
    }

    /// Open an object for streaming out. Returns the handle and its length.
    pub async fn open(&self, key: &str) -> BackendResult<(File, u64)> {
        let path = self.object_path(key)?;
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::NotFound(key.to_string())
            } else {
                BackendError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    fn sign(&self, key: &str, expires: i64) -> String {
        let digest = md5::compute(format!("{}:{}:{}", self.link_secret, key, expires));
        format!("{:x}", digest)
    }

    /// Build a link to `key` that stops verifying after `expires_at`.
    pub fn signed_link(&self, key: &str, expires_at: DateTime<Utc>) -> String {
        let expires = expires_at.timestamp();
        format!(
            "{}/shared/{}?expires={}&signature={}",
            self.public_base_url,
            URL_SAFE_NO_PAD.encode(key),
            expires,
            self.sign(key, expires)
        )
    }

    /// Check a shared-link token and return the object key it grants.
    pub fn verify_link(
        &self,
        token: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<String> {
        let key = URL_SAFE_NO_PAD
            .decode(token)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| BackendError::InvalidLink("malformed token".into()))?;
        if self.sign(&key, expires) != signature {
            return Err(BackendError::InvalidLink("signature mismatch".into()));
        }
        if now.timestamp() > expires {
            return Err(BackendError::InvalidLink("link expired".into()));
        }
        self.ensure_key_safe(&key)?;
        Ok(key)
    }

    /// Recursively remove empty directories up to the base path.
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.as_path();
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    /// Copy into a temporary file beside the target, fsync, then hard-link it
    /// into place. The link fails if the key is taken, so an existing object
    /// is never replaced.
    async fn upload(&self, key: &str, source: &Path) -> BackendResult<String> {
        let file_path = self.object_path(key)?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::other("object path missing parent directory"))
        })?;
        if fs::try_exists(&file_path).await? {
            return Err(BackendError::AlreadyExists(key.to_string()));
        }
        fs::create_dir_all(&parent).await?;

        let mut reader = File::open(source).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        if let Err(err) = tokio::io::copy(&mut reader, &mut file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        drop(file);

        let linked = fs::hard_link(&tmp_path, &file_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(BackendError::AlreadyExists(key.to_string()));
            }
            Err(err) => return Err(BackendError::Io(err)),
        }

        debug!("stored object {} at {}", key, file_path.display());
        Ok(key.to_string())
    }

    async fn download(&self, key: &str, destination: &Path) -> BackendResult<PathBuf> {
        let source = self.object_path(key)?;
        if !fs::try_exists(&source).await? {
            return Err(BackendError::NotFound(key.to_string()));
        }

        let target = if fs::metadata(destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            destination.join(key_file_name(key))
        } else {
            destination.to_path_buf()
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::copy(&source, &target).await?;
        Ok(target)
    }

    async fn rename(&self, key: &str, new_name: &str) -> BackendResult<bool> {
        if !super::is_valid_file_name(new_name) {
            return Err(BackendError::InvalidName(new_name.to_string()));
        }
        let from = self.object_path(key)?;
        let to = self.object_path(&renamed_key(key, new_name))?;
        if from == to {
            if fs::try_exists(&from).await? {
                return Ok(true);
            }
            return Err(BackendError::NotFound(key.to_string()));
        }

        // Link then unlink: unlike rename(2), linking refuses an occupied target.
        match fs::hard_link(&from, &to).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BackendError::NotFound(key.to_string()));
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(BackendError::AlreadyExists(renamed_key(key, new_name)));
            }
            Err(err) => return Err(BackendError::Io(err)),
        }
        fs::remove_file(&from).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let file_path = self.object_path(key)?;
        let removed = match fs::remove_file(&file_path).await {
            Ok(_) => {
                debug!("removed physical file {}", file_path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
                false
            }
            Err(err) => return Err(BackendError::Io(err)),
        };

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(removed)
    }

    async fn shareable_link(&self, key: &str, ttl_minutes: u32) -> BackendResult<String> {
        self.ensure_key_safe(key)?;
        let expires_at = Utc::now() + Duration::minutes(i64::from(ttl_minutes));
        Ok(self.signed_link(key, expires_at))
    }
}
