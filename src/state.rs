use crate::services::{resource_manager::FileResourceManager, storage::local::LocalStorageBackend};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<FileResourceManager>,
    /// Concrete backend, needed to verify and serve `/shared/{token}` links.
    pub storage: Arc<LocalStorageBackend>,
    pub db: Arc<SqlitePool>,
}
