//! src/services/ledger/sqlite.rs
//!
//! SqliteLedger - resource and version rows in SQLite. Default-version
//! bookkeeping happens inside transactions so concurrent readers never see
//! two defaults or none.

use super::{LedgerError, LedgerResult, ResourceLedger};
use crate::models::{
    resource::{NewResource, NewVersion, Resource, Version},
    search::{OrderBy, SearchFilters, SearchResults, SortOrder},
};
use crate::services::storage::renamed_key;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../../migrations/0001_init.sql");

const RESOURCE_COLUMNS: &str = "r.id, r.original_mime_type, r.is_public_resource, \
     r.is_multi_resolution_image, r.created_at";

const VERSION_COLUMNS: &str = "id, resource_id, version_identifier, file_name, original_name, \
     mime_type, size_kb, storage_key, is_default, created_at";

#[derive(Clone)]
pub struct SqliteLedger {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<usize, sqlx::Error> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    for stmt in &statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(statements.len())
}

impl SqliteLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn attach_versions(&self, mut resource: Resource) -> LedgerResult<Resource> {
        let versions = self.get_versions(resource.id).await?;
        resource.default_version = versions.iter().find(|v| v.is_default).cloned();
        resource.versions = versions;
        Ok(resource)
    }

    async fn attach_all(&self, rows: Vec<Resource>) -> LedgerResult<Vec<Resource>> {
        let mut resources = Vec::with_capacity(rows.len());
        for row in rows {
            resources.push(self.attach_versions(row).await?);
        }
        Ok(resources)
    }
}

/// Shared FROM/WHERE clause for search queries. Only resources that have a
/// default version are visible.
fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filters: &SearchFilters) {
    builder.push(
        " FROM file_resources r \
         JOIN file_resource_versions v ON v.resource_id = r.id AND v.is_default = 1 \
         WHERE 1 = 1",
    );
    if let Some(name) = &filters.file_name {
        builder.push(" AND v.file_name LIKE ");
        builder.push_bind(format!("%{}%", escape_like(name)));
        builder.push(" ESCAPE '\\'");
    }
    if let Some(mime) = &filters.mime_type {
        builder.push(" AND r.original_mime_type = ");
        builder.push_bind(mime.clone());
    }
    if let Some(is_public) = filters.is_public_resource {
        builder.push(" AND r.is_public_resource = ");
        builder.push_bind(is_public);
    }
    if let Some(from) = filters.created_date_from {
        builder.push(" AND r.created_at >= ");
        builder.push_bind(from);
    }
    if let Some(to) = filters.created_date_to {
        builder.push(" AND r.created_at <= ");
        builder.push_bind(to);
    }
}

fn push_ordering(builder: &mut QueryBuilder<'_, Sqlite>, filters: &SearchFilters) {
    let column = match filters.order_by {
        OrderBy::CreatedAt => "r.created_at",
        OrderBy::FileName => "v.file_name",
    };
    let direction = match filters.order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    };
    builder.push(format!(" ORDER BY {} {}, r.rowid {}", column, direction, direction));
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[async_trait]
impl ResourceLedger for SqliteLedger {
    async fn create(&self, resource: &NewResource) -> LedgerResult<Resource> {
        let row = sqlx::query_as::<_, Resource>(
            "INSERT INTO file_resources (
                id, original_mime_type, is_public_resource, is_multi_resolution_image, created_at
             ) VALUES (?, ?, ?, ?, ?)
             RETURNING id, original_mime_type, is_public_resource,
                       is_multi_resolution_image, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(resource.original_mime_type.clone())
        .bind(resource.is_public_resource)
        .bind(resource.is_multi_resolution_image)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;
        Ok(row)
    }

    async fn add_version(
        &self,
        resource_id: Uuid,
        version: &NewVersion,
        make_default: bool,
    ) -> LedgerResult<Version> {
        let mut tx = self.db.begin().await?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM file_resources WHERE id = ?")
            .bind(resource_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(LedgerError::ResourceNotFound(resource_id));
        }

        let defaults = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM file_resource_versions WHERE resource_id = ? AND is_default = 1",
        )
        .bind(resource_id)
        .fetch_one(&mut *tx)
        .await?;

        if make_default && defaults > 0 {
            sqlx::query("UPDATE file_resource_versions SET is_default = 0 WHERE resource_id = ?")
                .bind(resource_id)
                .execute(&mut *tx)
                .await?;
        }
        let is_default = make_default || defaults == 0;

        let inserted = sqlx::query_as::<_, Version>(&format!(
            "INSERT INTO file_resource_versions (
                id, resource_id, version_identifier, file_name, original_name,
                mime_type, size_kb, storage_key, is_default, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {}",
            VERSION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(resource_id)
        .bind(&version.version_identifier)
        .bind(&version.file_name)
        .bind(&version.original_name)
        .bind(version.mime_type.clone())
        .bind(version.size_kb)
        .bind(&version.storage_key)
        .bind(is_default)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                LedgerError::DuplicateVersion {
                    resource_id,
                    version: version.version_identifier.clone(),
                }
            } else {
                LedgerError::Sqlx(err)
            }
        })?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_by_id(&self, id: Uuid) -> LedgerResult<Option<Resource>> {
        let row = sqlx::query_as::<_, Resource>(&format!(
            "SELECT {} FROM file_resources r WHERE r.id = ?",
            RESOURCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(resource) => Ok(Some(self.attach_versions(resource).await?)),
            None => Ok(None),
        }
    }

    async fn get_version(
        &self,
        resource_id: Uuid,
        version_identifier: &str,
    ) -> LedgerResult<Option<Version>> {
        let version = sqlx::query_as::<_, Version>(&format!(
            "SELECT {} FROM file_resource_versions
             WHERE resource_id = ? AND version_identifier = ?",
            VERSION_COLUMNS
        ))
        .bind(resource_id)
        .bind(version_identifier)
        .fetch_optional(&*self.db)
        .await?;
        Ok(version)
    }

    async fn get_versions(&self, resource_id: Uuid) -> LedgerResult<Vec<Version>> {
        let versions = sqlx::query_as::<_, Version>(&format!(
            "SELECT {} FROM file_resource_versions
             WHERE resource_id = ? ORDER BY rowid ASC",
            VERSION_COLUMNS
        ))
        .bind(resource_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(versions)
    }

    async fn get_version_names(&self, resource_id: Uuid) -> LedgerResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT version_identifier FROM file_resource_versions
             WHERE resource_id = ? ORDER BY rowid ASC",
        )
        .bind(resource_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(names)
    }

    /// Removing the default promotes the oldest surviving version.
    async fn delete_version(
        &self,
        resource_id: Uuid,
        version_identifier: &str,
    ) -> LedgerResult<bool> {
        let mut tx = self.db.begin().await?;

        let was_default = sqlx::query_scalar::<_, bool>(
            "SELECT is_default FROM file_resource_versions
             WHERE resource_id = ? AND version_identifier = ?",
        )
        .bind(resource_id)
        .bind(version_identifier)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(was_default) = was_default else {
            return Ok(false);
        };

        sqlx::query(
            "DELETE FROM file_resource_versions WHERE resource_id = ? AND version_identifier = ?",
        )
        .bind(resource_id)
        .bind(version_identifier)
        .execute(&mut *tx)
        .await?;

        if was_default {
            let promoted = sqlx::query(
                "UPDATE file_resource_versions SET is_default = 1
                 WHERE id = (
                     SELECT id FROM file_resource_versions
                     WHERE resource_id = ? ORDER BY rowid ASC LIMIT 1
                 )",
            )
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
            if promoted.rows_affected() > 0 {
                debug!("promoted new default version for resource {}", resource_id);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, resource_id: Uuid) -> LedgerResult<bool> {
        let remaining = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM file_resource_versions WHERE resource_id = ?",
        )
        .bind(resource_id)
        .fetch_one(&*self.db)
        .await?;
        if remaining > 0 {
            return Err(LedgerError::VersionsRemaining {
                resource_id,
                remaining,
            });
        }

        let result = sqlx::query("DELETE FROM file_resources WHERE id = ?")
            .bind(resource_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rename(&self, resource_id: Uuid, new_file_name: &str) -> LedgerResult<bool> {
        let default = sqlx::query_as::<_, (Uuid, Option<String>)>(
            "SELECT id, storage_key FROM file_resource_versions
             WHERE resource_id = ? AND is_default = 1",
        )
        .bind(resource_id)
        .fetch_optional(&*self.db)
        .await?;
        let Some((version_id, storage_key)) = default else {
            return Ok(false);
        };

        let new_key = storage_key.map(|key| renamed_key(&key, new_file_name));
        let result = sqlx::query(
            "UPDATE file_resource_versions SET file_name = ?, storage_key = ? WHERE id = ?",
        )
        .bind(new_file_name)
        .bind(new_key)
        .bind(version_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(&self, filters: &SearchFilters) -> LedgerResult<SearchResults> {
        let page_index = filters.page_index();
        let items_per_page = filters.items_per_page();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*)");
        push_filters(&mut count, filters);
        let total_count: i64 = count.build_query_scalar().fetch_one(&*self.db).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {}", RESOURCE_COLUMNS));
        push_filters(&mut builder, filters);
        push_ordering(&mut builder, filters);
        builder.push(" LIMIT ");
        builder.push_bind(i64::from(items_per_page));
        builder.push(" OFFSET ");
        builder.push_bind(i64::from(page_index) * i64::from(items_per_page));

        let rows: Vec<Resource> = builder.build_query_as().fetch_all(&*self.db).await?;
        let items = self.attach_all(rows).await?;

        Ok(SearchResults {
            total_count,
            retrieved_count: items.len(),
            page_index,
            items_per_page,
            order: filters.order,
            order_by: filters.order_by,
            items,
        })
    }

    async fn search_for_download(&self, filters: &SearchFilters) -> LedgerResult<Vec<Resource>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {}", RESOURCE_COLUMNS));
        push_filters(&mut builder, filters);
        push_ordering(&mut builder, filters);

        let rows: Vec<Resource> = builder.build_query_as().fetch_all(&*self.db).await?;
        self.attach_all(rows).await
    }
}

/// Single-connection in-memory ledger with the schema applied.
#[cfg(test)]
pub(crate) async fn memory_ledger() -> SqliteLedger {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    SqliteLedger::new(Arc::new(pool))
}
