//! Routes for file resources, shared links and health probes.
//!
//! ## Structure
//! - **Resource collection**
//!   - `POST   /file-resources/upload` - multipart upload of a new resource
//!   - `GET    /file-resources/search` - paged search over default versions
//!   - `GET    /file-resources/download` - bulk download of all matches
//!
//! - **Single resource**
//!   - `GET    /file-resources/{id}` - resource with its versions
//!   - `DELETE /file-resources/{id}` - delete every version, then the resource
//!   - `PUT    /file-resources/{id}/rename` - rename the default version
//!   - `POST   /file-resources/{id}/versions` - add a version
//!   - `GET    /file-resources/{id}/download` - stream the default version
//!   - `GET    /file-resources/{id}/versions/{version}/download`
//!   - `GET    /file-resources/{id}/share` - issue an expiring link
//!
//! - `GET /shared/{token}` serves links issued by the local backend.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        resource_handlers::{
            delete_resource, download_default, download_version, get_resource, get_shared,
            rename_resource, search_and_download, search_resources, share_resource,
            upload_resource, upload_version,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Static segments take priority over `{id}`.
        .route("/file-resources/upload", post(upload_resource))
        .route("/file-resources/search", get(search_resources))
        .route("/file-resources/download", get(search_and_download))
        .route(
            "/file-resources/{id}",
            get(get_resource).delete(delete_resource),
        )
        .route("/file-resources/{id}/rename", put(rename_resource))
        .route("/file-resources/{id}/versions", post(upload_version))
        .route("/file-resources/{id}/download", get(download_default))
        .route(
            "/file-resources/{id}/versions/{version}/download",
            get(download_version),
        )
        .route("/file-resources/{id}/share", get(share_resource))
        .route("/shared/{token}", get(get_shared))
}
