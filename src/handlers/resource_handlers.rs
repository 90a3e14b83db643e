//! HTTP handlers for file resources.
//!
//! Multipart uploads are streamed into an upload staging directory before the
//! manager sees them; downloads are streamed back from the download staging
//! directory the manager fills. Neither buffers whole files in memory.

use crate::{
    errors::AppError,
    models::{
        resource::{FileMetadata, Resource, UploadSpec},
        search::{SearchFilters, SearchResults},
    },
    services::{staging::create_staging_dir, storage::is_valid_file_name},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io,
    path::{Path as FsPath, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_LINK_MINUTES: u32 = 60;

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub new_file_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ShareQuery {
    pub duration_minutes: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ShareResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct SharedLinkQuery {
    pub expires: i64,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct BulkDownloadResponse {
    pub folder: PathBuf,
    pub files: Vec<String>,
}

/// Multipart body after the file part has been spooled to disk.
struct StagedForm {
    staging_dir: PathBuf,
    file: Option<FileMetadata>,
    fields: HashMap<String, String>,
}

impl StagedForm {
    fn flag(&self, name: &str) -> Result<bool, AppError> {
        match self.fields.get(name).map(|v| v.trim()) {
            None | Some("") => Ok(false),
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" || v == "on" => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v == "off" => Ok(false),
            Some(v) => Err(AppError::bad_request(format!(
                "field `{}` must be a boolean, got `{}`",
                name, v
            ))),
        }
    }

    fn take_file(&mut self) -> Result<FileMetadata, AppError> {
        self.file
            .take()
            .ok_or_else(|| AppError::bad_request("multipart field `file` is required"))
    }

    async fn discard(self) {
        if let Err(err) = fs::remove_dir_all(&self.staging_dir).await {
            debug!(
                "could not remove upload staging {}: {}",
                self.staging_dir.display(),
                err
            );
        }
    }
}

/// `POST /file-resources/upload`
pub async fn upload_resource(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut form = stage_multipart(&state, multipart).await?;
    let result = async {
        let spec = UploadSpec {
            is_multi_resolution_image: form.flag("is_multi_resolution_image")?,
            is_public_resource: form.flag("is_public_resource")?,
            file: form.take_file()?,
        };
        Ok::<_, AppError>(state.manager.upload(spec).await?)
    }
    .await;
    form.discard().await;

    Ok((StatusCode::CREATED, Json(result?)))
}

/// `POST /file-resources/{id}/versions`
pub async fn upload_version(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut form = stage_multipart(&state, multipart).await?;
    let result = async {
        let make_default = form.flag("make_default")?;
        let mut file = form.take_file()?;
        file.version_identifier = form
            .fields
            .get("version")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Ok::<_, AppError>(state.manager.upload_version(id, file, make_default).await?)
    }
    .await;
    form.discard().await;

    Ok((StatusCode::CREATED, Json(result?)))
}

/// `PUT /file-resources/{id}/rename`
pub async fn rename_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Resource>, AppError> {
    state.manager.rename(id, &req.new_file_name).await?;
    Ok(Json(state.manager.get_by_id(id).await?))
}

/// `GET /file-resources/{id}`
pub async fn get_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Resource>, AppError> {
    Ok(Json(state.manager.get_by_id(id).await?))
}

/// `GET /file-resources/search`
pub async fn search_resources(
    State(state): State<AppState>,
    Query(filters): Query<SearchFilters>,
) -> Result<Json<SearchResults>, AppError> {
    Ok(Json(state.manager.search(&filters).await?))
}

/// `GET /file-resources/download` - bulk download of every match into one
/// staging directory on the server.
pub async fn search_and_download(
    State(state): State<AppState>,
    Query(filters): Query<SearchFilters>,
) -> Result<Json<BulkDownloadResponse>, AppError> {
    let folder = state.manager.search_and_download(&filters).await?;

    let mut files = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .map_err(|err| AppError::internal(format!("listing {}: {}", folder.display(), err)))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
    {
        files.push(entry.file_name().to_string_lossy().into_owned());
    }
    files.sort();

    Ok(Json(BulkDownloadResponse { folder, files }))
}

/// `GET /file-resources/{id}/download`
pub async fn download_default(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let path = state.manager.download(id).await?;
    file_response(&path).await
}

/// `GET /file-resources/{id}/versions/{version}/download`
pub async fn download_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(Uuid, String)>,
) -> Result<Response, AppError> {
    let path = state.manager.download_by_version(id, &version).await?;
    file_response(&path).await
}

/// `GET /file-resources/{id}/share?duration_minutes=`
pub async fn share_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<ShareQuery>,
) -> Result<Json<ShareResponse>, AppError> {
    let ttl = q.duration_minutes.unwrap_or(DEFAULT_LINK_MINUTES);
    let url = state.manager.shareable_link(id, ttl).await?;
    Ok(Json(ShareResponse { url }))
}

/// `DELETE /file-resources/{id}`
pub async fn delete_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.manager.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /shared/{token}?expires=&signature=`
pub async fn get_shared(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(q): Query<SharedLinkQuery>,
) -> Result<Response, AppError> {
    let key = state
        .storage
        .verify_link(&token, q.expires, &q.signature, Utc::now())?;
    let (file, len) = state.storage.open(&key).await?;
    Ok(stream_response(file, len, &key))
}

/// Read every multipart field. The `file` part is streamed into a fresh
/// upload staging directory under a collision-free name; other parts are
/// kept as text.
async fn stage_multipart(state: &AppState, mut multipart: Multipart) -> Result<StagedForm, AppError> {
    let root = &state.manager.config().upload_temp_folder;
    let staging_dir = create_staging_dir(root, Utc::now())
        .await
        .map_err(|err| AppError::internal(format!("creating upload staging: {}", err)))?;
    let mut form = StagedForm {
        staging_dir,
        file: None,
        fields: HashMap::new(),
    };

    match read_fields(&mut form, &mut multipart).await {
        Ok(()) => Ok(form),
        Err(err) => {
            form.discard().await;
            Err(err)
        }
    }
}

async fn read_fields(form: &mut StagedForm, multipart: &mut Multipart) -> Result<(), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name != "file" {
            let value = field
                .text()
                .await
                .map_err(|err| AppError::bad_request(format!("reading field `{}`: {}", name, err)))?;
            form.fields.insert(name, value);
            continue;
        }

        let original_name = field
            .file_name()
            .map(str::to_string)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| AppError::bad_request("file part has no file name"))?;
        let file_name = unique_file_name(&original_name);
        let path = form.staging_dir.join(&file_name);

        let stream = field.map(|chunk| chunk.map_err(io::Error::other));
        write_stream(&path, stream)
            .await
            .map_err(|err| AppError::internal(format!("spooling upload: {}", err)))?;

        let metadata = FileMetadata::from_local_file(&path, file_name, original_name)
            .await
            .map_err(|err| AppError::internal(err.to_string()))?;
        form.file = Some(metadata);
    }
    Ok(())
}

/// Stream chunks into `path`, flushing and syncing before returning.
async fn write_stream<S>(path: &FsPath, stream: S) -> io::Result<u64>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut file = File::create(path).await?;
    let mut written = 0u64;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// `<epoch-millis>_<8 hex>_<name>` with anything outside `[A-Za-z0-9._-]`
/// replaced. The random segment separates uploads within one millisecond.
fn unique_file_name(original: &str) -> String {
    let base = original.rsplit(['/', '\\']).next().unwrap_or(original);
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    let suffix = Uuid::new_v4().simple().to_string();
    let name = format!(
        "{}_{}_{}",
        Utc::now().timestamp_millis(),
        &suffix[..8],
        if sanitized.is_empty() { "upload" } else { sanitized }
    );
    debug_assert!(is_valid_file_name(&name));
    name
}

async fn file_response(path: &FsPath) -> Result<Response, AppError> {
    let file = File::open(path)
        .await
        .map_err(|err| AppError::internal(format!("opening {}: {}", path.display(), err)))?;
    let len = file
        .metadata()
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
        .len();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    Ok(stream_response(file, len, name))
}

fn stream_response(file: File, len: u64, name_or_key: &str) -> Response {
    let name = name_or_key.rsplit('/').next().unwrap_or(name_or_key);
    let mime = mime_guess::from_path(name).first_or_octet_stream();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        name.replace('"', "")
    )) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}
