//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> SQLite connectivity plus a write probe in the object
//!   root and both staging roots

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// HTTP 200 when every check passes, 503 otherwise. Each check reports its
/// own error so operators can tell a locked database from a full disk.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    checks.insert("sqlite", sqlite);

    let config = state.manager.config();
    checks.insert("objects", probe_dir(state.storage.base_path()).await);
    checks.insert("downloads", probe_dir(&config.download_temp_folder).await);
    checks.insert("uploads", probe_dir(&config.upload_temp_folder).await);

    let overall_ok = checks.values().all(|c| c.ok);
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if overall_ok { "ok" } else { "error" },
            checks,
        }),
    )
}

/// Write, read back and remove a scratch file in `dir`.
async fn probe_dir(dir: &Path) -> CheckStatus {
    let tmp_path = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp_path, b"readyz").await {
        return CheckStatus::failed(format!("could not write tmp file: {}", e));
    }
    let read = fs::read(&tmp_path).await;
    let removed = fs::remove_file(&tmp_path).await;
    match (read, removed) {
        (Ok(bytes), _) if bytes != b"readyz" => CheckStatus::failed("file content mismatch".into()),
        (Ok(_), Ok(())) => CheckStatus::ok(),
        (Ok(_), Err(e)) => CheckStatus {
            ok: true,
            error: Some(format!("could not remove tmp file: {}", e)),
        },
        (Err(e), _) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize, Debug)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_reports_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(probe_dir(dir.path()).await.ok);

        let missing = probe_dir(&dir.path().join("absent")).await;
        assert!(!missing.ok);
        assert!(missing.error.unwrap().contains("could not write"));
    }
}
