use crate::error::AppError;
use crate::models::artifact::{is_safe_filename, parse_restore_request, ArtifactSource};
use crate::services::restore_engine::{self, RestoreRefusal};
use crate::services::scheduler::trigger_backup;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/backup/run", post(run_backup))
        .route("/api/restore", post(run_restore))
}

async fn run_backup(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    state.coordinator.check_admission()?;

    tokio::spawn(trigger_backup(state, "api"));

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "started": true }))))
}

/// Either `{ "filename", "source" }` or `{ "request": "source|filename" }`.
#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub filename: Option<String>,
    pub source: Option<String>,
    pub request: Option<String>,
}

impl RestoreRequest {
    fn resolve(self) -> Result<(ArtifactSource, String), String> {
        if let Some(request) = self.request {
            return parse_restore_request(&request);
        }
        let filename = self
            .filename
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .ok_or("filename is required")?;
        let source = match self.source {
            Some(source) => source.parse()?,
            None => ArtifactSource::Local,
        };
        Ok((source, filename))
    }
}

async fn run_restore(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let (source, filename) = body.resolve().map_err(AppError::BadRequest)?;

    if !state.config.restore.enabled {
        return Err(RestoreRefusal::Disabled.into());
    }
    state.coordinator.check_admission()?;
    if matches!(source, ArtifactSource::Local)
        && is_safe_filename(&filename)
        && !state.config.local_dir().join(&filename).is_file()
    {
        return Err(AppError::NotFound(format!("local archive not found: {filename}")));
    }

    let response = serde_json::json!({
        "started": true,
        "filename": filename,
        "source": source,
    });

    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || restore_engine::run_restore_job(&state, &filename, source)).await;
        match result {
            Ok(Ok(outcome)) => tracing::debug!(success = outcome.success, "Restore request finished"),
            Ok(Err(refusal)) => tracing::info!(reason = %refusal, "Restore request dropped"),
            Err(e) => tracing::error!(error = %e, "Restore task panicked"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::testing::send;
    use crate::state::testing::Harness;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_backup_rejected_while_restore_runs() {
        let h = Harness::new(|_| {});
        let _restore = h.state.coordinator.try_begin_restore().unwrap();

        let (status, body) = send(create_router(h.state.clone()), "POST", "/api/backup/run", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "restore in progress, restore has priority");
    }

    #[tokio::test]
    async fn test_backup_accepted_when_idle() {
        let h = Harness::new(|c| c.ssh.password.clear());
        let (status, body) = send(create_router(h.state.clone()), "POST", "/api/backup/run", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["started"], true);
    }

    #[tokio::test]
    async fn test_restore_disabled_is_forbidden() {
        let h = Harness::new(|_| {});
        let (status, _) = send(
            create_router(h.state.clone()),
            "POST",
            "/api/restore",
            Some(json!({ "request": "local|vzdump-qemu-100-2024_01_15-02_00_03.vma.zst" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_restore_request_validation() {
        let h = Harness::new(|c| c.restore.enabled = true);
        let app = create_router(h.state.clone());

        let (status, _) = send(app.clone(), "POST", "/api/restore", Some(json!({ "request": "no-separator" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app.clone(), "POST", "/api/restore", Some(json!({ "source": "local" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            app,
            "POST",
            "/api/restore",
            Some(json!({ "filename": "a.vma.zst", "source": "tape" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_restore_accepted() {
        let h = Harness::new(|c| c.restore.enabled = true);
        let (status, body) = send(
            create_router(h.state.clone()),
            "POST",
            "/api/restore",
            Some(json!({ "filename": "vzdump-qemu-100-2024_01_15-02_00_03.vma.zst", "source": "webdav" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["source"], "offsite");
    }

    #[tokio::test]
    async fn test_restore_of_missing_local_archive_is_not_found() {
        let h = Harness::new(|c| c.restore.enabled = true);
        let (status, body) = send(
            create_router(h.state.clone()),
            "POST",
            "/api/restore",
            Some(json!({ "request": "local|vzdump-qemu-100-2024_01_15-02_00_03.vma.zst" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "local archive not found: vzdump-qemu-100-2024_01_15-02_00_03.vma.zst");
    }

    #[tokio::test]
    async fn test_restore_rejected_while_backup_runs() {
        let h = Harness::new(|c| c.restore.enabled = true);
        let _backup = h.state.coordinator.try_begin_backup().unwrap();
        let (status, body) = send(
            create_router(h.state.clone()),
            "POST",
            "/api/restore",
            Some(json!({ "request": "local|vzdump-qemu-100-2024_01_15-02_00_03.vma.zst" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "backup already running");
    }
}
