use crate::error::AppError;
use crate::models::artifact::{scan_local_dir, ArtifactLocation, BackupArtifact};
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_artifacts))
}

#[derive(Serialize)]
pub struct ArtifactListing {
    pub local: Vec<BackupArtifact>,
    /// `None` when offsite replication is disabled
    pub offsite: Option<Vec<BackupArtifact>>,
    pub offsite_error: Option<String>,
}

fn newest_first(artifacts: &mut [BackupArtifact]) {
    artifacts.sort_by(|a, b| b.effective_time().cmp(&a.effective_time()));
}

/// Local and offsite archives, newest first.
pub fn collect_artifacts(state: &AppState) -> anyhow::Result<ArtifactListing> {
    let mut local = scan_local_dir(&state.config.local_dir())?;
    newest_first(&mut local);

    let (offsite, offsite_error) = if state.config.offsite.enabled {
        match state.offsite.open().and_then(|store| store.list()) {
            Ok(entries) => {
                let mut artifacts: Vec<BackupArtifact> = entries
                    .into_iter()
                    .map(|e| {
                        BackupArtifact::new(e.name.clone(), ArtifactLocation::Offsite(e.name))
                            .with_size(e.size.unwrap_or(0))
                            .with_modified(e.modified)
                    })
                    .collect();
                newest_first(&mut artifacts);
                (Some(artifacts), None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Offsite listing failed");
                (None, Some(e.to_string()))
            }
        }
    } else {
        (None, None)
    };

    Ok(ArtifactListing {
        local,
        offsite,
        offsite_error,
    })
}

async fn list_artifacts(State(state): State<Arc<AppState>>) -> Result<Json<ArtifactListing>, AppError> {
    let listing = tokio::task::spawn_blocking(move || collect_artifacts(&state)).await??;
    Ok(Json(listing))
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::testing::send;
    use crate::state::testing::Harness;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_lists_local_and_offsite_newest_first() {
        let h = Harness::new(|c| c.offsite.enabled = true);
        std::fs::create_dir_all(h.local_dir()).unwrap();
        for name in [
            "vzdump-qemu-100-2024_01_10-02_00_00.vma.zst",
            "vzdump-qemu-100-2024_01_12-02_00_00.vma.zst",
            "notes.txt",
        ] {
            std::fs::write(h.local_dir().join(name), b"x").unwrap();
        }
        h.offsite.insert("vzdump-lxc-200-2024_01_11-02_00_00.tar.zst", b"xyz", None);

        let (status, body) = send(create_router(h.state.clone()), "GET", "/api/artifacts", None).await;
        assert_eq!(status, StatusCode::OK);

        let local = body["local"].as_array().unwrap();
        assert_eq!(local.len(), 2);
        assert_eq!(local[0]["filename"], "vzdump-qemu-100-2024_01_12-02_00_00.vma.zst");
        assert_eq!(local[0]["vmid"], "100");

        let offsite = body["offsite"].as_array().unwrap();
        assert_eq!(offsite.len(), 1);
        assert_eq!(offsite[0]["kind"], "container");
        assert_eq!(offsite[0]["size"], 3);
    }

    #[tokio::test]
    async fn test_offsite_failure_is_reported_inline() {
        let h = Harness::new(|c| c.offsite.enabled = true);
        h.offsite.set_unreachable(true);

        let (status, body) = send(create_router(h.state.clone()), "GET", "/api/artifacts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["offsite"].is_null());
        assert!(body["offsite_error"].as_str().is_some());
    }
}
