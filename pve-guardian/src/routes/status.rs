use crate::error::AppError;
use crate::models::artifact::scan_local_dir;
use crate::remote::SshTarget;
use crate::services::coordinator::Activity;
use crate::services::host::{probe_host, HostStatus};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_status))
}

#[derive(Deserialize)]
pub struct StatusQuery {
    /// Skip the SSH and WebDAV round-trips
    pub live: Option<bool>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub activity: Activity,
    pub local_count: usize,
    pub offsite_count: Option<usize>,
    pub schedule: Option<String>,
    /// `None` when the host could not be reached or was not asked
    pub host: Option<HostStatus>,
    pub host_error: Option<String>,
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    let live = query.live.unwrap_or(true);
    let activity = state.coordinator.activity();

    let local_dir = state.config.local_dir();
    let local_count = tokio::task::spawn_blocking(move || scan_local_dir(&local_dir))
        .await?
        .map_err(|e| AppError::Internal(e.into()))?
        .len();

    let (host, host_error) = if live {
        let state = state.clone();
        tokio::task::spawn_blocking(move || match SshTarget::from_config(&state.config.ssh) {
            Ok(target) => {
                let status = probe_host(state.connector.as_ref(), &target);
                if status.online {
                    (Some(status), None)
                } else {
                    (None, status.error)
                }
            }
            Err(e) => (None, Some(e.to_string())),
        })
        .await?
    } else {
        (None, None)
    };

    let offsite_count = if live && state.config.offsite.enabled {
        let state = state.clone();
        tokio::task::spawn_blocking(move || {
            state
                .offsite
                .open()
                .and_then(|store| store.list())
                .map(|entries| entries.len())
                .map_err(|e| tracing::debug!(error = %e, "Offsite listing failed for status"))
                .ok()
        })
        .await?
    } else {
        None
    };

    let schedule = state
        .config
        .schedule
        .enabled
        .then(|| state.config.schedule.cron.clone());

    Ok(Json(StatusResponse {
        activity,
        local_count,
        offsite_count,
        schedule,
        host,
        host_error,
    }))
}
