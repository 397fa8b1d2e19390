//! Streaming handlers. Each runs its operation on a detached task and
//! answers with the progress stream as NDJSON (`application/x-json-stream`).
//! An operation error becomes the last `{"Error": ...}` line.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use fleet_autoscale::AutoscaleError;
use fleet_core::Progress;
use fleet_pipeline::{PipelineError, RebalanceFilter};

use crate::ApiState;
use crate::response::{HttpStatus, error_response};

pub const JSON_STREAM: &str = "application/x-json-stream";

/// Run `op` in the background and stream its progress.
pub(crate) fn ndjson<F, Fut, E>(op: F) -> Response
where
    F: FnOnce(Progress) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (progress, rx) = Progress::channel();
    let task = op(progress.clone());
    tokio::spawn(async move {
        if let Err(e) = task.await {
            warn!(error = %e, "streamed operation failed");
            progress.error(e.to_string());
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_line()));
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_STREAM));
    response
}

// ── Moves ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MoveContainerRequest {
    #[serde(default)]
    pub to: String,
}

/// POST /api/v1/container/{id}/move
pub async fn move_container(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<MoveContainerRequest>,
) -> Response {
    if req.to.is_empty() {
        return error_response(
            &format!("Invalid params: id: {id:?} - to: {:?}", req.to),
            StatusCode::BAD_REQUEST,
        );
    }
    let cluster = state.provisioner.cluster();
    if let Err(e) = cluster.get_container(&id) {
        return e.into_error_response();
    }
    if let Err(e) = cluster.get_node(&req.to) {
        return e.into_error_response();
    }

    let owner = state.provisioner.locker().new_owner("container-move");
    ndjson(move |progress| async move {
        state
            .provisioner
            .move_container(&owner, &id, Some(&req.to), &progress)
            .await?;
        progress.message("Containers moved successfully!\n");
        Ok::<_, PipelineError>(())
    })
}

#[derive(Debug, Deserialize)]
pub struct MoveContainersRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

/// POST /api/v1/containers/move
pub async fn move_containers(
    State(state): State<ApiState>,
    Json(req): Json<MoveContainersRequest>,
) -> Response {
    if req.from.is_empty() || req.to.is_empty() {
        return error_response(
            &format!("Invalid params: from: {:?} - to: {:?}", req.from, req.to),
            StatusCode::BAD_REQUEST,
        );
    }
    let cluster = state.provisioner.cluster();
    for address in [&req.from, &req.to] {
        if let Err(e) = cluster.get_node(address) {
            return e.into_error_response();
        }
    }

    let owner = state.provisioner.locker().new_owner("containers-move");
    ndjson(move |progress| async move {
        state
            .provisioner
            .move_containers(&owner, &req.from, Some(&req.to), &progress)
            .await?;
        progress.message("Containers moved successfully!\n");
        Ok::<_, PipelineError>(())
    })
}

// ── Rebalance ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequest {
    #[serde(default)]
    pub dry: bool,
    #[serde(default)]
    pub metadata_filter: HashMap<String, String>,
    #[serde(default)]
    pub app_filter: Vec<String>,
}

/// POST /api/v1/node/rebalance
pub async fn rebalance(
    State(state): State<ApiState>,
    Json(req): Json<RebalanceRequest>,
) -> Response {
    let owner = state.provisioner.locker().new_owner("node-rebalance");
    let filter = RebalanceFilter {
        metadata: req.metadata_filter,
        apps: req.app_filter,
    };
    let dry = req.dry;
    ndjson(move |progress| async move {
        progress.message(format!("Rebalancing units - dry: {dry}\n"));
        let moves = state
            .provisioner
            .rebalance_containers(&owner, &filter, dry, &progress)
            .await?;
        if !dry && !moves.is_empty() {
            progress.message("Units successfully rebalanced!\n");
        }
        Ok::<_, PipelineError>(())
    })
}

// ── Auto-scale ─────────────────────────────────────────────────────

/// POST /api/v1/autoscale/run
pub async fn autoscale_run(State(state): State<ApiState>) -> Response {
    ndjson(move |progress| async move {
        state.autoscaler.run_once(&progress).await?;
        Ok::<_, AutoscaleError>(())
    })
}
