//! JSON handlers: nodes, auto-scale rules and history, log config.

use axum::Json;
use axum::extract::{Form, FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use fleet_autoscale::set_rule;
use fleet_pipeline::NodeRequest;
use fleet_registry::{AutoScaleRule, LogConfig};

use crate::ApiState;
use crate::response::{ApiResponse, HttpStatus, error_response};

/// Path segment that addresses the default rule (`""`).
pub const DEFAULT_RULE_KEY: &str = "_default";

/// Body extractor that takes JSON or `application/x-www-form-urlencoded`.
pub struct JsonOrForm<T>(pub T);

impl<S, T> FromRequest<S> for JsonOrForm<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            let Form(value) = Form::<T>::from_request(req, state)
                .await
                .map_err(|rej| error_response(&rej.body_text(), rej.status()))?;
            Ok(Self(value))
        } else {
            let Json(value) = Json::<T>::from_request(req, state)
                .await
                .map_err(|rej| error_response(&rej.body_text(), rej.status()))?;
            Ok(Self(value))
        }
    }
}

// ── Nodes ──────────────────────────────────────────────────────────

/// GET /api/v1/node
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    match state.provisioner.cluster().unfiltered_nodes() {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => e.into_error_response(),
    }
}

/// POST /api/v1/node
pub async fn add_node(State(state): State<ApiState>, Json(req): Json<NodeRequest>) -> Response {
    match state.provisioner.add_node(req).await {
        Ok(node) => (StatusCode::CREATED, ApiResponse::ok(node)).into_response(),
        Err(e) => e.into_error_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveNodeQuery {
    #[serde(default)]
    pub rebalance: bool,
}

/// DELETE /api/v1/node/{address}
pub async fn remove_node(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    Query(query): Query<RemoveNodeQuery>,
) -> Response {
    let owner = state.provisioner.locker().new_owner("node-remove");
    match state
        .provisioner
        .remove_node(&owner, &address, query.rebalance, &fleet_core::Progress::discard())
        .await
    {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => e.into_error_response(),
    }
}

// ── Auto-scale ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct AutoscaleInfo {
    pub enabled: bool,
    /// Tick interval in seconds.
    pub interval: u64,
    pub rules: Vec<AutoScaleRule>,
}

/// GET /api/v1/autoscale
pub async fn autoscale_info(State(state): State<ApiState>) -> Response {
    let config = state.autoscaler.config();
    match state.autoscaler.rules() {
        Ok(rules) => ApiResponse::ok(AutoscaleInfo {
            enabled: config.enabled,
            interval: config.interval().as_secs(),
            rules,
        })
        .into_response(),
        Err(e) => e.into_error_response(),
    }
}

/// GET /api/v1/autoscale/rules
pub async fn list_rules(State(state): State<ApiState>) -> Response {
    match state.autoscaler.rules() {
        Ok(rules) => ApiResponse::ok(rules).into_response(),
        Err(e) => e.into_error_response(),
    }
}

/// Rule as submitted by an operator. `enabled` defaults to true.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRequest {
    #[serde(default)]
    pub metadata_filter: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_container_count: u32,
    #[serde(default)]
    pub max_memory_ratio: f64,
    #[serde(default)]
    pub scale_down_ratio: f64,
    #[serde(default)]
    pub prevent_rebalance: bool,
}

impl From<RuleRequest> for AutoScaleRule {
    fn from(req: RuleRequest) -> Self {
        AutoScaleRule {
            metadata_filter: req.metadata_filter,
            enabled: req.enabled.unwrap_or(true),
            max_container_count: req.max_container_count,
            max_memory_ratio: req.max_memory_ratio,
            scale_down_ratio: req.scale_down_ratio,
            prevent_rebalance: req.prevent_rebalance,
        }
    }
}

/// POST /api/v1/autoscale/rules
pub async fn set_autoscale_rule(
    State(state): State<ApiState>,
    JsonOrForm(req): JsonOrForm<RuleRequest>,
) -> Response {
    let store = state.provisioner.cluster().store();
    match set_rule(store, req.into()) {
        Ok(rule) => {
            info!(pool = %rule.metadata_filter, enabled = rule.enabled, "autoscale rule stored");
            ApiResponse::ok(rule).into_response()
        }
        Err(e) => e.into_error_response(),
    }
}

/// DELETE /api/v1/autoscale/rules/{pool}
pub async fn delete_autoscale_rule(
    State(state): State<ApiState>,
    Path(pool): Path<String>,
) -> Response {
    let key = if pool == DEFAULT_RULE_KEY { "" } else { pool.as_str() };
    match state.provisioner.cluster().store().delete_rule(key) {
        Ok(true) => {
            info!(pool = %key, "autoscale rule removed");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("rule not found", StatusCode::NOT_FOUND),
        Err(e) => e.into_error_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// Most recent events to return; absent or 0 returns all.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/v1/autoscale/history
pub async fn autoscale_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(usize::MAX);
    match state.autoscaler.history(limit) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => e.into_error_response(),
    }
}

// ── Log config ─────────────────────────────────────────────────────

/// GET /api/v1/docker/logs
pub async fn get_log_configs(State(state): State<ApiState>) -> Response {
    match state.provisioner.cluster().store().list_log_configs() {
        Ok(configs) => ApiResponse::ok(configs).into_response(),
        Err(e) => e.into_error_response(),
    }
}

/// POST /api/v1/docker/logs
pub async fn set_log_config(
    State(state): State<ApiState>,
    Json(config): Json<LogConfig>,
) -> Response {
    if config.driver.trim().is_empty() {
        return error_response("log driver is required", StatusCode::BAD_REQUEST);
    }
    match state.provisioner.cluster().store().put_log_config(&config) {
        Ok(()) => {
            info!(pool = %config.pool, driver = %config.driver, "log config updated");
            ApiResponse::ok(config).into_response()
        }
        Err(e) => e.into_error_response(),
    }
}
