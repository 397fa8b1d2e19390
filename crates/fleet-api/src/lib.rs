//! fleet-api — admin REST API for the fleet orchestrator.
//!
//! axum handlers over a [`Provisioner`] and an [`Autoscaler`]. JSON
//! responses use the `{success, data, error}` envelope; long-running
//! operations answer with an NDJSON progress stream.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/node` | List every node, whatever its status |
//! | POST | `/api/v1/node` | Register a node |
//! | DELETE | `/api/v1/node/{address}` | Deregister a node (`?rebalance=true` moves its units first) |
//! | POST | `/api/v1/node/rebalance` | Rebalance units (stream) |
//! | POST | `/api/v1/containers/move` | Move every unit off a node (stream) |
//! | POST | `/api/v1/container/{id}/move` | Move one unit (stream) |
//! | POST | `/api/v1/autoscale/run` | Run one auto-scale tick (stream) |
//! | GET | `/api/v1/autoscale` | Auto-scale settings and rules |
//! | GET/POST | `/api/v1/autoscale/rules` | List or store rules (JSON or form) |
//! | DELETE | `/api/v1/autoscale/rules/{pool}` | Remove a rule (`_default` for the default rule) |
//! | GET | `/api/v1/autoscale/history` | Auto-scale events, newest first (`?limit=`) |
//! | GET/POST | `/api/v1/docker/logs` | Per-pool container log config |

pub mod handlers;
pub mod response;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

use axum::Router;
use axum::routing::{delete, get, post};

use fleet_autoscale::Autoscaler;
use fleet_pipeline::Provisioner;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub provisioner: Provisioner,
    pub autoscaler: Autoscaler,
}

impl ApiState {
    pub fn new(autoscaler: Autoscaler) -> Self {
        Self {
            provisioner: autoscaler.provisioner().clone(),
            autoscaler,
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/node", get(handlers::list_nodes).post(handlers::add_node))
        .route("/node/rebalance", post(stream::rebalance))
        .route("/node/{address}", delete(handlers::remove_node))
        .route("/containers/move", post(stream::move_containers))
        .route("/container/{id}/move", post(stream::move_container))
        .route("/autoscale", get(handlers::autoscale_info))
        .route("/autoscale/run", post(stream::autoscale_run))
        .route(
            "/autoscale/rules",
            get(handlers::list_rules).post(handlers::set_autoscale_rule),
        )
        .route("/autoscale/rules/{pool}", delete(handlers::delete_autoscale_rule))
        .route("/autoscale/history", get(handlers::autoscale_history))
        .route(
            "/docker/logs",
            get(handlers::get_log_configs).post(handlers::set_log_config),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
