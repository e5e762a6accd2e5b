//! HTTP/JSON surface of the broker.
//!
//! Node routes live under `/v1/agent` (plus `/v1/enroll`) and authenticate
//! with the node's bearer credential; everything else under `/v1` requires
//! the operator token.

mod agent;
mod error;
mod extract;
mod operator;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

use crate::broker::Broker;

pub use error::ApiError;
pub use extract::{ApiJson, NodeAuth, OperatorAuth};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub operator_token: Arc<str>,
}

impl AppState {
    pub fn new(broker: Broker, operator_token: &str) -> Self {
        Self {
            broker,
            operator_token: Arc::from(operator_token),
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let agent_routes = Router::new()
        .route("/commands/poll", post(agent::poll_command))
        .route("/commands/{id}/result", post(agent::command_result))
        .route("/updates/poll", post(agent::poll_update))
        .route("/updates/{id}/status", post(agent::update_status))
        .route("/checkin", post(agent::checkin))
        .route("/credential", post(agent::rotate_credential));

    let v1 = Router::new()
        .route("/enroll", post(agent::enroll))
        .nest("/agent", agent_routes)
        .route("/enrollment-tokens", post(operator::issue_token))
        .route("/nodes", get(operator::list_nodes))
        .route("/nodes/{id}", get(operator::get_node))
        .route("/nodes/{id}/commands", post(operator::enqueue_command))
        .route("/nodes/{id}/updates", post(operator::schedule_update))
        .route(
            "/nodes/{id}/tunnel",
            post(operator::open_tunnel).get(operator::get_tunnel),
        )
        .route("/tunnels/{id}", delete(operator::close_tunnel))
        .route("/proxy-requests", post(operator::enqueue_proxy_request))
        .route("/proxy-requests/claim", post(operator::claim_proxy_request))
        .route("/proxy-requests/{id}", get(operator::proxy_request_status))
        .route(
            "/proxy-requests/{id}/complete",
            post(operator::complete_proxy_request),
        )
        .route("/audit", get(operator::list_audit));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
