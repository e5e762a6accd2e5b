//! Operator-facing handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use super::AppState;
use super::error::ApiError;
use super::extract::{ApiJson, OperatorAuth};
use crate::storage::{AuditRecord, Node, NodeStatus, ProxyRequest, RequestStatus, TunnelSession};

const DEFAULT_AUDIT_LIMIT: i64 = 100;
const MAX_AUDIT_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenBody {
    pub ttl_days: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenResponse {
    pub token: String,
    pub expires_at: i64,
    pub active_token_count: i64,
}

/// `POST /v1/enrollment-tokens`
#[instrument(skip_all, fields(ttl_days = body.ttl_days))]
pub async fn issue_token(
    _: OperatorAuth,
    State(state): State<AppState>,
    ApiJson(body): ApiJson<IssueTokenBody>,
) -> Result<(StatusCode, Json<IssueTokenResponse>), ApiError> {
    let issued = state.broker.enrollment.issue(body.ttl_days).await?;
    Ok((
        StatusCode::CREATED,
        Json(IssueTokenResponse {
            token: issued.token,
            expires_at: issued.expires_at,
            active_token_count: issued.active_token_count,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: i64,
    pub hostname: String,
    pub status: NodeStatus,
    pub lan_ip: Option<String>,
    pub wan_ip: Option<String>,
    pub agent_version: Option<String>,
    pub hardware_fingerprint: Option<String>,
    pub checkin_interval: i64,
    pub last_checkin: Option<i64>,
    pub created_at: i64,
}

impl From<Node> for NodeView {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            hostname: node.hostname,
            status: node.status,
            lan_ip: node.lan_ip,
            wan_ip: node.wan_ip,
            agent_version: node.agent_version,
            hardware_fingerprint: node.hardware_fingerprint,
            checkin_interval: node.checkin_interval,
            last_checkin: node.last_checkin,
            created_at: node.created_at,
        }
    }
}

/// `GET /v1/nodes`
pub async fn list_nodes(
    _: OperatorAuth,
    State(state): State<AppState>,
) -> Result<Json<Vec<NodeView>>, ApiError> {
    let nodes = state.broker.nodes.list().await?;
    Ok(Json(nodes.into_iter().map(NodeView::from).collect()))
}

/// `GET /v1/nodes/{id}`
pub async fn get_node(
    _: OperatorAuth,
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
) -> Result<Json<NodeView>, ApiError> {
    Ok(Json(state.broker.nodes.get(node_id).await?.into()))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueCommandBody {
    pub command: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueCommandResponse {
    pub command_id: i64,
}

/// `POST /v1/nodes/{id}/commands`
#[instrument(skip_all, fields(node_id = node_id))]
pub async fn enqueue_command(
    _: OperatorAuth,
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    ApiJson(body): ApiJson<EnqueueCommandBody>,
) -> Result<(StatusCode, Json<EnqueueCommandResponse>), ApiError> {
    let command = state.broker.commands.enqueue(node_id, &body.command).await?;
    Ok((
        StatusCode::CREATED,
        Json(EnqueueCommandResponse {
            command_id: command.id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdateBody {
    pub version: String,
    pub payload_ref: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdateResponse {
    pub update_id: i64,
}

/// `POST /v1/nodes/{id}/updates`
#[instrument(skip_all, fields(node_id = node_id, version = %body.version))]
pub async fn schedule_update(
    _: OperatorAuth,
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    ApiJson(body): ApiJson<ScheduleUpdateBody>,
) -> Result<(StatusCode, Json<ScheduleUpdateResponse>), ApiError> {
    let update = state
        .broker
        .updates
        .schedule(node_id, &body.version, &body.payload_ref)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ScheduleUpdateResponse {
            update_id: update.id,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenTunnelBody {
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelView {
    pub session_id: i64,
    pub node_id: i64,
    pub tunnel_port: i64,
    pub secondary_port: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

impl From<TunnelSession> for TunnelView {
    fn from(session: TunnelSession) -> Self {
        Self {
            session_id: session.id,
            node_id: session.node_id,
            tunnel_port: session.port,
            secondary_port: session.secondary_port,
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

/// `POST /v1/nodes/{id}/tunnel`
#[instrument(skip_all, fields(node_id = node_id))]
pub async fn open_tunnel(
    _: OperatorAuth,
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    ApiJson(body): ApiJson<OpenTunnelBody>,
) -> Result<(StatusCode, Json<TunnelView>), ApiError> {
    let session = state
        .broker
        .tunnels
        .open_session(node_id, body.ttl_secs)
        .await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// `GET /v1/nodes/{id}/tunnel`
///
/// 404 without a session, 410 when the session is past expiry but not yet reaped.
pub async fn get_tunnel(
    _: OperatorAuth,
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
) -> Result<Json<TunnelView>, ApiError> {
    match state.broker.tunnels.get_active_session(node_id).await? {
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("No tunnel session for node {node_id}"),
        )),
        Some(lease) if lease.stale => Err(ApiError::new(
            StatusCode::GONE,
            "TUNNEL_STALE",
            format!("Tunnel session {} has expired", lease.session.id),
        )),
        Some(lease) => Ok(Json(lease.session.into())),
    }
}

/// `DELETE /v1/tunnels/{id}`
#[instrument(skip_all, fields(session_id = session_id))]
pub async fn close_tunnel(
    _: OperatorAuth,
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.broker.tunnels.close_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueProxyBody {
    pub node_id: i64,
    pub tunnel_port: i64,
    pub action: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueProxyResponse {
    pub request_id: i64,
}

/// `POST /v1/proxy-requests`
#[instrument(skip_all, fields(node_id = body.node_id, tunnel_port = body.tunnel_port))]
pub async fn enqueue_proxy_request(
    _: OperatorAuth,
    State(state): State<AppState>,
    ApiJson(body): ApiJson<EnqueueProxyBody>,
) -> Result<(StatusCode, Json<EnqueueProxyResponse>), ApiError> {
    let request = state
        .broker
        .requests
        .enqueue(body.node_id, body.tunnel_port, body.action.as_ref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(EnqueueProxyResponse {
            request_id: request.id,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequestView {
    pub id: i64,
    pub node_id: i64,
    pub tunnel_port: i64,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl From<ProxyRequest> for ProxyRequestView {
    fn from(request: ProxyRequest) -> Self {
        Self {
            id: request.id,
            node_id: request.node_id,
            tunnel_port: request.tunnel_port,
            status: request.status,
            action: request
                .action
                .as_deref()
                .and_then(|a| serde_json::from_str(a).ok()),
            created_at: request.created_at,
            updated_at: request.updated_at,
            completed_at: request.completed_at,
            result: request.result,
        }
    }
}

/// `GET /v1/proxy-requests/{id}`
pub async fn proxy_request_status(
    _: OperatorAuth,
    State(state): State<AppState>,
    Path(request_id): Path<i64>,
) -> Result<Json<ProxyRequestView>, ApiError> {
    Ok(Json(state.broker.requests.get_status(request_id).await?.into()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaimProxyBody {
    pub node_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ClaimProxyResponse {
    pub request: Option<ProxyRequestView>,
}

/// `POST /v1/proxy-requests/claim`
#[instrument(skip_all, fields(node_id = ?body.node_id))]
pub async fn claim_proxy_request(
    _: OperatorAuth,
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ClaimProxyBody>,
) -> Result<Json<ClaimProxyResponse>, ApiError> {
    let claimed = state.broker.requests.claim_next(body.node_id).await?;
    Ok(Json(ClaimProxyResponse {
        request: claimed.map(ProxyRequestView::from),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteProxyBody {
    pub success: bool,
    pub result: Option<String>,
}

/// `POST /v1/proxy-requests/{id}/complete`
#[instrument(skip_all, fields(request_id = request_id))]
pub async fn complete_proxy_request(
    _: OperatorAuth,
    State(state): State<AppState>,
    Path(request_id): Path<i64>,
    ApiJson(body): ApiJson<CompleteProxyBody>,
) -> Result<StatusCode, ApiError> {
    state
        .broker
        .requests
        .complete(request_id, body.success, body.result.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub category: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditView {
    pub id: i64,
    pub category: String,
    pub message: String,
    pub details: Value,
    pub node_id: Option<i64>,
    pub created_at: i64,
}

impl From<AuditRecord> for AuditView {
    fn from(record: AuditRecord) -> Self {
        Self {
            id: record.id,
            category: record.category,
            message: record.message,
            details: serde_json::from_str(&record.details).unwrap_or(Value::Null),
            node_id: record.node_id,
            created_at: record.created_at,
        }
    }
}

/// `GET /v1/audit?category=&limit=`
pub async fn list_audit(
    _: OperatorAuth,
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditView>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);
    let records = state
        .broker
        .db
        .list_audit(query.category.as_deref(), limit)
        .await
        .map_err(crate::error::BrokerError::from)?;
    Ok(Json(records.into_iter().map(AuditView::from).collect()))
}
