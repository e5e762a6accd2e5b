//! Node-facing handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::AppState;
use super::error::ApiError;
use super::extract::{ApiJson, NodeAuth};
use crate::enrollment::EnrollmentRequest;
use crate::nodes::CheckinReport;
use crate::storage::UpdateStatus;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollBody {
    pub token: String,
    pub hostname: String,
    pub hardware_fingerprint: Option<String>,
    pub lan_ip: Option<String>,
    pub wan_ip: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub node_id: i64,
    pub credential: String,
    pub checkin_interval: i64,
}

/// `POST /v1/enroll`
#[instrument(skip_all, fields(hostname = %body.hostname))]
pub async fn enroll(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<EnrollBody>,
) -> Result<Json<EnrollResponse>, ApiError> {
    let request = EnrollmentRequest {
        hostname: body.hostname,
        hardware_fingerprint: body.hardware_fingerprint,
        lan_ip: body.lan_ip,
        wan_ip: body.wan_ip,
    };
    let boot = state.broker.enrollment.redeem(&body.token, &request).await?;
    Ok(Json(EnrollResponse {
        node_id: boot.node_id,
        credential: boot.credential,
        checkin_interval: boot.checkin_interval,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPollResponse {
    pub has_command: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// `POST /v1/agent/commands/poll`
#[instrument(skip_all, fields(node_id = auth.0.id))]
pub async fn poll_command(
    State(state): State<AppState>,
    auth: NodeAuth,
) -> Result<Json<CommandPollResponse>, ApiError> {
    let polled = state.broker.commands.poll_next_command(auth.0.id).await?;
    Ok(Json(match polled {
        Some(cmd) => CommandPollResponse {
            has_command: true,
            command_id: Some(cmd.id),
            command: Some(cmd.command),
        },
        None => CommandPollResponse {
            has_command: false,
            command_id: None,
            command: None,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct CommandResultBody {
    pub success: bool,
    pub output: Option<String>,
}

/// `POST /v1/agent/commands/{id}/result`
#[instrument(skip_all, fields(node_id = auth.0.id, command_id = command_id))]
pub async fn command_result(
    State(state): State<AppState>,
    auth: NodeAuth,
    Path(command_id): Path<i64>,
    ApiJson(body): ApiJson<CommandResultBody>,
) -> Result<StatusCode, ApiError> {
    state
        .broker
        .commands
        .report_result(auth.0.id, command_id, body.success, body.output.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdatePollBody {
    pub agent_version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePollResponse {
    pub update_available: bool,
    pub current_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_payload_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'static str>,
}

/// `POST /v1/agent/updates/poll`
#[instrument(skip_all, fields(node_id = auth.0.id))]
pub async fn poll_update(
    State(state): State<AppState>,
    auth: NodeAuth,
    ApiJson(body): ApiJson<UpdatePollBody>,
) -> Result<Json<UpdatePollResponse>, ApiError> {
    let poll = state
        .broker
        .updates
        .poll_next_update(auth.0.id, &body.agent_version)
        .await?;

    let response = match poll.offer {
        Some(offer) => UpdatePollResponse {
            update_available: true,
            current_version: poll.current_version,
            new_version: Some(offer.target_version),
            update_id: Some(offer.update_id),
            update_payload_ref: Some(offer.payload_ref),
            payload_size: Some(offer.payload.size),
            payload_sha256: Some(offer.payload.sha256),
            instructions: Some(offer.instructions),
        },
        None => UpdatePollResponse {
            update_available: false,
            current_version: poll.current_version,
            new_version: None,
            update_id: None,
            update_payload_ref: None,
            payload_size: None,
            payload_sha256: None,
            instructions: None,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusBody {
    pub status: UpdateStatus,
}

/// `POST /v1/agent/updates/{id}/status`
#[instrument(skip_all, fields(node_id = auth.0.id, update_id = update_id))]
pub async fn update_status(
    State(state): State<AppState>,
    auth: NodeAuth,
    Path(update_id): Path<i64>,
    ApiJson(body): ApiJson<UpdateStatusBody>,
) -> Result<StatusCode, ApiError> {
    state
        .broker
        .updates
        .report_status(auth.0.id, update_id, body.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckinBody {
    pub lan_ip: Option<String>,
    pub wan_ip: Option<String>,
    pub agent_version: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinResponse {
    pub checkin_interval: i64,
}

/// `POST /v1/agent/checkin`
#[instrument(skip_all, fields(node_id = auth.0.id))]
pub async fn checkin(
    State(state): State<AppState>,
    auth: NodeAuth,
    ApiJson(body): ApiJson<CheckinBody>,
) -> Result<Json<CheckinResponse>, ApiError> {
    let report = CheckinReport {
        lan_ip: body.lan_ip,
        wan_ip: body.wan_ip,
        agent_version: body.agent_version,
    };
    let node = state.broker.nodes.checkin(auth.0.id, &report).await?;
    Ok(Json(CheckinResponse {
        checkin_interval: node.checkin_interval,
    }))
}

#[derive(Debug, Serialize)]
pub struct CredentialResponse {
    pub credential: String,
}

/// `POST /v1/agent/credential`
#[instrument(skip_all, fields(node_id = auth.0.id))]
pub async fn rotate_credential(
    State(state): State<AppState>,
    auth: NodeAuth,
) -> Result<Json<CredentialResponse>, ApiError> {
    let credential = state.broker.nodes.rotate_credential(auth.0.id).await?;
    Ok(Json(CredentialResponse { credential }))
}
