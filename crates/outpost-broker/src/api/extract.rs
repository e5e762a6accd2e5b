//! Request extractors: bearer tokens for node and operator routes, and JSON
//! bodies that reject with the API error shape.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::AppState;
use super::error::ApiError;
use crate::storage::Node;

fn bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The node whose credential authenticated the request.
#[derive(Debug, Clone)]
pub struct NodeAuth(pub Node);

impl FromRequestParts<AppState> for NodeAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let secret = bearer(parts).ok_or_else(ApiError::unauthorized)?;
        let node = state.broker.nodes.authenticate(secret).await.map_err(|e| {
            debug!(error = %e, "Node authentication failed");
            ApiError::from(e)
        })?;
        Ok(Self(node))
    }
}

/// Proof that the request carried the operator token.
#[derive(Debug, Clone, Copy)]
pub struct OperatorAuth;

impl FromRequestParts<AppState> for OperatorAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = bearer(parts).ok_or_else(ApiError::unauthorized)?;
        if bool::from(token.as_bytes().ct_eq(state.operator_token.as_bytes())) {
            Ok(Self)
        } else {
            debug!("Operator token mismatch");
            Err(ApiError::unauthorized())
        }
    }
}

/// `Json<T>` whose rejections are `VALIDATION_ERROR` bodies.
#[derive(Debug, Clone)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}
