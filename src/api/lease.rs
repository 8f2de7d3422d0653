//! Split-setup endpoints: a front end prepares a session here, relays the
//! upstream stream itself, then hands the account back.

use std::sync::Arc;

use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::completion::{setup_upstream, target_account, with_account};
use crate::error::GatewayError;
use crate::protocol::prepare_chat_request;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ReleaseRequest {
    #[serde(default)]
    lease_id: String,
}

/// `POST /v1/chat/completions?__stream_prepare=1`
pub async fn prepare_handler(state: Arc<AppState>, headers: &http::HeaderMap, body: &Bytes) -> Response {
    if let Err(err) = state
        .authenticate_internal(headers)
        .and_then(|()| state.authenticate(headers))
    {
        return err.into_response();
    }
    let prepared = match prepare_chat_request(body) {
        Ok(prepared) => prepared,
        Err(err) => return err.into_response(),
    };
    let prepared_ref = &prepared;
    let state_ref = state.as_ref();
    let outcome = with_account(state_ref, target_account(headers), |account| async move {
        let result = setup_upstream(state_ref, account.account(), prepared_ref).await;
        (account, result)
    })
    .await;
    let (account, setup) = match outcome {
        Ok(outcome) => outcome,
        Err(err) => return err.into_response(),
    };

    let account_id = account.id().to_string();
    let lease_id = state.leases.hold(account);
    info!(account = %account_id, lease = %lease_id, "stream lease prepared");
    Json(json!({
        "session_id": setup.session_id,
        "lease_id": lease_id,
        "challenge": setup.challenge,
        "payload": setup.payload,
        "final_prompt": prepared.prompt,
        "model": prepared.model.id,
        "thinking_enabled": prepared.model.thinking_enabled,
        "search_enabled": prepared.model.search_enabled,
        "tool_names": prepared.tool_names,
    }))
    .into_response()
}

/// `POST /v1/chat/completions?__stream_release=1`
pub async fn release_handler(state: Arc<AppState>, headers: &http::HeaderMap, body: &Bytes) -> Response {
    if let Err(err) = state.authenticate_internal(headers) {
        return err.into_response();
    }
    let request: ReleaseRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            return GatewayError::InvalidRequest(format!("Invalid release body: {err}"))
                .into_response()
        }
    };
    if request.lease_id.trim().is_empty() {
        return GatewayError::InvalidRequest("lease_id is required".to_string()).into_response();
    }
    let success = state.leases.release(&request.lease_id);
    Json(json!({"success": success})).into_response()
}

/// `GET /v1/leases`
pub fn stats_handler(state: &AppState, headers: &http::HeaderMap) -> Response {
    if let Err(err) = state.authenticate_internal(headers) {
        return err.into_response();
    }
    Json(json!({
        "leases": state.leases.stats(),
        "accounts": state.pool.status(),
    }))
    .into_response()
}
