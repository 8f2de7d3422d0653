use std::sync::Arc;

use axum::response::Response;
use bytes::Bytes;

use super::completion::{handle_completion, ClientProtocol};
use crate::state::AppState;

/// `POST /v1/responses`
pub async fn handler(state: Arc<AppState>, headers: http::HeaderMap, body: Bytes) -> Response {
    handle_completion(state, &headers, &body, ClientProtocol::Responses).await
}
