use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::models::models_list_json;
use crate::state::AppState;

/// List the public model catalogue in `OpenAI` format.
#[must_use]
pub fn handler(state: &AppState, headers: &HeaderMap) -> Response {
    if let Err(err) = state.authenticate(headers) {
        return err.into_response();
    }
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/json"),
        )],
        Body::from(models_list_json().to_string()),
    )
        .into_response()
}
