use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::{chat, health, lease, models, responses};
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;
const STREAM_PREPARE_PARAM: &str = "__stream_prepare";
const STREAM_RELEASE_PARAM: &str = "__stream_release";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteMatch {
    Health,
    Models,
    ChatCompletions,
    StreamPrepare,
    StreamRelease,
    Responses,
    LeaseStats,
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(
        &parts.method,
        parts.uri.path(),
        parts.uri.query(),
        base_path.as_ref(),
    );

    let response = match route {
        RouteMatch::Health => health::health_handler(&state).into_response(),
        RouteMatch::Models => models::handler(&state, &parts.headers),
        RouteMatch::LeaseStats => lease::stats_handler(&state, &parts.headers),
        RouteMatch::ChatCompletions => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            chat::handler(state, parts.headers, body_bytes).await
        }
        RouteMatch::StreamPrepare => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            lease::prepare_handler(state, &parts.headers, &body_bytes).await
        }
        RouteMatch::StreamRelease => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            lease::release_handler(state, &parts.headers, &body_bytes).await
        }
        RouteMatch::Responses => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            responses::handler(state, parts.headers, body_bytes).await
        }
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 2MiB)",
            )
                .into_response()
        })
}

/// `true` when the query carries `name` with a truthy value.
fn query_flag(query: Option<&str>, name: &str) -> bool {
    let Some(query) = query else {
        return false;
    };
    url::form_urlencoded::parse(query.as_bytes()).any(|(key, value)| {
        key == name && matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
    })
}

fn match_route(method: &Method, path: &str, query: Option<&str>, base_path: &str) -> RouteMatch {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    let expect = |allowed: Method, route: RouteMatch| {
        if method == allowed {
            route
        } else {
            RouteMatch::MethodNotAllowed
        }
    };
    match path {
        "/" => expect(Method::GET, RouteMatch::Health),
        "/v1/models" => expect(Method::GET, RouteMatch::Models),
        "/v1/leases" => expect(Method::GET, RouteMatch::LeaseStats),
        "/v1/responses" => expect(Method::POST, RouteMatch::Responses),
        "/v1/chat/completions" => {
            let route = if query_flag(query, STREAM_PREPARE_PARAM) {
                RouteMatch::StreamPrepare
            } else if query_flag(query, STREAM_RELEASE_PARAM) {
                RouteMatch::StreamRelease
            } else {
                RouteMatch::ChatCompletions
            };
            expect(Method::POST, route)
        }
        _ => RouteMatch::NotFound,
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') {
        Some(remainder)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_is_normalized() {
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path("api/"), "/api");
        assert_eq!(normalize_base_path(" /api/ "), "/api");
    }

    #[test]
    fn routes_respect_base_path() {
        assert_eq!(
            match_route(&Method::POST, "/api/v1/chat/completions", None, "/api"),
            RouteMatch::ChatCompletions
        );
        assert_eq!(
            match_route(&Method::GET, "/api", None, "/api"),
            RouteMatch::Health
        );
        assert_eq!(
            match_route(&Method::POST, "/apiv1/responses", None, "/api"),
            RouteMatch::NotFound
        );
    }

    #[test]
    fn lease_flags_select_internal_routes() {
        assert_eq!(
            match_route(&Method::POST, "/v1/chat/completions", Some("__stream_prepare=1"), ""),
            RouteMatch::StreamPrepare
        );
        assert_eq!(
            match_route(&Method::POST, "/v1/chat/completions", Some("x=2&__stream_release=true"), ""),
            RouteMatch::StreamRelease
        );
        assert_eq!(
            match_route(&Method::POST, "/v1/chat/completions", Some("__stream_prepare=0"), ""),
            RouteMatch::ChatCompletions
        );
    }

    #[test]
    fn wrong_method_is_rejected() {
        assert_eq!(
            match_route(&Method::GET, "/v1/chat/completions", None, ""),
            RouteMatch::MethodNotAllowed
        );
        assert_eq!(
            match_route(&Method::POST, "/v1/models", None, ""),
            RouteMatch::MethodNotAllowed
        );
        assert_eq!(
            match_route(&Method::GET, "/v1/unknown", None, ""),
            RouteMatch::NotFound
        );
    }
}
