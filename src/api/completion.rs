//! Shared flow behind `/v1/chat/completions` and `/v1/responses`.

use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::account::{Account, PooledAccount};
use crate::error::{ErrorCategory, GatewayError};
use crate::protocol::{ChatRenderer, PreparedRequest, ResponsesRenderer};
use crate::state::AppState;
use crate::stream::driver::{drive, DriverSettings};
use crate::stream::{ChannelSink, DiscardSink, SseSink, StreamOptions, StreamRenderer, StreamRuntime};
use crate::toolcall::ToolNameFilter;
use crate::upstream::{completion_payload, ByteStream};

/// Pins a request to one configured account.
pub const TARGET_ACCOUNT_HEADER: &str = "x-ds2-target-account";

const SSE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientProtocol {
    Chat,
    Responses,
}

/// Session id and solved challenge for one account.
pub(crate) struct UpstreamSetup {
    pub session_id: String,
    pub challenge: String,
    pub payload: Value,
}

pub(crate) fn target_account(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(TARGET_ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) async fn setup_upstream(
    state: &AppState,
    account: &Account,
    prepared: &PreparedRequest,
) -> Result<UpstreamSetup, GatewayError> {
    let upstream = &state.config.upstream;
    let session_id = state
        .backend
        .create_session(account, upstream.session_retries)
        .await?;
    let challenge = state
        .backend
        .challenge_header(account, upstream.challenge_retries)
        .await?;
    let payload = completion_payload(
        &session_id,
        &prepared.prompt,
        prepared.model.thinking_enabled,
        prepared.model.search_enabled,
    );
    Ok(UpstreamSetup {
        session_id,
        challenge,
        payload,
    })
}

/// Acquire an account and run `attempt` with it. Accounts whose token the
/// upstream rejects are skipped in favour of the next one, unless the client
/// pinned a specific account.
pub(crate) async fn with_account<T, F, Fut>(
    state: &AppState,
    target: Option<&str>,
    mut attempt: F,
) -> Result<(PooledAccount, T), GatewayError>
where
    F: FnMut(PooledAccount) -> Fut,
    Fut: std::future::Future<Output = (PooledAccount, Result<T, GatewayError>)>,
{
    let mut exclude: FxHashSet<String> = FxHashSet::default();
    loop {
        let Some(account) = state.pool.acquire(target, &exclude) else {
            return Err(match target {
                Some(target) => GatewayError::RateLimited(format!("account '{target}' is busy or unknown")),
                None => GatewayError::RateLimited("no upstream account available".to_string()),
            });
        };
        let (account, result) = attempt(account).await;
        match result {
            Ok(value) => return Ok((account, value)),
            Err(err) if target.is_none() && err.category() == ErrorCategory::Authentication => {
                warn!(account = %account.id(), error = %err, "account rejected upstream, trying next");
                exclude.insert(account.id().to_string());
            }
            Err(err) => return Err(err),
        }
    }
}

async fn open_completion(
    state: &AppState,
    prepared: &PreparedRequest,
    target: Option<&str>,
) -> Result<(PooledAccount, ByteStream), GatewayError> {
    with_account(state, target, |account| async move {
        let result = async {
            let setup = setup_upstream(state, account.account(), prepared).await?;
            debug!(account = %account.id(), session = %setup.session_id, "upstream session ready");
            state
                .backend
                .open_completion(account.account(), &setup.challenge, &setup.payload)
                .await
        }
        .await;
        (account, result)
    })
    .await
}

pub(crate) fn stream_options(state: &AppState, prepared: &PreparedRequest) -> StreamOptions {
    let features = &state.config.features;
    let tool_names = ToolNameFilter::new(prepared.tool_names.iter().cloned());
    let mut options = StreamOptions::new(prepared.model.id, prepared.prompt.clone());
    options.thinking_enabled = prepared.model.thinking_enabled;
    options.search_enabled = prepared.model.search_enabled;
    options.buffer_tool_content = features.toolcall_feature_match && !tool_names.is_empty();
    options.emit_early_tool_deltas = features.toolcall_early_emit;
    options.max_capture_bytes = state.config.stream.max_capture_bytes;
    options.tool_names = tool_names;
    options
}

async fn run_stream<R, S>(
    renderer: R,
    sink: S,
    options: StreamOptions,
    body: ByteStream,
    settings: DriverSettings,
) -> Option<Value>
where
    R: StreamRenderer,
    S: SseSink,
{
    let thinking_enabled = options.thinking_enabled;
    let mut runtime = StreamRuntime::new(renderer, sink, options);
    let (record, outcome) = drive(&mut runtime, body, thinking_enabled, settings).await;
    debug!(?outcome, "stream finished");
    record
}

async fn run_for_protocol<S: SseSink>(
    protocol: ClientProtocol,
    sink: S,
    options: StreamOptions,
    body: ByteStream,
    settings: DriverSettings,
) -> Option<Value> {
    let model = options.model.clone();
    match protocol {
        ClientProtocol::Chat => {
            run_stream(ChatRenderer::new(model), sink, options, body, settings).await
        }
        ClientProtocol::Responses => {
            run_stream(ResponsesRenderer::new(model), sink, options, body, settings).await
        }
    }
}

/// SSE response headers for a streaming completion.
pub(crate) fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    headers.insert("x-accel-buffering", http::HeaderValue::from_static("no"));
    response
}

pub(crate) async fn handle_completion(
    state: Arc<AppState>,
    headers: &http::HeaderMap,
    body: &Bytes,
    protocol: ClientProtocol,
) -> Response {
    if let Err(err) = state.authenticate(headers) {
        return err.into_response();
    }
    let prepared = match protocol {
        ClientProtocol::Chat => crate::protocol::prepare_chat_request(body),
        ClientProtocol::Responses => crate::protocol::prepare_responses_request(body),
    };
    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(err) => return err.into_response(),
    };
    let request_id = state.next_request_id();
    info!(
        %request_id,
        model = prepared.model.id,
        stream = prepared.stream,
        tools = prepared.tool_names.len(),
        "completion request"
    );

    let (account, upstream) = match open_completion(&state, &prepared, target_account(headers)).await {
        Ok(opened) => opened,
        Err(err) => {
            warn!(%request_id, error = %err, "upstream setup failed");
            return err.into_response();
        }
    };
    let options = stream_options(&state, &prepared);
    let settings = state.driver_settings();

    if prepared.stream {
        let (sink, frames) = ChannelSink::new(SSE_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            run_for_protocol(protocol, sink, options, upstream, settings).await;
            account.release();
            debug!(%request_id, "stream task ended");
        });
        return sse_ok_response(Body::from_stream(frames));
    }

    let record = run_for_protocol(protocol, DiscardSink, options, upstream, settings).await;
    account.release();
    match record {
        Some(record) => Json(record).into_response(),
        None => GatewayError::Internal("completion produced no result".to_string()).into_response(),
    }
}
