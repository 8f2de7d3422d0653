//! Calls into the upstream chat service.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::retry::{backoff_delay, retry_delay, should_retry_status, should_retry_transport_message};
use crate::account::Account;
use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::{ErrorCategory, GatewayError};

pub type ByteStream = BoxStream<'static, Result<Bytes, GatewayError>>;

const SESSION_PATH: &str = "/api/v0/chat_session/create";
const CHALLENGE_PATH: &str = "/api/v0/chat/create_pow_challenge";
const COMPLETION_PATH: &str = "/api/v0/chat/completion";
const POW_RESPONSE_HEADER: &str = "x-ds-pow-response";
const CLIENT_VERSION: &str = "1.3.0-auto-resume";
const USER_AGENT: &str = "DeepSeek/1.3.0 Android/35";
/// Business code the upstream uses for an expired or revoked token.
const INVALID_TOKEN_CODE: i64 = 40003;

/// The three calls a completion needs.
#[async_trait]
pub trait UpstreamBackend: Send + Sync {
    /// Returns the new chat session id.
    async fn create_session(&self, account: &Account, retries: u32) -> Result<String, GatewayError>;

    /// Returns the value for the proof-of-work response header.
    async fn challenge_header(&self, account: &Account, retries: u32)
        -> Result<String, GatewayError>;

    async fn open_completion(
        &self,
        account: &Account,
        challenge: &str,
        payload: &Value,
    ) -> Result<ByteStream, GatewayError>;
}

/// Completion request body.
#[must_use]
pub fn completion_payload(
    session_id: &str,
    prompt: &str,
    thinking_enabled: bool,
    search_enabled: bool,
) -> Value {
    json!({
        "chat_session_id": session_id,
        "parent_message_id": null,
        "prompt": prompt,
        "ref_file_ids": [],
        "thinking_enabled": thinking_enabled,
        "search_enabled": search_enabled,
    })
}

pub struct HttpBackend {
    client: reqwest::Client,
    /// Completion streams run without a whole-request timeout.
    stream_client: reqwest::Client,
    base_url: String,
    solver_url: Option<String>,
    completion_retries: u32,
}

fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))
}

impl HttpBackend {
    /// # Errors
    ///
    /// Returns `GatewayError::Transport` when the HTTP client cannot be built.
    pub fn new(server: &ServerConfig, upstream: &UpstreamConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            client: build_client(Some(Duration::from_secs(server.timeout)))?,
            stream_client: build_client(None)?,
            base_url: upstream.base_url.trim_end_matches('/').to_string(),
            solver_url: upstream.challenge_solver_url.clone(),
            completion_retries: upstream.completion_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder, account: &Account) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&account.token)
            .header("x-client-platform", "android")
            .header("x-client-version", CLIENT_VERSION)
    }

    /// POST JSON and return the `data.biz_data` object, retrying transient
    /// failures.
    async fn post_biz(
        &self,
        account: &Account,
        path: &str,
        body: &Value,
        retries: u32,
    ) -> Result<Value, GatewayError> {
        let attempts = retries.max(1);
        let mut last_error = GatewayError::Internal(format!("no attempt made for {path}"));
        for attempt in 0..attempts {
            let request = self.authorized(self.client.post(self.url(path)), account).json(body);
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    let message = err.to_string();
                    last_error = GatewayError::Transport(message.clone());
                    if attempt + 1 < attempts && should_retry_transport_message(&message) {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    break;
                }
            };
            let status = response.status();
            if !status.is_success() {
                let delay = retry_delay(response.headers(), attempt);
                let text = response.text().await.unwrap_or_default();
                last_error = GatewayError::setup(status.as_u16(), format!("{path}: {status} {text}"));
                if attempt + 1 < attempts && should_retry_status(status) {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                break;
            }
            let body: Value = response.json().await?;
            match biz_data(&body) {
                Ok(data) => return Ok(data),
                Err(err) => {
                    last_error = err;
                    if attempt + 1 >= attempts
                        || matches!(last_error.category(), ErrorCategory::Authentication)
                    {
                        break;
                    }
                    debug!(account = %account.id, path, attempt, "upstream business error, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
        warn!(account = %account.id, path, error = %last_error, "upstream setup call failed");
        Err(last_error)
    }

    async fn solve_challenge(&self, challenge: &Value) -> Result<String, GatewayError> {
        let Some(solver_url) = self.solver_url.as_deref() else {
            return Err(GatewayError::Setup {
                category: ErrorCategory::ServerError,
                message: "upstream.challenge_solver_url is not configured".to_string(),
            });
        };
        let response = self
            .client
            .post(solver_url)
            .json(&json!({"challenge": challenge}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Setup {
                category: ErrorCategory::ServerError,
                message: format!("challenge solver returned {status}"),
            });
        }
        let body: Value = response.json().await?;
        body.get("header")
            .and_then(Value::as_str)
            .filter(|header| !header.is_empty())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Setup {
                category: ErrorCategory::ServerError,
                message: "challenge solver response has no header".to_string(),
            })
    }
}

/// Unwrap `{"code":0,"data":{"biz_code":0,"biz_data":{...}}}`.
fn biz_data(body: &Value) -> Result<Value, GatewayError> {
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = body
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("upstream rejected the request");
    if code == INVALID_TOKEN_CODE {
        return Err(GatewayError::Setup {
            category: ErrorCategory::Authentication,
            message: format!("account token rejected: {message}"),
        });
    }
    if code != 0 {
        return Err(GatewayError::setup(502, format!("code {code}: {message}")));
    }
    let data = body.get("data").unwrap_or(&Value::Null);
    let biz_code = data.get("biz_code").and_then(Value::as_i64).unwrap_or(0);
    if biz_code != 0 {
        let biz_msg = data.get("biz_msg").and_then(Value::as_str).unwrap_or(message);
        return Err(GatewayError::setup(502, format!("biz_code {biz_code}: {biz_msg}")));
    }
    data.get("biz_data")
        .cloned()
        .ok_or_else(|| GatewayError::setup(502, "response has no biz_data"))
}

#[async_trait]
impl UpstreamBackend for HttpBackend {
    async fn create_session(&self, account: &Account, retries: u32) -> Result<String, GatewayError> {
        let data = self
            .post_biz(account, SESSION_PATH, &json!({"agent": "chat"}), retries)
            .await?;
        data.get("id")
            .or_else(|| data.pointer("/chat_session/id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::setup(502, "session response has no id"))
    }

    async fn challenge_header(
        &self,
        account: &Account,
        retries: u32,
    ) -> Result<String, GatewayError> {
        let data = self
            .post_biz(
                account,
                CHALLENGE_PATH,
                &json!({"target_path": COMPLETION_PATH}),
                retries,
            )
            .await?;
        let challenge = data
            .get("challenge")
            .ok_or_else(|| GatewayError::setup(502, "challenge response has no challenge"))?;
        self.solve_challenge(challenge).await
    }

    async fn open_completion(
        &self,
        account: &Account,
        challenge: &str,
        payload: &Value,
    ) -> Result<ByteStream, GatewayError> {
        let attempts = self.completion_retries.max(1);
        let mut last_error = GatewayError::Internal("no completion attempt made".to_string());
        for attempt in 0..attempts {
            let request = self
                .authorized(self.stream_client.post(self.url(COMPLETION_PATH)), account)
                .header(POW_RESPONSE_HEADER, challenge)
                .json(payload);
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response
                        .bytes_stream()
                        .map(|chunk| chunk.map_err(GatewayError::from))
                        .boxed());
                }
                Ok(response) => {
                    let status = response.status();
                    let delay = retry_delay(response.headers(), attempt);
                    last_error = GatewayError::setup(status.as_u16(), format!("completion: {status}"));
                    if attempt + 1 < attempts && should_retry_status(status) {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break;
                }
                Err(err) => {
                    let message = err.to_string();
                    last_error = GatewayError::Transport(message.clone());
                    if attempt + 1 < attempts && should_retry_transport_message(&message) {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    break;
                }
            }
        }
        warn!(account = %account.id, error = %last_error, "completion request failed");
        Err(last_error)
    }
}
