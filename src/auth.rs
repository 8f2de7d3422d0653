use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::util::secrets_match;
use http::header::{HeaderName, AUTHORIZATION};
use rustc_hash::FxHashSet;

/// Header carrying the shared secret for the lease endpoints.
pub const INTERNAL_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-ds2-internal-token");

/// Compact key index used in hot-path authentication.
#[derive(Debug)]
pub enum AllowedClientKeys {
    Empty,
    Single(Box<str>),
    Multiple(FxHashSet<String>),
}

#[must_use]
pub fn build_allowed_key_set(config: &AppConfig) -> AllowedClientKeys {
    let keys: FxHashSet<String> = config
        .client_authentication
        .allowed_keys
        .iter()
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect();
    match keys.len() {
        0 => AllowedClientKeys::Empty,
        1 => keys
            .into_iter()
            .next()
            .map_or(AllowedClientKeys::Empty, |key| {
                AllowedClientKeys::Single(key.into_boxed_str())
            }),
        _ => AllowedClientKeys::Multiple(keys),
    }
}

/// `Authorization: Bearer <key>`.
///
/// # Errors
///
/// Returns `GatewayError::Auth` when the header is absent or not a bearer token.
pub fn extract_bearer(headers: &http::HeaderMap) -> Result<&str, GatewayError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| GatewayError::Auth("Missing API key".to_string()))
}

/// Authenticate an incoming request against the configured client keys.
///
/// # Errors
///
/// Returns `GatewayError::Auth` when the API key is missing or invalid.
pub fn authenticate(
    headers: &http::HeaderMap,
    allowed_keys: &AllowedClientKeys,
) -> Result<(), GatewayError> {
    let client_key = extract_bearer(headers)?;
    let accepted = match allowed_keys {
        AllowedClientKeys::Single(key) => secrets_match(client_key, key),
        AllowedClientKeys::Multiple(allowed_set) => allowed_set.contains(client_key),
        AllowedClientKeys::Empty => false,
    };
    if accepted {
        Ok(())
    } else {
        Err(GatewayError::Auth("Invalid API key".to_string()))
    }
}

/// Check the internal secret used by the lease endpoints. Without a
/// configured secret those endpoints are closed.
///
/// # Errors
///
/// Returns `GatewayError::Auth` when the secret is unset, missing or wrong.
pub fn authenticate_internal(
    headers: &http::HeaderMap,
    secret: Option<&str>,
) -> Result<(), GatewayError> {
    let Some(secret) = secret.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(GatewayError::Auth("internal endpoints are disabled".to_string()));
    };
    let provided = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or_else(|| GatewayError::Auth("Missing internal token".to_string()))?;
    if secrets_match(provided, secret) {
        Ok(())
    } else {
        Err(GatewayError::Auth("Invalid internal token".to_string()))
    }
}
