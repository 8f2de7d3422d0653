use rustc_hash::FxHashSet;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_allowed_keys(config)?;
    validate_accounts(config)?;
    validate_upstream(config)?;
    validate_stream(config)?;
    validate_log_level(config)?;
    validate_lease(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_allowed_keys(config: &AppConfig) -> Result<(), ConfigError> {
    if config.client_authentication.allowed_keys.is_empty() {
        return Err(validation_err("allowed_keys cannot be empty"));
    }
    for key in &config.client_authentication.allowed_keys {
        if key.trim().is_empty() {
            return Err(validation_err("allowed_keys contains an empty key"));
        }
    }
    Ok(())
}

fn validate_accounts(config: &AppConfig) -> Result<(), ConfigError> {
    if config.accounts.is_empty() {
        return Err(validation_err("accounts cannot be empty"));
    }
    let mut seen = FxHashSet::default();
    for (position, account) in config.accounts.iter().enumerate() {
        let id = account.identifier();
        if id.is_empty() {
            return Err(validation_err(format!(
                "accounts[{position}]: email or mobile is required"
            )));
        }
        if account.token.trim().is_empty() {
            return Err(validation_err(format!("Account '{id}': token cannot be empty")));
        }
        if !seen.insert(id) {
            return Err(validation_err(format!("Account '{id}' is listed twice")));
        }
    }
    Ok(())
}

fn validate_http_url(field_name: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(validation_err(format!("{field_name} cannot be empty when set")));
    }
    let parsed = url::Url::parse(value)
        .map_err(|err| validation_err(format!("{field_name} is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    validate_http_url("upstream.base_url", &upstream.base_url)?;
    if let Some(solver) = upstream.challenge_solver_url.as_deref() {
        validate_http_url("upstream.challenge_solver_url", solver)?;
    }
    Ok(())
}

fn validate_stream(config: &AppConfig) -> Result<(), ConfigError> {
    let stream = &config.stream;
    if stream.keep_alive_interval_secs == 0 {
        return Err(validation_err(
            "stream.keep_alive_interval_secs must be greater than 0",
        ));
    }
    if stream.idle_timeout_secs < stream.keep_alive_interval_secs {
        return Err(validation_err(
            "stream.idle_timeout_secs must not be shorter than stream.keep_alive_interval_secs",
        ));
    }
    if stream.max_capture_bytes < 1024 {
        return Err(validation_err("stream.max_capture_bytes must be at least 1024"));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_lease(config: &AppConfig) -> Result<(), ConfigError> {
    let lease = &config.lease;
    if lease.ttl_secs == 0 {
        return Err(validation_err("lease.ttl_secs must be greater than 0"));
    }
    if let Some(secret) = lease.internal_secret.as_deref() {
        if secret.trim().is_empty() {
            return Err(validation_err(
                "lease.internal_secret cannot be empty when set",
            ));
        }
    }
    Ok(())
}
