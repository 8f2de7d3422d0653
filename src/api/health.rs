use axum::response::Json;
use serde_json::{json, Value};

use crate::models::MODELS;
use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and a pool summary.
pub fn health_handler(state: &AppState) -> Json<Value> {
    let config = &state.config;
    let pool = state.pool.status();
    Json(json!({
        "status": "ds2api-rs is running",
        "config": {
            "client_keys_count": config.client_authentication.allowed_keys.len(),
            "models_count": MODELS.len(),
            "accounts": {
                "total": pool.total,
                "available": pool.available,
                "in_use": pool.in_use,
            },
            "features": {
                "log_level": config.features.log_level,
                "toolcall_feature_match": config.features.toolcall_feature_match,
                "toolcall_early_emit": config.features.toolcall_early_emit,
            },
            "leases_enabled": config.lease.internal_secret.is_some(),
        }
    }))
}
