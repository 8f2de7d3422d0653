//! Public model names and the upstream switches each one selects.

use crate::error::GatewayError;
use serde_json::{json, Value};

const MODEL_CREATED: u64 = 1_677_610_602;
const MODEL_OWNER: &str = "deepseek";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub id: &'static str,
    pub thinking_enabled: bool,
    pub search_enabled: bool,
}

pub const MODELS: &[ModelProfile] = &[
    ModelProfile {
        id: "deepseek-chat",
        thinking_enabled: false,
        search_enabled: false,
    },
    ModelProfile {
        id: "deepseek-reasoner",
        thinking_enabled: true,
        search_enabled: false,
    },
    ModelProfile {
        id: "deepseek-chat-search",
        thinking_enabled: false,
        search_enabled: true,
    },
    ModelProfile {
        id: "deepseek-reasoner-search",
        thinking_enabled: true,
        search_enabled: true,
    },
];

/// Case-insensitive lookup.
pub fn resolve_model(name: &str) -> Result<&'static ModelProfile, GatewayError> {
    let name = name.trim();
    MODELS
        .iter()
        .find(|profile| profile.id.eq_ignore_ascii_case(name))
        .ok_or_else(|| GatewayError::ModelUnavailable(format!("model '{name}' is not available")))
}

/// `GET /v1/models` body.
#[must_use]
pub fn models_list_json() -> Value {
    let data: Vec<Value> = MODELS
        .iter()
        .map(|profile| {
            json!({
                "id": profile.id,
                "object": "model",
                "created": MODEL_CREATED,
                "owned_by": MODEL_OWNER,
                "permission": [],
            })
        })
        .collect();
    json!({"object": "list", "data": data})
}
