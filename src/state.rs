mod request_id;

use std::sync::Arc;
use std::time::Duration;

use crate::account::AccountPool;
use crate::auth::{authenticate, authenticate_internal, build_allowed_key_set, AllowedClientKeys};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::lease::LeaseTable;
use crate::stream::driver::DriverSettings;
use crate::upstream::UpstreamBackend;

use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub pool: Arc<AccountPool>,
    pub leases: Arc<LeaseTable>,
    pub backend: Arc<dyn UpstreamBackend>,
    allowed_client_keys: AllowedClientKeys,
    request_ids: RequestIdGenerator,
    driver_settings: DriverSettings,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, backend: Arc<dyn UpstreamBackend>) -> Self {
        let allowed_client_keys = build_allowed_key_set(&config);
        let pool = AccountPool::new(&config.accounts);
        let leases = LeaseTable::new(
            Duration::from_secs(config.lease.ttl_secs),
            Duration::from_secs(config.lease.effective_sweep_interval_secs()),
        );
        let driver_settings = DriverSettings::from_config(&config.stream);
        Self {
            config,
            pool,
            leases,
            backend,
            allowed_client_keys,
            request_ids: RequestIdGenerator::new(),
            driver_settings,
        }
    }

    /// Authenticate a client request using the prebuilt key index.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Auth` when the API key is missing or invalid.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<(), GatewayError> {
        authenticate(headers, &self.allowed_client_keys)
    }

    /// # Errors
    ///
    /// Returns `GatewayError::Auth` unless the internal secret is configured
    /// and presented.
    pub fn authenticate_internal(&self, headers: &http::HeaderMap) -> Result<(), GatewayError> {
        authenticate_internal(headers, self.config.lease.internal_secret.as_deref())
    }

    #[must_use]
    pub fn next_request_id(&self) -> uuid::Uuid {
        self.request_ids.next_id()
    }

    #[must_use]
    pub fn driver_settings(&self) -> DriverSettings {
        self.driver_settings
    }
}
