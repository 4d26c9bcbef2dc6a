//! Shared ingress state.

use dfm::config::SiteConfig;
use dfm::registry::ApiRegistry;
use dfm_broker::RequestStore;
use std::sync::Arc;
use std::time::Duration;

/// State shared across the ingress handlers. Everything but the broker
/// behind the store is read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub store: RequestStore,
    pub registry: Arc<ApiRegistry>,
    pub site: Arc<SiteConfig>,
    /// Server-side bound on how long `responses` may hold a poll open.
    pub response_poll_cap: Duration,
    /// Bearer token required on every endpoint except the probes. Unset
    /// means open access.
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(store: RequestStore, registry: Arc<ApiRegistry>, site: Arc<SiteConfig>) -> Self {
        Self {
            store,
            registry,
            site,
            response_poll_cap: Duration::from_secs(5),
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_response_poll_cap(mut self, cap: Duration) -> Self {
        self.response_poll_cap = cap;
        self
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}
