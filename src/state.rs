//! Shared application state handed to every route via axum's `State`
//! extractor, the same shape the teacher wires up in its service layer:
//! one `Arc` per long-lived dependency, cheap to clone per request.

use std::sync::Arc;

use crate::broker::ObjectBroker;
use crate::config::Settings;
use crate::ratelimit::RateLimiter;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub broker: Arc<dyn ObjectBroker>,
    pub settings: Arc<Settings>,
    pub register_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn ObjectBroker>,
        settings: Arc<Settings>,
    ) -> Self {
        let register_limiter = Arc::new(RateLimiter::new(
            settings.register_rate_limit,
            std::time::Duration::from_secs(60),
        ));
        Self {
            store,
            broker,
            settings,
            register_limiter,
        }
    }
}
