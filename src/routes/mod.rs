//! Router assembly. Each handler group gets exactly the middleware slice
//! it needs (spec §4.4's chain is not uniform across endpoints), then the
//! groups are merged and request logging wraps the whole thing last so it
//! sees every request regardless of which inner group handled it.

pub mod agents;
pub mod backups;
pub mod health;

use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::{admin_key, bearer_auth, register_rate_limit};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/healthz", get(health::healthz));

    let register = Router::new()
        .route("/v1/agents/register", post(agents::register))
        .layer(from_fn_with_state(state.clone(), register_rate_limit));

    // RequireActive (spec §4.4 stage 4) is enforced inline in the mutating
    // handlers themselves rather than as path-keyed middleware, since some
    // of these paths are shared with a read-only sibling method that must
    // stay open to pending/suspended agents.
    let authenticated = Router::new()
        .route("/v1/agents/me", get(agents::me))
        .route("/v1/agents/me/rotate-token", post(agents::rotate_token))
        .route("/v1/backups", get(backups::list).delete(backups::delete_all))
        .route(
            "/v1/backups/:timestamp",
            get(backups::get).delete(backups::delete_one),
        )
        .route("/v1/backups/upload-url", post(backups::upload_url))
        .route("/v1/backups/download-url", post(backups::download_url))
        .route("/v1/backups/:timestamp/undelete", post(backups::undelete))
        .layer(from_fn_with_state(state.clone(), bearer_auth));

    let admin = Router::new()
        .route("/v1/admin/agents", get(agents::admin_list))
        .route("/v1/admin/agents/:id/approve", post(agents::admin_approve))
        .route("/v1/admin/agents/:id/suspend", post(agents::admin_suspend))
        .layer(from_fn_with_state(state.clone(), admin_key));

    public
        .merge(register)
        .merge(authenticated)
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
