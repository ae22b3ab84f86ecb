use crate::registry::TicketRegistry;
use crate::ticket::PolicySet;
use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, instrument};

/// Ticket counts per kind, expired ones included until the cleaner runs.
#[instrument(skip(registry))]
pub async fn stats(registry: Extension<TicketRegistry>) -> Response {
    match registry.0.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => {
            error!("Failed to collect registry stats: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "registry unavailable" })),
            )
                .into_response()
        }
    }
}

/// Policies bound to newly created tickets. Stored tickets keep the policy
/// they were created with.
pub async fn policies(policies: Extension<Arc<PolicySet>>) -> Json<PolicySet> {
    Json(policies.0.as_ref().clone())
}
